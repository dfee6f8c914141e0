use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use crate::app::errors;
use crate::context::{RequesterContext, WorkerContext};

pub const USER_ID_HEADER: &str = "user-id";

#[derive(Clone, Debug)]
pub struct WorkerAuthState {
    /// Accepted bearer tokens. Empty means any non-empty bearer passes.
    pub tokens: Arc<Vec<String>>,
}

impl WorkerAuthState {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    fn accepts(&self, token: &str) -> bool {
        self.tokens.is_empty() || self.tokens.iter().any(|t| t == token)
    }
}

/// Gate worker-only routes. Runs before the handler so an unauthenticated
/// caller never triggers a job lookup.
pub async fn worker_auth_middleware(
    State(state): State<WorkerAuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_bearer(req.headers()) else {
        return errors::unauthorized();
    };
    if !state.accepts(token) {
        tracing::warn!("rejected worker token");
        return errors::unauthorized();
    }

    req.extensions_mut().insert(WorkerContext);
    next.run(req).await
}

/// Require the `user-id` header on requester routes.
pub async fn requester_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(user_id) = extract_user_id(req.headers()) else {
        return errors::unauthorized();
    };

    let ctx = RequesterContext::new(user_id);
    req.extensions_mut().insert(ctx);
    next.run(req).await
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

fn extract_user_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(USER_ID_HEADER)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header::AUTHORIZATION};

    #[test]
    fn bearer_is_extracted_and_trimmed() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(extract_bearer(&headers), Some("abc"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer(&headers), None);
    }

    #[test]
    fn empty_token_list_accepts_any_bearer() {
        assert!(WorkerAuthState::new(vec![]).accepts("anything"));

        let state = WorkerAuthState::new(vec!["w1".into(), "w2".into()]);
        assert!(state.accepts("w2"));
        assert!(!state.accepts("w3"));
    }

    #[test]
    fn blank_user_id_is_missing() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(extract_user_id(&headers), None);

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(extract_user_id(&headers).as_deref(), Some("alice"));
    }
}
