/// Identity of the end user submitting or cancelling jobs.
///
/// Taken from the `user-id` header; present on every requester route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequesterContext {
    user_id: String,
}

impl RequesterContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Marker that the request carried an accepted worker bearer token.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WorkerContext;
