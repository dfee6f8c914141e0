use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use lorekeeper_infra::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::WorldNotFound(world_id) => json_error(
            StatusCode::NOT_FOUND,
            "world_not_found",
            format!("world {world_id} not found"),
        ),
        e @ PipelineError::ReferenceNotFound { .. } => {
            json_error(StatusCode::NOT_FOUND, "reference_not_found", e.to_string())
        }
        PipelineError::ScopeViolation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "scope_violation", msg)
        }
        e @ PipelineError::UnsupportedAssetType(_) => {
            json_error(StatusCode::BAD_REQUEST, "unsupported_asset_type", e.to_string())
        }
        e @ PipelineError::EmptyPromptSpec => {
            json_error(StatusCode::BAD_REQUEST, "empty_prompt_spec", e.to_string())
        }
        PipelineError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        PipelineError::NotFound(msg) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("{msg} not found"))
        }
        PipelineError::InvalidTransition {
            current,
            attempted,
            allowed,
        } => (
            StatusCode::CONFLICT,
            axum::Json(json!({
                "error": "invalid_transition",
                "message": format!("cannot move job from {current} to {attempted}"),
                "current": current,
                "attempted": attempted,
                "allowed": allowed,
            })),
        )
            .into_response(),
        PipelineError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        PipelineError::QueueUnavailable(msg) => {
            tracing::warn!(error = %msg, "queue unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", msg)
        }
        PipelineError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "storage_error",
                "storage failure",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn bad_body(rejection: axum::extract::rejection::JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text())
}

pub fn unauthorized() -> axum::response::Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", "unauthorized")
}

pub fn invalid_id(what: &str) -> axum::response::Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "invalid_id",
        format!("invalid {what} id"),
    )
}
