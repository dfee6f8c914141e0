//! Domain error model.

use thiserror::Error;

use crate::job::JobStatus;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic failures (validation, scoping, the job
/// state machine, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,

    /// A referenced lore object lives in a different world than the job.
    #[error("scope violation: {0}")]
    ScopeViolation(String),

    /// The job state machine rejected a status change.
    #[error("invalid status transition from {current} to {attempted} (allowed: {})", format_allowed(.allowed))]
    InvalidTransition {
        current: JobStatus,
        attempted: JobStatus,
        allowed: Vec<JobStatus>,
    },

    /// A conflict occurred (e.g. a unique key already taken).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn scope_violation(msg: impl Into<String>) -> Self {
        Self::ScopeViolation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}

fn format_allowed(allowed: &[JobStatus]) -> String {
    if allowed.is_empty() {
        return "none, status is terminal".to_string();
    }
    allowed
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
