//! Service-boundary error for the pipeline.

use lorekeeper_core::{DomainError, JobStatus, LoreKind, WorldId};
use lorekeeper_queue::QueueError;

use crate::jobs::JobStoreError;
use crate::lore::LoreCatalogError;

/// Tagged result the HTTP layer pattern-matches on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("world not found: {0}")]
    WorldNotFound(WorldId),

    #[error("{kind} not found: {id}")]
    ReferenceNotFound { kind: String, id: String },

    #[error("scope violation: {0}")]
    ScopeViolation(String),

    #[error("unsupported asset type: {0}")]
    UnsupportedAssetType(String),

    #[error("prompt_spec must not be empty")]
    EmptyPromptSpec,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition from {current} to {attempted}")]
    InvalidTransition {
        current: JobStatus,
        attempted: JobStatus,
        allowed: Vec<JobStatus>,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn reference_not_found(kind: LoreKind, id: impl ToString) -> Self {
        Self::ReferenceNotFound {
            kind: kind.as_str().to_string(),
            id: id.to_string(),
        }
    }

    pub fn reference_not_found_named(kind: &str, id: impl ToString) -> Self {
        Self::ReferenceNotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::Validation(msg),
            DomainError::NotFound => Self::NotFound("resource".to_string()),
            DomainError::ScopeViolation(msg) => Self::ScopeViolation(msg),
            DomainError::InvalidTransition {
                current,
                attempted,
                allowed,
            } => Self::InvalidTransition {
                current,
                attempted,
                allowed,
            },
            DomainError::Conflict(msg) => Self::Conflict(msg),
        }
    }
}

impl From<JobStoreError> for PipelineError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(what) => Self::NotFound(what),
            JobStoreError::InvalidTransition {
                current,
                attempted,
                allowed,
            } => Self::InvalidTransition {
                current,
                attempted,
                allowed,
            },
            JobStoreError::Validation(msg) => Self::Validation(msg),
            JobStoreError::Conflict(msg) => Self::Conflict(msg),
            JobStoreError::Storage(msg) => Self::Storage(msg),
        }
    }
}

impl From<LoreCatalogError> for PipelineError {
    fn from(err: LoreCatalogError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<QueueError> for PipelineError {
    fn from(err: QueueError) -> Self {
        Self::QueueUnavailable(err.to_string())
    }
}
