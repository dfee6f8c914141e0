//! `ASSET_GENERATION` handler.
//!
//! Redelivery is expected. The job row decides what to do, not the message:
//! a terminal job is settled without calling the provider, and completion is
//! idempotent on `storage_key`, so a duplicate delivery that races the first
//! one ends with at most one asset.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use lorekeeper_core::{AssetCreateSpec, AssetType, JobStatus, hashing::sha256_hex};
use lorekeeper_queue::{AssetGenerationPayload, QueueEnvelope, ReceivedMessage};

use crate::consumer::{HandlerError, JobHandler};
use crate::error::PipelineError;
use crate::worker::WorkerService;

/// What a provider hands back for a finished generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAsset {
    pub format: String,
    pub storage_key: String,
    pub content_type: String,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("provider temporarily unavailable: {0}")]
    Retryable(String),

    #[error("provider rejected request ({code}): {message}")]
    Permanent { code: String, message: String },
}

/// Calls out to a generation backend.
#[async_trait::async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(
        &self,
        payload: &AssetGenerationPayload,
    ) -> Result<GeneratedAsset, ProviderError>;
}

/// Deterministic provider for dev and tests.
///
/// The storage key depends only on the job id, so repeated generations of
/// the same job always describe the same artifact.
#[derive(Debug, Clone, Default)]
pub struct MockGenerationProvider;

impl MockGenerationProvider {
    fn file_kind(asset_type: AssetType) -> (&'static str, &'static str) {
        match asset_type {
            AssetType::Video => ("mp4", "video/mp4"),
            AssetType::Audio => ("mp3", "audio/mpeg"),
            AssetType::Image | AssetType::Map => ("png", "image/png"),
            AssetType::Pdf => ("pdf", "application/pdf"),
        }
    }
}

#[async_trait::async_trait]
impl GenerationProvider for MockGenerationProvider {
    async fn generate(
        &self,
        payload: &AssetGenerationPayload,
    ) -> Result<GeneratedAsset, ProviderError> {
        let (ext, content_type) = Self::file_kind(payload.asset_type);
        let storage_key = format!(
            "worlds/{}/assets/{}.{ext}",
            payload.world_id, payload.asset_job_id
        );
        let duration_seconds = matches!(payload.asset_type, AssetType::Video | AssetType::Audio)
            .then_some(30);
        Ok(GeneratedAsset {
            format: ext.to_string(),
            checksum: Some(sha256_hex(storage_key.as_bytes())),
            storage_key,
            content_type: content_type.to_string(),
            duration_seconds,
            size_bytes: Some(0),
            metadata: Some(serde_json::json!({
                "provider": payload.provider,
                "model_id": payload.model_id,
            })),
        })
    }
}

pub struct AssetGenerationHandler {
    worker: WorkerService,
    provider: Arc<dyn GenerationProvider>,
}

impl AssetGenerationHandler {
    pub fn new(worker: WorkerService, provider: Arc<dyn GenerationProvider>) -> Self {
        Self { worker, provider }
    }
}

#[async_trait::async_trait]
impl JobHandler for AssetGenerationHandler {
    #[instrument(
        skip(self, envelope, message),
        fields(message_id = %message.message_id, receive_count = message.receive_count),
        err
    )]
    async fn handle(
        &self,
        envelope: &QueueEnvelope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError> {
        let payload = AssetGenerationPayload::from_envelope(envelope)
            .map_err(|e| HandlerError::Permanent(format!("invalid payload: {e}")))?;
        let job_id = payload.asset_job_id;

        let view = match self.worker.get(job_id).await {
            Ok(view) => view,
            Err(PipelineError::NotFound(_)) => {
                return Err(HandlerError::Permanent(format!("asset job {job_id} not found")));
            }
            Err(e) => return Err(HandlerError::Retryable(e.to_string())),
        };

        if view.job.status.is_terminal() {
            info!(job_id = %job_id, status = %view.job.status, "job already settled; skipping");
            return Ok(());
        }

        if view.job.status == JobStatus::Queued {
            match self.worker.mark_running(job_id).await {
                Ok(_) => {}
                // Lost a race with another delivery or a cancel; re-read next time.
                Err(PipelineError::InvalidTransition { current, .. }) if current.is_terminal() => {
                    info!(job_id = %job_id, status = %current, "job settled concurrently");
                    return Ok(());
                }
                Err(PipelineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(HandlerError::Retryable(e.to_string())),
            }
        }

        let generated = match self.provider.generate(&payload).await {
            Ok(generated) => generated,
            Err(ProviderError::Retryable(reason)) => {
                return Err(HandlerError::Retryable(reason));
            }
            Err(ProviderError::Permanent { code, message }) => {
                warn!(job_id = %job_id, error_code = %code, "provider rejected job");
                return match self.worker.fail(job_id, &code, Some(message)).await {
                    Ok(_) | Err(PipelineError::InvalidTransition { .. }) => Ok(()),
                    Err(e) => Err(HandlerError::Retryable(e.to_string())),
                };
            }
        };

        let spec = AssetCreateSpec {
            world_id: payload.world_id,
            asset_type: payload.asset_type,
            format: generated.format,
            storage_key: generated.storage_key,
            content_type: generated.content_type,
            duration_seconds: generated.duration_seconds,
            size_bytes: generated.size_bytes,
            checksum: generated.checksum,
            metadata: generated.metadata,
            created_by: format!("provider:{}", payload.provider),
        };

        match self.worker.complete(job_id, spec).await {
            Ok(_) => Ok(()),
            Err(PipelineError::InvalidTransition { current, .. }) => {
                info!(job_id = %job_id, status = %current, "job settled before completion");
                Ok(())
            }
            Err(e @ (PipelineError::Validation(_) | PipelineError::Conflict(_))) => {
                Err(HandlerError::Permanent(e.to_string()))
            }
            Err(e) => Err(HandlerError::Retryable(e.to_string())),
        }
    }
}
