//! Job submission: validate, capture provenance, dedupe, persist, publish.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use lorekeeper_core::{
    AssetDerivation, AssetJob, AssetType, DerivationId, HashInput, LoreReferences, WorldId,
    compute_input_hash, hashing,
};

use crate::error::PipelineError;
use crate::jobs::{AssetJobView, CreateOutcome, JobStore, NewAssetJob};
use crate::lore::LoreCatalog;
use crate::producer::JobProducer;
use crate::provenance::ProvenanceBuilder;

/// A request to generate one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub world_id: WorldId,
    /// Parsed case-sensitively against the supported types.
    pub asset_type: String,
    pub provider: String,
    #[serde(default)]
    pub model_id: Option<String>,
    pub prompt_spec: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default, flatten)]
    pub references: LoreReferences,
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Submitted {
    pub view: AssetJobView,
    /// `false` when an existing job was returned instead.
    pub created: bool,
}

#[derive(Clone)]
pub struct SubmissionService {
    jobs: Arc<dyn JobStore>,
    lore: Arc<dyn LoreCatalog>,
    producer: JobProducer,
    provenance: ProvenanceBuilder,
}

impl std::fmt::Debug for SubmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionService")
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

impl SubmissionService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        lore: Arc<dyn LoreCatalog>,
        producer: JobProducer,
        provenance: ProvenanceBuilder,
    ) -> Self {
        Self {
            jobs,
            lore,
            producer,
            provenance,
        }
    }

    /// Submit a generation request on behalf of `requested_by`.
    ///
    /// Identical requests (same world, type, provider, model, prompt and
    /// reference set) return the latest non-FAILED job without enqueueing
    /// anything. When the enqueue of a new job fails the job row stays
    /// QUEUED and `QueueUnavailable` is returned; the reconcile sweep picks
    /// it up later.
    #[instrument(
        skip(self, request),
        fields(world_id = %request.world_id, asset_type = %request.asset_type),
        err
    )]
    pub async fn submit(
        &self,
        request: SubmitRequest,
        requested_by: &str,
    ) -> Result<Submitted, PipelineError> {
        let requested_by = requested_by.trim();
        if requested_by.is_empty() {
            return Err(PipelineError::Validation("requested_by is required".into()));
        }
        let provider = request.provider.trim();
        if provider.is_empty() {
            return Err(PipelineError::Validation("provider is required".into()));
        }
        let asset_type: AssetType = request
            .asset_type
            .parse()
            .map_err(|_| PipelineError::UnsupportedAssetType(request.asset_type.clone()))?;
        if !request.prompt_spec.is_object() && !request.prompt_spec.is_null() {
            return Err(PipelineError::Validation(
                "prompt_spec must be a JSON object".into(),
            ));
        }
        if hashing::is_blank(&request.prompt_spec) {
            return Err(PipelineError::EmptyPromptSpec);
        }
        let model_id = request
            .model_id
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        let references = request.references.normalized();
        let now = Utc::now();
        let snapshot = self
            .provenance
            .capture(&*self.lore, request.world_id, &references, now)
            .await?;

        let input_hash = compute_input_hash(&HashInput {
            world_id: request.world_id,
            asset_type,
            provider,
            model_id: model_id.as_deref(),
            prompt_spec: &request.prompt_spec,
            references: &references,
            snapshot: self.provenance.is_drift_sensitive().then_some(&snapshot),
        });

        let job = AssetJob::queued(
            request.world_id,
            asset_type,
            provider,
            model_id,
            request.priority,
            requested_by,
            input_hash.clone(),
            request.prompt_spec.clone(),
            now,
        );
        let derivation = AssetDerivation {
            id: DerivationId::new(),
            asset_job_id: job.id,
            asset_id: None,
            source_id: references.source_id,
            prompt_spec: request.prompt_spec,
            input_hash,
            lore_snapshot: snapshot.to_json(),
            created_at: now,
        };

        let outcome = self
            .jobs
            .create_or_get(NewAssetJob {
                job,
                derivation,
                references,
            })
            .await?;

        match outcome {
            CreateOutcome::Existing(view) => {
                info!(job_id = %view.job.id, status = %view.job.status, "returning existing job");
                Ok(Submitted {
                    view,
                    created: false,
                })
            }
            CreateOutcome::Created(view) => {
                if let Err(e) = self.producer.publish(&view).await {
                    warn!(job_id = %view.job.id, error = %e, "enqueue failed; job left QUEUED");
                    return Err(PipelineError::QueueUnavailable(format!(
                        "job {} persisted but not enqueued: {e}",
                        view.job.id
                    )));
                }
                Ok(Submitted {
                    view,
                    created: true,
                })
            }
        }
    }
}
