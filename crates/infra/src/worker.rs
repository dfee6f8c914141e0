//! Worker-facing job operations.
//!
//! Every method is a single store call so the read-validate-write happens
//! under the store's lock or row lock, never across two calls.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use lorekeeper_core::{AssetCreateSpec, AssetJobId, JobStatus, StatusChange};

use crate::error::PipelineError;
use crate::jobs::{AssetJobView, JobStore};

/// Partial status update sent by a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusPatch {
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub started_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Clone)]
pub struct WorkerService {
    jobs: Arc<dyn JobStore>,
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService").finish_non_exhaustive()
    }
}

impl WorkerService {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn get(&self, id: AssetJobId) -> Result<AssetJobView, PipelineError> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("asset job {id}")))
    }

    /// QUEUED -> RUNNING; stamps `started_at`.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn mark_running(&self, id: AssetJobId) -> Result<AssetJobView, PipelineError> {
        let view = self
            .jobs
            .apply_status_change(id, StatusChange::to(JobStatus::Running, Utc::now()))
            .await?;
        info!(job_id = %id, "job running");
        Ok(view)
    }

    /// Apply a PATCH-style update. SUCCEEDED must go through `complete`.
    #[instrument(skip(self, patch), fields(job_id = %id), err)]
    pub async fn patch(
        &self,
        id: AssetJobId,
        patch: StatusPatch,
    ) -> Result<AssetJobView, PipelineError> {
        let status = patch
            .status
            .ok_or_else(|| PipelineError::Validation("status is required".into()))?;
        let change = StatusChange {
            status,
            started_at: patch.started_at,
            finished_at: patch.finished_at,
            error_code: patch.error_code,
            error_message: patch.error_message,
            now: Utc::now(),
        };
        Ok(self.jobs.apply_status_change(id, change).await?)
    }

    /// Record the produced asset and mark the job SUCCEEDED.
    ///
    /// Replays with the same `storage_key` return the existing result.
    #[instrument(skip(self, spec), fields(job_id = %id, storage_key = %spec.storage_key), err)]
    pub async fn complete(
        &self,
        id: AssetJobId,
        spec: AssetCreateSpec,
    ) -> Result<AssetJobView, PipelineError> {
        let view = self.jobs.complete(id, spec, Utc::now()).await?;
        info!(
            job_id = %id,
            asset_id = ?view.asset.as_ref().map(|a| a.id),
            "job succeeded"
        );
        Ok(view)
    }

    /// RUNNING -> FAILED with an error code.
    #[instrument(skip(self, message), fields(job_id = %id, error_code = %error_code), err)]
    pub async fn fail(
        &self,
        id: AssetJobId,
        error_code: &str,
        message: Option<String>,
    ) -> Result<AssetJobView, PipelineError> {
        if error_code.trim().is_empty() {
            return Err(PipelineError::Validation("error_code is required".into()));
        }
        let mut change = StatusChange::to(JobStatus::Failed, Utc::now());
        change.error_code = Some(error_code.trim().to_string());
        change.error_message = message;
        let view = self.jobs.apply_status_change(id, change).await?;
        info!(job_id = %id, error_code = %error_code, "job failed");
        Ok(view)
    }

    /// Move a job whose message is being given up on to FAILED.
    ///
    /// A QUEUED job is started first so the FAILED transition is legal.
    /// Returns `None` when the job is gone or already terminal.
    #[instrument(skip(self, reason), fields(job_id = %id, error_code = %error_code), err)]
    pub async fn settle_undeliverable(
        &self,
        id: AssetJobId,
        error_code: &str,
        reason: &str,
    ) -> Result<Option<AssetJobView>, PipelineError> {
        let view = match self.get(id).await {
            Ok(view) => view,
            Err(PipelineError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if view.job.status.is_terminal() {
            return Ok(None);
        }
        if view.job.status == JobStatus::Queued {
            match self.mark_running(id).await {
                Ok(_) | Err(PipelineError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        match self.fail(id, error_code, Some(reason.to_string())).await {
            Ok(view) => Ok(Some(view)),
            Err(PipelineError::InvalidTransition { current, .. }) if current.is_terminal() => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// QUEUED or RUNNING -> CANCELLED.
    #[instrument(skip(self), fields(job_id = %id), err)]
    pub async fn cancel(&self, id: AssetJobId) -> Result<AssetJobView, PipelineError> {
        let view = self
            .jobs
            .apply_status_change(id, StatusChange::to(JobStatus::Cancelled, Utc::now()))
            .await?;
        info!(job_id = %id, "job cancelled");
        Ok(view)
    }
}
