//! Asset job record and its status state machine.
//!
//! ```text
//! QUEUED  -> RUNNING, CANCELLED
//! RUNNING -> SUCCEEDED, FAILED, CANCELLED
//! ```
//!
//! SUCCEEDED, FAILED and CANCELLED are terminal. Every status-changing call
//! goes through [`validate_transition`] before anything is persisted.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asset::AssetType;
use crate::error::{DomainError, DomainResult};
use crate::id::{AssetJobId, WorldId};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses reachable from `self` in one step.
    pub fn allowed_next(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Queued => &[JobStatus::Running, JobStatus::Cancelled],
            JobStatus::Running => &[
                JobStatus::Succeeded,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ],
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Check a requested status change against the state machine.
pub fn validate_transition(current: JobStatus, attempted: JobStatus) -> DomainResult<()> {
    if current.can_transition_to(attempted) {
        Ok(())
    } else {
        Err(DomainError::InvalidTransition {
            current,
            attempted,
            allowed: current.allowed_next().to_vec(),
        })
    }
}

/// One row per submitted generation request.
///
/// Mutated only through the `mark_*` methods, each of which validates the
/// transition first and leaves the job untouched on rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetJob {
    pub id: AssetJobId,
    pub world_id: WorldId,
    pub asset_type: AssetType,
    pub provider: String,
    pub model_id: Option<String>,
    pub status: JobStatus,
    pub priority: Option<i32>,
    pub requested_by: String,
    pub input_hash: String,
    pub prompt_spec: serde_json::Value,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AssetJob {
    /// Create a fresh job in QUEUED.
    #[allow(clippy::too_many_arguments)]
    pub fn queued(
        world_id: WorldId,
        asset_type: AssetType,
        provider: impl Into<String>,
        model_id: Option<String>,
        priority: Option<i32>,
        requested_by: impl Into<String>,
        input_hash: impl Into<String>,
        prompt_spec: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AssetJobId::new(),
            world_id,
            asset_type,
            provider: provider.into(),
            model_id,
            status: JobStatus::Queued,
            priority,
            requested_by: requested_by.into(),
            input_hash: input_hash.into(),
            prompt_spec,
            error_code: None,
            error_message: None,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, started_at: DateTime<Utc>) -> DomainResult<()> {
        validate_transition(self.status, JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.started_at = Some(started_at);
        Ok(())
    }

    /// Move to SUCCEEDED.
    ///
    /// A QUEUED job is accepted too: it passes through RUNNING implicitly and
    /// gets `started_at` stamped with the completion time.
    pub fn mark_succeeded(&mut self, finished_at: DateTime<Utc>) -> DomainResult<()> {
        if self.status == JobStatus::Queued {
            self.mark_running(finished_at)?;
        }
        validate_transition(self.status, JobStatus::Succeeded)?;
        self.status = JobStatus::Succeeded;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    pub fn mark_failed(
        &mut self,
        error_code: impl Into<String>,
        error_message: impl Into<String>,
        finished_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        validate_transition(self.status, JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error_code = Some(error_code.into());
        self.error_message = Some(error_message.into());
        self.finished_at = Some(finished_at);
        Ok(())
    }

    pub fn mark_cancelled(&mut self, finished_at: DateTime<Utc>) -> DomainResult<()> {
        validate_transition(self.status, JobStatus::Cancelled)?;
        self.status = JobStatus::Cancelled;
        self.finished_at = Some(finished_at);
        Ok(())
    }

    /// Apply a generic status change (the worker PATCH path).
    ///
    /// SUCCEEDED is not reachable this way because it must link an asset.
    pub fn apply_status_change(&mut self, change: StatusChange) -> DomainResult<()> {
        if change.status != JobStatus::Failed
            && (change.error_code.is_some() || change.error_message.is_some())
        {
            return Err(DomainError::validation(
                "error_code and error_message are only accepted with status FAILED",
            ));
        }

        match change.status {
            JobStatus::Running => self.mark_running(change.started_at.unwrap_or(change.now)),
            JobStatus::Failed => self.mark_failed(
                change.error_code.unwrap_or_else(|| "UNSPECIFIED".to_string()),
                change.error_message.unwrap_or_default(),
                change.finished_at.unwrap_or(change.now),
            ),
            JobStatus::Cancelled => self.mark_cancelled(change.finished_at.unwrap_or(change.now)),
            JobStatus::Succeeded => {
                // Report the state machine error first for terminal jobs.
                validate_transition(self.status, JobStatus::Succeeded)?;
                Err(DomainError::validation(
                    "status SUCCEEDED must be set through the complete operation",
                ))
            }
            JobStatus::Queued => validate_transition(self.status, JobStatus::Queued),
        }
    }
}

/// Worker-requested status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub status: JobStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub now: DateTime<Utc>,
}

impl StatusChange {
    pub fn to(status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            started_at: None,
            finished_at: None,
            error_code: None,
            error_message: None,
            now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> AssetJob {
        AssetJob::queued(
            WorldId::new(),
            AssetType::Video,
            "sora",
            None,
            None,
            "user-1",
            "hash",
            json!({"description": "a storm over the citadel"}),
            Utc::now(),
        )
    }

    const LEGAL: [(JobStatus, JobStatus); 5] = [
        (JobStatus::Queued, JobStatus::Running),
        (JobStatus::Queued, JobStatus::Cancelled),
        (JobStatus::Running, JobStatus::Succeeded),
        (JobStatus::Running, JobStatus::Failed),
        (JobStatus::Running, JobStatus::Cancelled),
    ];

    #[test]
    fn only_table_edges_are_legal() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let expected = LEGAL.contains(&(from, to));
                assert_eq!(
                    validate_transition(from, to).is_ok(),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn rejection_names_current_attempted_and_allowed() {
        let err = validate_transition(JobStatus::Queued, JobStatus::Succeeded).unwrap_err();
        assert_eq!(
            err,
            DomainError::InvalidTransition {
                current: JobStatus::Queued,
                attempted: JobStatus::Succeeded,
                allowed: vec![JobStatus::Running, JobStatus::Cancelled],
            }
        );
        let msg = err.to_string();
        assert!(msg.contains("QUEUED") && msg.contains("SUCCEEDED") && msg.contains("RUNNING"));
    }

    #[test]
    fn lifecycle_stamps_timestamps() {
        let mut job = job();
        let t1 = Utc::now();
        job.mark_running(t1).unwrap();
        assert_eq!(job.started_at, Some(t1));
        assert!(job.finished_at.is_none());

        let t2 = Utc::now();
        job.mark_succeeded(t2).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.finished_at, Some(t2));
    }

    #[test]
    fn succeed_from_queued_passes_through_running() {
        let mut job = job();
        let t = Utc::now();
        job.mark_succeeded(t).unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.started_at, Some(t));
        assert_eq!(job.finished_at, Some(t));
    }

    #[test]
    fn fail_requires_running() {
        let mut job = job();
        let before = job.clone();
        assert!(job.mark_failed("X", "boom", Utc::now()).is_err());
        assert_eq!(job, before);
    }

    #[test]
    fn terminal_jobs_are_immutable() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();
        job.mark_failed("PROVIDER_ERROR", "quota", Utc::now()).unwrap();
        let frozen = job.clone();

        assert!(job.mark_running(Utc::now()).is_err());
        assert!(job.mark_succeeded(Utc::now()).is_err());
        assert!(job.mark_cancelled(Utc::now()).is_err());
        assert!(job.mark_failed("OTHER", "again", Utc::now()).is_err());
        assert_eq!(job, frozen);
    }

    #[test]
    fn status_change_rejects_succeeded_and_stray_error_fields() {
        let mut job = job();
        job.mark_running(Utc::now()).unwrap();

        let err = job
            .apply_status_change(StatusChange::to(JobStatus::Succeeded, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let mut change = StatusChange::to(JobStatus::Cancelled, Utc::now());
        change.error_code = Some("NOPE".into());
        assert!(matches!(
            job.apply_status_change(change),
            Err(DomainError::Validation(_))
        ));
        assert_eq!(job.status, JobStatus::Running);
    }

    #[test]
    fn status_change_prefers_supplied_timestamps() {
        let mut job = job();
        let started = Utc::now() - chrono::Duration::seconds(30);
        let mut change = StatusChange::to(JobStatus::Running, Utc::now());
        change.started_at = Some(started);
        job.apply_status_change(change).unwrap();
        assert_eq!(job.started_at, Some(started));
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("PROCESSING".parse::<JobStatus>().is_err());
    }
}
