//! Turns persisted jobs into queue messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use lorekeeper_queue::{AssetGenerationPayload, QueueEnvelope, QueueError, QueueGateway};

use crate::error::PipelineError;
use crate::jobs::{AssetJobView, JobStore};

#[derive(Clone)]
pub struct JobProducer {
    queue: Arc<dyn QueueGateway>,
}

impl std::fmt::Debug for JobProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProducer").finish_non_exhaustive()
    }
}

impl JobProducer {
    pub fn new(queue: Arc<dyn QueueGateway>) -> Self {
        Self { queue }
    }

    /// Enqueue an `ASSET_GENERATION` message for a persisted job.
    ///
    /// The message carries the job's world, type, provider, prompt and
    /// reference ids so a worker can start without a read, but the job row
    /// stays the source of truth.
    #[instrument(skip(self, view), fields(job_id = %view.job.id), err)]
    pub async fn publish(&self, view: &AssetJobView) -> Result<String, QueueError> {
        let payload = AssetGenerationPayload::for_job(&view.job, view.derivation.references());
        let body = QueueEnvelope::asset_generation(&payload)?.to_body()?;
        let message_id = self
            .queue
            .enqueue(view.job.id, &body, view.job.priority, Duration::ZERO)
            .await?;
        info!(job_id = %view.job.id, message_id = %message_id, "job enqueued");
        Ok(message_id)
    }

    /// Re-publish jobs that have sat in QUEUED since before `created_before`.
    ///
    /// Covers the window where a job row committed but its enqueue failed.
    /// A job that was enqueued fine gets a duplicate message, which the
    /// worker side already tolerates.
    #[instrument(skip(self, store), err)]
    pub async fn reconcile<S>(
        &self,
        store: &S,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, PipelineError>
    where
        S: JobStore + ?Sized,
    {
        let stale = store.list_stale_queued(created_before, limit).await?;
        let mut published = 0;
        for view in &stale {
            match self.publish(view).await {
                Ok(_) => published += 1,
                Err(e) => {
                    warn!(job_id = %view.job.id, error = %e, "reconcile publish failed");
                    return Err(e.into());
                }
            }
        }
        if published > 0 {
            info!(published, "re-published stale queued jobs");
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use crate::jobs::store::tests::new_job;
    use lorekeeper_core::WorldId;
    use lorekeeper_queue::InMemoryQueue;
    use serde_json::json;

    #[tokio::test]
    async fn publish_carries_job_and_references() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = InMemoryJobStore::new();
        let new = new_job(WorldId::new(), json!({"d": "x"}));
        let refs = new.references.clone();
        let view = store.create_or_get(new).await.unwrap().into_view();

        JobProducer::new(queue.clone()).publish(&view).await.unwrap();

        let messages = queue.messages();
        assert_eq!(messages.len(), 1);
        let envelope = QueueEnvelope::from_body(&messages[0].body).unwrap();
        let payload = AssetGenerationPayload::from_envelope(&envelope).unwrap();
        assert_eq!(payload.asset_job_id, view.job.id);
        assert_eq!(payload.references, refs);
    }

    #[tokio::test]
    async fn reconcile_republishes_only_old_queued_jobs() {
        let queue = Arc::new(InMemoryQueue::new());
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let mut old = new_job(world, json!({"d": "old"}));
        old.job.created_at = Utc::now() - chrono::Duration::minutes(10);
        store.create_or_get(old).await.unwrap();
        store
            .create_or_get(new_job(world, json!({"d": "new"})))
            .await
            .unwrap();

        let producer = JobProducer::new(queue.clone());
        let n = producer
            .reconcile(&store, Utc::now() - chrono::Duration::minutes(5), 100)
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(queue.len(), 1);
    }
}
