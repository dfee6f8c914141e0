//! Backend wiring shared by the HTTP server and the worker binary.

use std::sync::Arc;

use lorekeeper_infra::{
    PipelineConfig, PipelineError,
    consumer::{JobConsumer, JobConsumerConfig},
    handlers::{AssetGenerationHandler, GenerationProvider, MockGenerationProvider},
    jobs::{InMemoryJobStore, JobStore},
    lore::{InMemoryLoreCatalog, LoreCatalog},
    producer::JobProducer,
    provenance::ProvenanceBuilder,
    submission::SubmissionService,
    worker::WorkerService,
};
use lorekeeper_queue::{InMemoryQueue, JobType, QueueGateway};

#[cfg(feature = "redis")]
use lorekeeper_infra::{jobs::PostgresJobStore, lore::PostgresLoreCatalog, queue::RedisStreamsQueue};
#[cfg(feature = "redis")]
use sqlx::PgPool;

/// The three ports every process needs.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub lore: Arc<dyn LoreCatalog>,
    pub queue: Arc<dyn QueueGateway>,
    /// Queue and store live in this process; no separate worker can see them.
    pub in_memory: bool,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

/// Concrete in-memory backends, kept typed so tests can seed lore and
/// inspect the queue.
#[derive(Debug, Clone)]
pub struct InMemoryBackends {
    pub jobs: Arc<InMemoryJobStore>,
    pub lore: Arc<InMemoryLoreCatalog>,
    pub queue: Arc<InMemoryQueue>,
}

impl InMemoryBackends {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            jobs: Arc::new(InMemoryJobStore::new()),
            lore: Arc::new(InMemoryLoreCatalog::new()),
            queue: Arc::new(InMemoryQueue::with_visibility_timeout(
                config.visibility_timeout,
            )),
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            jobs: self.jobs.clone(),
            lore: self.lore.clone(),
            queue: self.queue.clone(),
            in_memory: true,
        }
    }
}

#[derive(Clone)]
pub struct AppServices {
    pub submission: SubmissionService,
    pub worker: WorkerService,
    pub jobs: Arc<dyn JobStore>,
    pub config: PipelineConfig,
}

impl std::fmt::Debug for AppServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppServices")
            .field("submission", &self.submission)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AppServices {
    pub fn new(backends: &Backends, config: PipelineConfig) -> Self {
        let producer = JobProducer::new(backends.queue.clone());
        let provenance = ProvenanceBuilder::new(config.drift_sensitive_hashing);
        let submission = SubmissionService::new(
            backends.jobs.clone(),
            backends.lore.clone(),
            producer,
            provenance,
        );

        Self {
            submission,
            worker: WorkerService::new(backends.jobs.clone()),
            jobs: backends.jobs.clone(),
            config,
        }
    }
}

/// Build backends from configuration.
///
/// `USE_PERSISTENT_STORES=true` selects Postgres + Redis when the `redis`
/// feature is compiled in; otherwise everything lives in memory.
pub async fn build_backends(config: &PipelineConfig) -> Result<Backends, PipelineError> {
    if config.use_persistent_stores {
        #[cfg(feature = "redis")]
        {
            return build_persistent_backends(config).await;
        }
        #[cfg(not(feature = "redis"))]
        {
            tracing::warn!(
                "USE_PERSISTENT_STORES=true but redis feature not enabled, falling back to in-memory"
            );
        }
    }

    Ok(InMemoryBackends::new(config).backends())
}

#[cfg(feature = "redis")]
async fn build_persistent_backends(config: &PipelineConfig) -> Result<Backends, PipelineError> {
    let database_url = config.database_url.as_deref().ok_or_else(|| {
        PipelineError::Validation(
            "DATABASE_URL must be set when USE_PERSISTENT_STORES=true".to_string(),
        )
    })?;

    let pool = PgPool::connect(database_url)
        .await
        .map_err(|e| PipelineError::Storage(format!("failed to connect to postgres: {e}")))?;

    let jobs = PostgresJobStore::new(pool.clone());
    jobs.migrate().await?;
    let lore = PostgresLoreCatalog::new(pool);

    let queue = RedisStreamsQueue::new(
        &config.redis_url,
        &config.queue_name,
        config.visibility_timeout,
    )?;
    queue.ensure_consumer_group().await?;

    tracing::info!(queue = %config.queue_name, "using postgres + redis streams backends");

    Ok(Backends {
        jobs: Arc::new(jobs),
        lore: Arc::new(lore),
        queue: Arc::new(queue),
        in_memory: false,
    })
}

/// Consumer with the `ASSET_GENERATION` handler registered.
pub fn asset_generation_consumer(
    backends: &Backends,
    config: &PipelineConfig,
    provider: Arc<dyn GenerationProvider>,
) -> JobConsumer {
    let worker = WorkerService::new(backends.jobs.clone());
    let mut consumer = JobConsumer::new(
        backends.queue.clone(),
        JobConsumerConfig::from_pipeline(config).with_name("asset-generation"),
    )
    .with_job_settlement(worker.clone());
    let handler = AssetGenerationHandler::new(worker, provider);
    consumer.register_handler(JobType::AssetGeneration, Arc::new(handler));
    consumer
}

/// Development provider used when no real generation backend is wired.
pub fn default_provider() -> Arc<dyn GenerationProvider> {
    Arc::new(MockGenerationProvider)
}
