//! Queue consumer with per-type handler dispatch.
//!
//! ## Message outcomes
//!
//! - Handler succeeded: ack.
//! - Handler returned `Retryable`: extend visibility by the retry backoff,
//!   the message comes back later with a higher receive count.
//! - Handler returned `Permanent`, body did not parse, or the receive count
//!   exceeded `max_receives`: copy to the dead-letter list, then ack. With
//!   job settlement enabled the job named by the message is moved to FAILED
//!   first (`MAX_RECEIVES_EXCEEDED` or `DEAD_LETTERED`), so no job stays
//!   RUNNING after its last delivery.
//! - No handler for the job type: logged and left alone, so another consumer
//!   that knows the type can take it after the visibility window. The receive
//!   bound is checked first, so such a message is still parked eventually.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use lorekeeper_core::AssetJobId;
use lorekeeper_queue::{
    AssetGenerationPayload, JobType, QueueEnvelope, QueueError, QueueGateway, ReceivedMessage,
};

use crate::config::PipelineConfig;
use crate::worker::WorkerService;

/// Pause after a failed receive before polling again.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Error code stamped on a job whose message ran out of receives.
pub const MAX_RECEIVES_EXCEEDED: &str = "MAX_RECEIVES_EXCEEDED";

/// Error code stamped on a job whose message was parked for any other reason.
pub const DEAD_LETTERED: &str = "DEAD_LETTERED";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the message should be delivered again.
    #[error("retryable: {0}")]
    Retryable(String),

    /// The message can never succeed.
    #[error("permanent: {0}")]
    Permanent(String),
}

#[async_trait::async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        envelope: &QueueEnvelope,
        message: &ReceivedMessage,
    ) -> Result<(), HandlerError>;
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct JobConsumerConfig {
    /// Name for logging
    pub name: String,
    pub max_messages: usize,
    pub wait_time: Duration,
    pub retry_backoff: Duration,
    pub max_receives: u32,
}

impl Default for JobConsumerConfig {
    fn default() -> Self {
        Self {
            name: "job-consumer".to_string(),
            max_messages: 1,
            wait_time: Duration::from_secs(20),
            retry_backoff: Duration::from_secs(60),
            max_receives: 5,
        }
    }
}

impl JobConsumerConfig {
    pub fn from_pipeline(config: &PipelineConfig) -> Self {
        Self {
            max_messages: config.max_messages,
            wait_time: config.wait_time,
            retry_backoff: config.retry_backoff,
            max_receives: config.max_receives,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Retried,
    Skipped,
    DeadLettered,
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub messages_received: u64,
    pub messages_acked: u64,
    pub messages_retried: u64,
    pub messages_skipped: u64,
    pub messages_dead_lettered: u64,
    pub receive_errors: u64,
    pub uptime_secs: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: Outcome) {
        self.messages_received += 1;
        match outcome {
            Outcome::Acked => self.messages_acked += 1,
            Outcome::Retried => self.messages_retried += 1,
            Outcome::Skipped => self.messages_skipped += 1,
            Outcome::DeadLettered => self.messages_dead_lettered += 1,
        }
    }
}

/// Handle to control a running consumer.
#[derive(Debug)]
pub struct JobConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl JobConsumerHandle {
    /// Stop polling, let the in-flight batch finish, and wait for the loop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job consumer task ended abnormally");
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Long-polls a queue and routes each message to the handler for its type.
pub struct JobConsumer {
    queue: Arc<dyn QueueGateway>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    config: JobConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
    settlement: Option<WorkerService>,
}

impl JobConsumer {
    pub fn new(queue: Arc<dyn QueueGateway>, config: JobConsumerConfig) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            config,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
            settlement: None,
        }
    }

    /// Fail the job behind every message this consumer dead-letters.
    pub fn with_job_settlement(mut self, worker: WorkerService) -> Self {
        self.settlement = Some(worker);
        self
    }

    /// Register a handler for a job type. A later registration replaces an
    /// earlier one.
    pub fn register_handler(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.as_str().to_string(), handler);
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Route one delivery and settle it with the queue.
    pub async fn process_message(&self, message: &ReceivedMessage) -> Result<Outcome, QueueError> {
        let outcome = self.route(message).await?;
        if let Ok(mut s) = self.stats.lock() {
            s.record(outcome);
        }
        Ok(outcome)
    }

    async fn route(&self, message: &ReceivedMessage) -> Result<Outcome, QueueError> {
        let envelope = match QueueEnvelope::from_body(&message.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    consumer = %self.config.name,
                    message_id = %message.message_id,
                    error = %e,
                    "malformed message body"
                );
                let reason = format!("malformed body: {e}");
                return self.park(message, None, DEAD_LETTERED, &reason).await;
            }
        };

        if message.receive_count > self.config.max_receives {
            let reason = format!(
                "exceeded {} receives (count {})",
                self.config.max_receives, message.receive_count
            );
            return self
                .park(message, Some(&envelope), MAX_RECEIVES_EXCEEDED, &reason)
                .await;
        }

        let Some(handler) = self.handlers.get(&envelope.job_type) else {
            warn!(
                consumer = %self.config.name,
                message_id = %message.message_id,
                job_type = %envelope.job_type,
                "no handler for job type; leaving message"
            );
            return Ok(Outcome::Skipped);
        };

        debug!(
            consumer = %self.config.name,
            message_id = %message.message_id,
            job_type = %envelope.job_type,
            receive_count = message.receive_count,
            "dispatching message"
        );

        match handler.handle(&envelope, message).await {
            Ok(()) => {
                self.ack(message).await?;
                Ok(Outcome::Acked)
            }
            Err(HandlerError::Retryable(reason)) => {
                warn!(
                    consumer = %self.config.name,
                    message_id = %message.message_id,
                    reason = %reason,
                    backoff_secs = self.config.retry_backoff.as_secs(),
                    "handler failed; scheduling retry"
                );
                match self
                    .queue
                    .extend_visibility(&message.receipt_handle, self.config.retry_backoff)
                    .await
                {
                    Ok(()) | Err(QueueError::ReceiptNotFound(_)) => Ok(Outcome::Retried),
                    Err(e) => Err(e),
                }
            }
            Err(HandlerError::Permanent(reason)) => {
                self.park(message, Some(&envelope), DEAD_LETTERED, &reason)
                    .await
            }
        }
    }

    async fn park(
        &self,
        message: &ReceivedMessage,
        envelope: Option<&QueueEnvelope>,
        error_code: &str,
        reason: &str,
    ) -> Result<Outcome, QueueError> {
        if let Some(worker) = &self.settlement {
            if let Some(job_id) = parked_job_id(message, envelope) {
                // The message is parked even when the settle fails.
                match worker.settle_undeliverable(job_id, error_code, reason).await {
                    Ok(Some(_)) => {
                        info!(
                            consumer = %self.config.name,
                            message_id = %message.message_id,
                            job_id = %job_id,
                            error_code,
                            "job failed with its message"
                        );
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!(
                            consumer = %self.config.name,
                            message_id = %message.message_id,
                            job_id = %job_id,
                            error = %e,
                            "could not fail job for parked message"
                        );
                    }
                }
            }
        }
        self.queue.dead_letter(message, reason).await?;
        self.ack(message).await?;
        Ok(Outcome::DeadLettered)
    }

    async fn ack(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        match self.queue.ack(&message.receipt_handle).await {
            Ok(()) => Ok(()),
            // Visibility lapsed and the message went to someone else; that
            // delivery settles it.
            Err(QueueError::ReceiptNotFound(_)) => {
                warn!(
                    consumer = %self.config.name,
                    message_id = %message.message_id,
                    "receipt expired before ack"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Receive one batch and process it concurrently.
    pub async fn poll_once(self: &Arc<Self>) -> Result<Vec<Outcome>, QueueError> {
        let messages = self
            .queue
            .receive(self.config.max_messages, self.config.wait_time)
            .await?;
        Ok(self.process_batch(messages).await)
    }

    async fn process_batch(self: &Arc<Self>, messages: Vec<ReceivedMessage>) -> Vec<Outcome> {
        let mut tasks = JoinSet::new();
        for message in messages {
            let consumer = Arc::clone(self);
            tasks.spawn(async move {
                let result = consumer.process_message(&message).await;
                (message.message_id, result)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => outcomes.push(outcome),
                Ok((message_id, Err(e))) => {
                    // Unsettled; the visibility timeout brings it back.
                    error!(
                        consumer = %self.config.name,
                        message_id = %message_id,
                        error = %e,
                        "failed to settle message"
                    );
                }
                Err(e) => error!(consumer = %self.config.name, error = %e, "message task panicked"),
            }
        }
        outcomes
    }

    /// Spawn the consumer loop on the tokio runtime.
    pub fn spawn(self) -> JobConsumerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let consumer = Arc::new(self);
        let join = tokio::spawn(consumer_loop(consumer, shutdown_rx));

        JobConsumerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }
}

/// The job a message is about: the transport's job id, else the payload's.
fn parked_job_id(message: &ReceivedMessage, envelope: Option<&QueueEnvelope>) -> Option<AssetJobId> {
    message.job_id.or_else(|| {
        envelope
            .filter(|e| e.is(JobType::AssetGeneration))
            .and_then(|e| AssetGenerationPayload::from_envelope(e).ok())
            .map(|p| p.asset_job_id)
    })
}

async fn consumer_loop(consumer: Arc<JobConsumer>, mut shutdown: watch::Receiver<bool>) {
    let name = consumer.config.name.clone();
    info!(consumer = %name, handlers = consumer.handlers.len(), "job consumer started");
    let start_time = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        if let Ok(mut s) = consumer.stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        // Only the receive is interruptible; a received batch always runs to
        // completion so nothing is left half-settled.
        let received = tokio::select! {
            _ = shutdown.changed() => break,
            r = consumer.queue.receive(consumer.config.max_messages, consumer.config.wait_time) => r,
        };

        match received {
            Ok(messages) if messages.is_empty() => {}
            Ok(messages) => {
                consumer.process_batch(messages).await;
            }
            Err(e) => {
                error!(consumer = %name, error = %e, "receive failed");
                if let Ok(mut s) = consumer.stats.lock() {
                    s.receive_errors += 1;
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    info!(consumer = %name, "job consumer stopped");
}
