//! In-memory queue for tests/dev.
//!
//! Mirrors the hosted-queue semantics the pipeline relies on: per-delivery
//! receipt handles, visibility timeouts, delayed enqueue, long-poll receive
//! and delivery counts. Nothing survives a restart.
//!
//! Delivery is FIFO among visible messages. `priority` is stored with the
//! message for consumers and operators but does not reorder delivery.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use lorekeeper_core::AssetJobId;

use crate::gateway::{QueueError, QueueGateway, ReceivedMessage};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(900);

/// A message currently held by the queue (visible or in flight).
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub message_id: String,
    pub job_id: AssetJobId,
    pub body: String,
    pub priority: Option<i32>,
    pub receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

impl QueuedMessage {
    pub fn is_in_flight(&self) -> bool {
        self.receipt_handle.is_some() && self.visible_at > Instant::now()
    }
}

/// A message parked after exhausting its deliveries or failing to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub receive_count: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: Vec<QueuedMessage>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    arrivals: Notify,
    visibility_timeout: Duration,
    unavailable: AtomicBool,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            visibility_timeout,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages not yet acked, in enqueue order.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.state
            .lock()
            .map(|s| s.messages.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .map(|s| s.dead_letters.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("in-memory queue marked unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".into()))
    }

    /// Claim up to `max` visible messages. Returns the claimed deliveries and,
    /// when nothing was visible, the instant the next hidden message reappears.
    fn claim_visible(
        &self,
        max: usize,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>), QueueError> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let mut claimed = Vec::new();

        for msg in state.messages.iter_mut() {
            if claimed.len() >= max {
                break;
            }
            if msg.visible_at > now {
                continue;
            }
            let receipt = Uuid::now_v7().to_string();
            msg.receive_count += 1;
            msg.visible_at = now + self.visibility_timeout;
            msg.receipt_handle = Some(receipt.clone());
            claimed.push(ReceivedMessage {
                message_id: msg.message_id.clone(),
                job_id: Some(msg.job_id),
                body: msg.body.clone(),
                receipt_handle: receipt,
                receive_count: msg.receive_count,
            });
        }

        let next_visible = if claimed.is_empty() {
            state.messages.iter().map(|m| m.visible_at).min()
        } else {
            None
        };
        Ok((claimed, next_visible))
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl QueueGateway for InMemoryQueue {
    async fn enqueue(
        &self,
        job_id: AssetJobId,
        body: &str,
        priority: Option<i32>,
        delay: Duration,
    ) -> Result<String, QueueError> {
        self.check_available()?;
        let message_id = Uuid::now_v7().to_string();
        {
            let mut state = self.lock()?;
            state.messages.push(QueuedMessage {
                message_id: message_id.clone(),
                job_id,
                body: body.to_string(),
                priority,
                receive_count: 0,
                visible_at: Instant::now() + delay,
                receipt_handle: None,
            });
        }
        debug!(message_id = %message_id, job_id = %job_id, "message enqueued");
        self.arrivals.notify_waiters();
        Ok(message_id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.check_available()?;
        let max = max_messages.max(1);
        let deadline = Instant::now() + wait_time;

        loop {
            // Register interest before looking so an enqueue between the
            // check and the wait is not missed.
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            let (claimed, next_visible) = self.claim_visible(max)?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_visible
                .filter(|at| *at > now)
                .map_or(deadline, |at| at.min(deadline));

            let _ = tokio::time::timeout_at(wake_at, arrived).await;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.lock()?;
        let before = state.messages.len();
        state
            .messages
            .retain(|m| m.receipt_handle.as_deref() != Some(receipt_handle));
        if state.messages.len() == before {
            return Err(QueueError::ReceiptNotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        {
            let mut state = self.lock()?;
            let msg = state
                .messages
                .iter_mut()
                .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
                .ok_or_else(|| QueueError::ReceiptNotFound(receipt_handle.to_string()))?;
            msg.visible_at = Instant::now() + timeout;
        }
        if timeout.is_zero() {
            self.arrivals.notify_waiters();
        }
        Ok(())
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError> {
        self.check_available()?;
        let mut state = self.lock()?;
        state.dead_letters.push(DeadLetter {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            receive_count: message.receive_count,
            reason: reason.to_string(),
            dead_lettered_at: Utc::now(),
        });
        warn!(
            message_id = %message.message_id,
            receive_count = message.receive_count,
            reason = %reason,
            "message sent to dead-letter list"
        );
        Ok(())
    }
}
