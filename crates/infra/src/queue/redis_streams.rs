//! Redis Streams-backed queue gateway (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `lorekeeper:{queue}` holds enqueued messages
//! - **Consumer Group**: one group shared by all workers, so each message
//!   goes to one worker at a time
//! - **Visibility**: a pending entry idle for longer than the visibility
//!   timeout is reclaimed with XCLAIM by the next `receive`. Extending
//!   visibility rewinds the entry's idle time, so an extension can be at most
//!   one visibility timeout long; keep `CONSUMER_RETRY_BACKOFF_SECS` below
//!   `QUEUE_VISIBILITY_TIMEOUT_SECS`
//! - **Delays**: delayed messages wait in a sorted set `lorekeeper:{queue}:delayed`
//!   and are moved onto the stream once due
//! - **Dead-Letter Queue**: `lorekeeper:{queue}:dlq`
//!
//! Receipt handles are `{entry_id}#{delivery_count}`. A receipt whose count no
//! longer matches the pending entry belongs to an older delivery and is
//! rejected.

use std::sync::Arc;
use std::time::Duration;

use redis::Commands;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use lorekeeper_core::AssetJobId;
use lorekeeper_queue::{QueueError, QueueGateway, ReceivedMessage};

const DEFAULT_GROUP: &str = "asset-workers";

/// Most delayed messages promoted per receive.
const PROMOTE_BATCH: isize = 100;

#[derive(Debug, Clone)]
pub struct RedisStreamsQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    delayed_key: String,
    dlq_key: String,
    group: String,
    consumer: String,
    visibility_timeout: Duration,
}

/// Sorted-set member for a delayed message.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedMessage {
    nonce: Uuid,
    job_id: AssetJobId,
    body: String,
    priority: Option<i32>,
}

impl RedisStreamsQueue {
    pub fn new(
        redis_url: impl AsRef<str>,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(format!("invalid redis url: {e}")))?;
        let stream_key = format!("lorekeeper:{queue_name}");

        Ok(Self {
            client: Arc::new(client),
            delayed_key: format!("{stream_key}:delayed"),
            dlq_key: format!("{stream_key}:dlq"),
            stream_key,
            group: DEFAULT_GROUP.to_string(),
            consumer: format!("consumer-{}", Uuid::now_v7()),
            visibility_timeout,
        })
    }

    pub fn with_consumer_name(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Create the stream and consumer group if missing (idempotent).
    pub async fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        self.blocking("ensure_consumer_group", |q, conn| {
            let created: redis::RedisResult<()> =
                conn.xgroup_create_mkstream(&q.stream_key, &q.group, "0");
            match created {
                Ok(()) => Ok(()),
                Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
                Err(e) => Err(unavailable("XGROUP CREATE", e)),
            }
        })
        .await
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| unavailable("connect", e))
    }

    /// Run a sync Redis operation on the blocking pool.
    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&Self, &mut redis::Connection) -> Result<T, QueueError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = this.connection()?;
            f(&this, &mut conn)
        })
        .await
        .map_err(|e| QueueError::Unavailable(format!("{operation} task failed: {e}")))?
    }

    fn visibility_ms(&self) -> u64 {
        self.visibility_timeout.as_millis() as u64
    }

    fn add_sync(
        &self,
        conn: &mut redis::Connection,
        job_id: AssetJobId,
        body: &str,
        priority: Option<i32>,
    ) -> Result<String, QueueError> {
        let job_id = job_id.to_string();
        let priority = priority.map(|p| p.to_string()).unwrap_or_default();
        conn.xadd(
            &self.stream_key,
            "*",
            &[
                ("job_id", job_id.as_str()),
                ("body", body),
                ("priority", priority.as_str()),
            ],
        )
        .map_err(|e| unavailable("XADD", e))
    }

    /// Move due delayed messages onto the stream.
    fn promote_delayed_sync(&self, conn: &mut redis::Connection) -> Result<(), QueueError> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let due: Vec<String> = conn
            .zrangebyscore_limit(&self.delayed_key, "-inf", now_ms, 0, PROMOTE_BATCH)
            .map_err(|e| unavailable("ZRANGEBYSCORE", e))?;

        for member in due {
            // Only the worker that removes the member promotes it.
            let removed: i64 = conn
                .zrem(&self.delayed_key, &member)
                .map_err(|e| unavailable("ZREM", e))?;
            if removed != 1 {
                continue;
            }
            match serde_json::from_str::<DelayedMessage>(&member) {
                Ok(msg) => {
                    self.add_sync(conn, msg.job_id, &msg.body, msg.priority)?;
                }
                Err(e) => warn!(error = %e, "dropping unreadable delayed message"),
            }
        }
        Ok(())
    }

    /// Claim entries whose visibility window has lapsed.
    fn reclaim_sync(
        &self,
        conn: &mut redis::Connection,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let idle_ms = self.visibility_ms();
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query(conn)
            .map_err(|e| unavailable("XPENDING", e))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.iter().map(|(id, _, _, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream_key, &self.group, &self.consumer, idle_ms, ids.as_slice())
            .map_err(|e| unavailable("XCLAIM", e))?;

        let mut messages = Vec::with_capacity(claimed.ids.len());
        for entry in &claimed.ids {
            let previous = pending
                .iter()
                .find(|(id, _, _, _)| *id == entry.id)
                .map_or(0, |(_, _, _, deliveries)| *deliveries);
            messages.push(to_message(entry, previous as u32 + 1)?);
        }
        Ok(messages)
    }

    fn read_new_sync(
        &self,
        conn: &mut redis::Connection,
        max: usize,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        // BLOCK 0 means forever; a zero wait is a plain poll.
        if !wait_time.is_zero() {
            opts = opts.block(wait_time.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream_key], &[">"], &opts)
            .map_err(|e| unavailable("XREADGROUP", e))?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .map(|entry| to_message(entry, 1))
            .collect()
    }

    /// Delivery count of a pending entry, if it is still pending.
    fn deliveries_sync(
        &self,
        conn: &mut redis::Connection,
        entry_id: &str,
    ) -> Result<Option<u64>, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(entry_id)
            .arg(entry_id)
            .arg(1)
            .query(conn)
            .map_err(|e| unavailable("XPENDING", e))?;
        Ok(pending.first().map(|(_, _, _, deliveries)| *deliveries))
    }

    /// Resolve a receipt to its entry id, rejecting stale deliveries.
    fn check_receipt_sync(
        &self,
        conn: &mut redis::Connection,
        receipt_handle: &str,
    ) -> Result<String, QueueError> {
        let not_found = || QueueError::ReceiptNotFound(receipt_handle.to_string());
        let (entry_id, count) = parse_receipt(receipt_handle).ok_or_else(not_found)?;
        match self.deliveries_sync(conn, &entry_id)? {
            Some(deliveries) if deliveries == count => Ok(entry_id),
            _ => Err(not_found()),
        }
    }
}

fn unavailable(operation: &str, err: redis::RedisError) -> QueueError {
    QueueError::Unavailable(format!("{operation} failed: {err}"))
}

fn format_receipt(entry_id: &str, deliveries: u32) -> String {
    format!("{entry_id}#{deliveries}")
}

fn parse_receipt(receipt: &str) -> Option<(String, u64)> {
    let (id, count) = receipt.rsplit_once('#')?;
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), count.parse().ok()?))
}

fn to_message(entry: &StreamId, deliveries: u32) -> Result<ReceivedMessage, QueueError> {
    let body: String = entry
        .get("body")
        .ok_or_else(|| QueueError::Deserialization(format!("entry {} has no body", entry.id)))?;
    let job_id = entry
        .get::<String>("job_id")
        .and_then(|raw| raw.parse::<AssetJobId>().ok());

    Ok(ReceivedMessage {
        message_id: entry.id.clone(),
        job_id,
        body,
        receipt_handle: format_receipt(&entry.id, deliveries),
        receive_count: deliveries,
    })
}

#[async_trait::async_trait]
impl QueueGateway for RedisStreamsQueue {
    #[instrument(skip(self, body), fields(stream_key = %self.stream_key, job_id = %job_id), err)]
    async fn enqueue(
        &self,
        job_id: AssetJobId,
        body: &str,
        priority: Option<i32>,
        delay: Duration,
    ) -> Result<String, QueueError> {
        let body = body.to_string();
        if delay.is_zero() {
            return self
                .blocking("enqueue", move |q, conn| q.add_sync(conn, job_id, &body, priority))
                .await;
        }

        self.blocking("enqueue_delayed", move |q, conn| {
            let nonce = Uuid::now_v7();
            let member = serde_json::to_string(&DelayedMessage {
                nonce,
                job_id,
                body,
                priority,
            })
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
            let due_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: i64 = conn
                .zadd(&q.delayed_key, &member, due_ms)
                .map_err(|e| unavailable("ZADD", e))?;
            Ok(format!("delayed-{nonce}"))
        })
        .await
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let max = max_messages.max(1);
        let messages = self
            .blocking("receive", move |q, conn| {
                q.promote_delayed_sync(conn)?;
                let reclaimed = q.reclaim_sync(conn, max)?;
                if !reclaimed.is_empty() {
                    return Ok(reclaimed);
                }
                q.read_new_sync(conn, max, wait_time)
            })
            .await?;
        if !messages.is_empty() {
            debug!(stream_key = %self.stream_key, count = messages.len(), "received messages");
        }
        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        let receipt = receipt_handle.to_string();
        self.blocking("ack", move |q, conn| {
            let entry_id = q.check_receipt_sync(conn, &receipt)?;
            let _: i64 = conn
                .xack(&q.stream_key, &q.group, &[&entry_id])
                .map_err(|e| unavailable("XACK", e))?;
            let _: i64 = conn
                .xdel(&q.stream_key, &[&entry_id])
                .map_err(|e| unavailable("XDEL", e))?;
            Ok(())
        })
        .await
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        let receipt = receipt_handle.to_string();
        self.blocking("extend_visibility", move |q, conn| {
            let entry_id = q.check_receipt_sync(conn, &receipt)?;
            if timeout > q.visibility_timeout {
                warn!(
                    entry_id = %entry_id,
                    requested_secs = timeout.as_secs(),
                    visibility_timeout_secs = q.visibility_timeout.as_secs(),
                    "visibility extension capped at the visibility timeout"
                );
            }
            let idle_ms = reclaim_idle_ms(q.visibility_timeout, timeout);
            let _: Vec<String> = redis::cmd("XCLAIM")
                .arg(&q.stream_key)
                .arg(&q.group)
                .arg(&q.consumer)
                .arg(0)
                .arg(&entry_id)
                .arg("IDLE")
                .arg(idle_ms)
                .arg("JUSTID")
                .query(conn)
                .map_err(|e| unavailable("XCLAIM", e))?;
            Ok(())
        })
        .await
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError> {
        let message = message.clone();
        let reason = reason.to_string();
        self.blocking("dead_letter", move |q, conn| {
            let _: String = conn
                .xadd(
                    &q.dlq_key,
                    "*",
                    &[
                        ("original_message_id", message.message_id.clone()),
                        ("receive_count", message.receive_count.to_string()),
                        ("reason", reason.clone()),
                        ("failed_at", chrono::Utc::now().to_rfc3339()),
                        ("body", message.body.clone()),
                    ],
                )
                .map_err(|e| unavailable("DLQ XADD", e))?;
            warn!(
                message_id = %message.message_id,
                receive_count = message.receive_count,
                reason = %reason,
                "message sent to dead-letter queue"
            );
            Ok(())
        })
        .await
    }
}

/// IDLE to stamp on a pending entry so it is reclaimed `timeout` from now.
///
/// Reclaim fires once idle reaches the visibility timeout, so the entry is
/// due after `visibility - timeout`. Pending entries cannot be hidden for
/// longer than the visibility timeout; larger requests are capped there.
/// JUSTID on the XCLAIM keeps the delivery count unchanged.
fn reclaim_idle_ms(visibility_timeout: Duration, timeout: Duration) -> u64 {
    let delay = timeout.min(visibility_timeout);
    u64::try_from((visibility_timeout - delay).as_millis()).unwrap_or(u64::MAX)
}
