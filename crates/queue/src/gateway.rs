//! Queue gateway contract.
//!
//! Wraps a durable at-least-once queue:
//!
//! - `receive` long-polls for up to `wait_time` and hides each returned
//!   message for the visibility timeout.
//! - `ack` removes a message permanently. A message not acked before its
//!   visibility window ends becomes deliverable again, to any consumer.
//! - `extend_visibility` pushes the next delivery out without a second
//!   producer write; it is how failed handlers schedule a retry.
//! - `dead_letter` parks a copy of a poison message for inspection. The
//!   caller still acks the original.

use std::sync::Arc;
use std::time::Duration;

use lorekeeper_core::AssetJobId;

/// Queue operation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// Broker unreachable or a command failed in transit.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The receipt handle is unknown or has expired (message was redelivered).
    #[error("receipt handle not found: {0}")]
    ReceiptNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),
}

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: String,
    /// Job the message was enqueued for, when the transport records it.
    pub job_id: Option<AssetJobId>,
    pub body: String,
    /// Handle for this delivery only; a redelivery gets a new one.
    pub receipt_handle: String,
    /// 1 on first delivery.
    pub receive_count: u32,
}

#[async_trait::async_trait]
pub trait QueueGateway: Send + Sync {
    /// Enqueue a message body, returning the transport's message id.
    async fn enqueue(
        &self,
        job_id: AssetJobId,
        body: &str,
        priority: Option<i32>,
        delay: Duration,
    ) -> Result<String, QueueError>;

    /// Receive up to `max_messages`, blocking up to `wait_time` when empty.
    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError>;

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError>;

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError>;
}

#[async_trait::async_trait]
impl<Q> QueueGateway for Arc<Q>
where
    Q: QueueGateway + ?Sized,
{
    async fn enqueue(
        &self,
        job_id: AssetJobId,
        body: &str,
        priority: Option<i32>,
        delay: Duration,
    ) -> Result<String, QueueError> {
        (**self).enqueue(job_id, body, priority, delay).await
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        (**self).receive(max_messages, wait_time).await
    }

    async fn ack(&self, receipt_handle: &str) -> Result<(), QueueError> {
        (**self).ack(receipt_handle).await
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        timeout: Duration,
    ) -> Result<(), QueueError> {
        (**self).extend_visibility(receipt_handle, timeout).await
    }

    async fn dead_letter(&self, message: &ReceivedMessage, reason: &str) -> Result<(), QueueError> {
        (**self).dead_letter(message, reason).await
    }
}
