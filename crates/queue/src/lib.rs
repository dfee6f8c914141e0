//! Job queue mechanics: message envelope, gateway contract, in-memory transport.
//!
//! The gateway never interprets message payloads and never touches job rows.
//! Delivery is at-least-once; consumers compensate at the application layer.

pub mod envelope;
pub mod gateway;
pub mod in_memory;

pub use envelope::{AssetGenerationPayload, JobType, QueueEnvelope};
pub use gateway::{QueueError, QueueGateway, ReceivedMessage};
pub use in_memory::{DeadLetter, InMemoryQueue, QueuedMessage};
