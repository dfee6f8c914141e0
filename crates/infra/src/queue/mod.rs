//! Broker-backed queue gateways.
//!
//! The in-memory gateway lives in `lorekeeper-queue`; this module holds the
//! implementations that need a running broker.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
