//! HTTP API: routing, worker/requester middleware and backend wiring.

pub mod app;
pub mod context;
pub mod middleware;
