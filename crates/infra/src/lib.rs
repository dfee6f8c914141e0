//! Infrastructure layer: job storage, lore lookups, queue transports and the
//! services that tie them into the asset pipeline.

pub mod config;
pub mod consumer;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod lore;
pub mod producer;
pub mod provenance;
pub mod queue;
pub mod submission;
pub mod worker;

pub use config::PipelineConfig;
pub use error::PipelineError;
