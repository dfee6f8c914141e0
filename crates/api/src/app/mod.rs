//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend wiring (job store, lore catalog, queue)
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and query parsing
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use lorekeeper_infra::{PipelineConfig, PipelineError, consumer::JobConsumerHandle};

use crate::middleware::WorkerAuthState;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// The HTTP router plus, for in-memory backends, the consumer draining the
/// in-process queue.
#[derive(Debug)]
pub struct Server {
    pub router: Router,
    pub consumer: Option<JobConsumerHandle>,
}

/// Build the full server from configuration (entrypoint used by `main.rs`).
pub async fn build_server(config: PipelineConfig) -> Result<Server, PipelineError> {
    let backends = services::build_backends(&config).await?;
    Ok(server(&backends, config))
}

/// Server over already-built backends. In-memory backends get a consumer
/// spawned here, since the standalone worker binary cannot reach them.
pub fn server(backends: &services::Backends, config: PipelineConfig) -> Server {
    let consumer = backends.in_memory.then(|| {
        tracing::info!("in-memory backends; running the asset consumer in-process");
        services::asset_generation_consumer(backends, &config, services::default_provider())
            .spawn()
    });
    let services = Arc::new(services::AppServices::new(backends, config));
    Server {
        router: router(services),
        consumer,
    }
}

/// Router over already-built services.
pub fn router(services: Arc<services::AppServices>) -> Router {
    let worker_auth = WorkerAuthState::new(services.config.worker_tokens.clone());

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router(worker_auth))
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
