use axum::Router;

use crate::middleware::WorkerAuthState;

pub mod asset_jobs;
pub mod assets;
pub mod system;

/// Router for the job and asset endpoints.
pub fn router(worker_auth: WorkerAuthState) -> Router {
    Router::new()
        .nest("/asset-jobs", asset_jobs::router(worker_auth))
        .nest("/assets", assets::router())
}
