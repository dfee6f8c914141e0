use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};

use lorekeeper_core::AssetJobId;
use lorekeeper_infra::worker::StatusPatch;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::RequesterContext;
use crate::middleware::{self, WorkerAuthState};

pub fn router(worker_auth: WorkerAuthState) -> Router {
    let worker = axum::middleware::from_fn_with_state(worker_auth, middleware::worker_auth_middleware);
    let requester = axum::middleware::from_fn(middleware::requester_middleware);

    Router::new()
        .route(
            "/",
            post(create_job)
                .route_layer(requester.clone())
                .merge(get(list_jobs)),
        )
        .route(
            "/:id",
            get(get_job).merge(patch(patch_job).route_layer(worker.clone())),
        )
        .route("/:id/complete", post(complete_job).route_layer(worker.clone()))
        .route("/:id/fail", post(fail_job).route_layer(worker))
        .route("/:id/cancel", post(cancel_job).route_layer(requester))
}

fn parse_job_id(id: &str) -> Result<AssetJobId, axum::response::Response> {
    id.parse().map_err(|_| errors::invalid_id("asset job"))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(requester): Extension<RequesterContext>,
    body: Result<Json<dto::CreateAssetJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::bad_body(e),
    };

    let submitted = match services
        .submission
        .submit(body.into_submit(), requester.user_id())
        .await
    {
        Ok(s) => s,
        Err(e) => return errors::pipeline_error_to_response(e),
    };

    tracing::info!(
        job_id = %submitted.view.job.id,
        created = submitted.created,
        requested_by = %requester.user_id(),
        "asset job submitted"
    );

    // A replay answers exactly like the original submission.
    (StatusCode::CREATED, Json(submitted.view)).into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListAssetJobsQuery>,
) -> axum::response::Response {
    let (filter, page) = match query.into_filter() {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.jobs.list(&filter, page).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e.into()),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.worker.get(id).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn patch_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<StatusPatch>, JsonRejection>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::bad_body(e),
    };

    match services.worker.patch(id, body).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn complete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<dto::CompleteAssetJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::bad_body(e),
    };

    match services.worker.complete(id, body.asset).await {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn fail_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<dto::FailAssetJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return errors::bad_body(e),
    };

    match services
        .worker
        .fail(id, &body.error_code, body.error_message)
        .await
    {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(requester): Extension<RequesterContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.worker.cancel(id).await {
        Ok(view) => {
            tracing::info!(job_id = %id, cancelled_by = %requester.user_id(), "asset job cancelled");
            (StatusCode::OK, Json(view)).into_response()
        }
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
