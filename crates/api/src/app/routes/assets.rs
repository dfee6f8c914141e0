use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use lorekeeper_core::AssetId;
use lorekeeper_infra::PipelineError;

use crate::app::dto::ListAssetsQuery;
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_assets))
        .route("/:id", get(get_asset))
}

/// Paginated assets, newest first.
pub async fn list_assets(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListAssetsQuery>,
) -> axum::response::Response {
    let (filter, page) = match query.into_filter() {
        Ok(v) => v,
        Err(res) => return res,
    };

    match services.jobs.list_assets(&filter, page).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e.into()),
    }
}

/// The asset plus the job and lore references that produced it.
pub async fn get_asset(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let asset_id: AssetId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::invalid_id("asset"),
    };

    match services.jobs.get_asset(asset_id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => errors::pipeline_error_to_response(PipelineError::NotFound(format!(
            "asset {asset_id}"
        ))),
        Err(e) => errors::pipeline_error_to_response(e.into()),
    }
}
