use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use lorekeeper_core::{
    AssetCreateSpec, AssetStatus, AssetType, JobStatus, LoreReferences, WorldId,
};
use lorekeeper_infra::jobs::{AssetFilter, JobFilter, Page};
use lorekeeper_infra::submission::SubmitRequest;

use crate::app::errors;

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateAssetJobRequest {
    pub world_id: WorldId,
    pub asset_type: String,
    pub provider: String,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub prompt_spec: serde_json::Value,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub references: LoreReferences,
}

impl CreateAssetJobRequest {
    pub fn into_submit(self) -> SubmitRequest {
        SubmitRequest {
            world_id: self.world_id,
            asset_type: self.asset_type,
            provider: self.provider,
            model_id: self.model_id,
            prompt_spec: self.prompt_spec,
            priority: self.priority,
            references: self.references,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteAssetJobRequest {
    pub asset: AssetCreateSpec,
}

#[derive(Debug, Deserialize)]
pub struct FailAssetJobRequest {
    pub error_code: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Query string of `GET /asset-jobs`. Kept as raw strings so bad values
/// come back as JSON errors instead of extractor rejections.
#[derive(Debug, Default, Deserialize)]
pub struct ListAssetJobsQuery {
    pub world_id: Option<String>,
    pub status: Option<String>,
    pub asset_type: Option<String>,
    pub provider: Option<String>,
    pub requested_by: Option<String>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub skip: Option<String>,
    pub limit: Option<String>,
}

impl ListAssetJobsQuery {
    pub fn into_filter(self) -> Result<(JobFilter, Page), axum::response::Response> {
        let filter = JobFilter {
            world_id: parse_opt(self.world_id, "world_id")?,
            status: parse_opt::<JobStatus>(self.status, "status")?,
            asset_type: parse_opt::<AssetType>(self.asset_type, "asset_type")?,
            provider: non_blank(self.provider),
            requested_by: non_blank(self.requested_by),
            created_after: parse_time(self.created_after, "created_after")?,
            created_before: parse_time(self.created_before, "created_before")?,
        };

        Ok((filter, parse_page(self.skip, self.limit)?))
    }
}

/// Query string of `GET /assets`.
#[derive(Debug, Default, Deserialize)]
pub struct ListAssetsQuery {
    pub world_id: Option<String>,
    pub asset_type: Option<String>,
    pub status: Option<String>,
    pub created_by: Option<String>,
    pub related_claim_id: Option<String>,
    pub related_entity_id: Option<String>,
    pub related_source_chunk_id: Option<String>,
    pub source_id: Option<String>,
    pub skip: Option<String>,
    pub limit: Option<String>,
}

impl ListAssetsQuery {
    pub fn into_filter(self) -> Result<(AssetFilter, Page), axum::response::Response> {
        let filter = AssetFilter {
            world_id: parse_opt(self.world_id, "world_id")?,
            asset_type: parse_opt::<AssetType>(self.asset_type, "asset_type")?,
            status: parse_opt::<AssetStatus>(self.status, "status")?,
            created_by: non_blank(self.created_by),
            claim_id: parse_opt(self.related_claim_id, "related_claim_id")?,
            entity_id: parse_opt(self.related_entity_id, "related_entity_id")?,
            source_chunk_id: parse_opt(self.related_source_chunk_id, "related_source_chunk_id")?,
            source_id: parse_opt(self.source_id, "source_id")?,
        };

        Ok((filter, parse_page(self.skip, self.limit)?))
    }
}

fn parse_page(
    skip: Option<String>,
    limit: Option<String>,
) -> Result<Page, axum::response::Response> {
    let skip = parse_opt::<usize>(skip, "skip")?.unwrap_or(0);
    let limit = parse_opt::<usize>(limit, "limit")?
        .unwrap_or(DEFAULT_LIMIT)
        .clamp(1, MAX_LIMIT);
    Ok(Page { skip, limit })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_opt<T: std::str::FromStr>(
    value: Option<String>,
    field: &'static str,
) -> Result<Option<T>, axum::response::Response> {
    match non_blank(value) {
        None => Ok(None),
        Some(v) => v.parse::<T>().map(Some).map_err(|_| invalid_query(field)),
    }
}

fn parse_time(
    value: Option<String>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, axum::response::Response> {
    match non_blank(value) {
        None => Ok(None),
        Some(v) => DateTime::parse_from_rfc3339(&v)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| invalid_query(field)),
    }
}

fn invalid_query(field: &'static str) -> axum::response::Response {
    errors::json_error(
        StatusCode::BAD_REQUEST,
        "validation_error",
        format!("invalid query parameter: {field}"),
    )
}
