//! Generated artifact records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{AssetId, WorldId};

/// Kind of artifact a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetType {
    Video,
    Audio,
    Image,
    Map,
    Pdf,
}

impl AssetType {
    pub const ALL: [AssetType; 5] = [
        AssetType::Video,
        AssetType::Audio,
        AssetType::Image,
        AssetType::Map,
        AssetType::Pdf,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Video => "VIDEO",
            AssetType::Audio => "AUDIO",
            AssetType::Image => "IMAGE",
            AssetType::Map => "MAP",
            AssetType::Pdf => "PDF",
        }
    }
}

impl core::fmt::Display for AssetType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AssetType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::validation(format!("unsupported asset type: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetStatus {
    Ready,
    Failed,
    Deleted,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetStatus::Ready => "READY",
            AssetStatus::Failed => "FAILED",
            AssetStatus::Deleted => "DELETED",
        }
    }
}

impl FromStr for AssetStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "READY" => Ok(AssetStatus::Ready),
            "FAILED" => Ok(AssetStatus::Failed),
            "DELETED" => Ok(AssetStatus::Deleted),
            other => Err(DomainError::validation(format!(
                "unknown asset status: {other}"
            ))),
        }
    }
}

/// Worker-supplied description of a produced artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetCreateSpec {
    pub world_id: WorldId,
    pub asset_type: AssetType,
    pub format: String,
    pub storage_key: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_by: String,
}

impl AssetCreateSpec {
    pub fn validate(&self) -> DomainResult<()> {
        if self.storage_key.trim().is_empty() {
            return Err(DomainError::validation("asset storage_key must not be empty"));
        }
        if self.format.trim().is_empty() {
            return Err(DomainError::validation("asset format must not be empty"));
        }
        if self.content_type.trim().is_empty() {
            return Err(DomainError::validation("asset content_type must not be empty"));
        }
        if self.duration_seconds.is_some_and(|d| d < 0) {
            return Err(DomainError::validation("duration_seconds must be >= 0"));
        }
        if self.size_bytes.is_some_and(|s| s < 0) {
            return Err(DomainError::validation("size_bytes must be >= 0"));
        }
        Ok(())
    }

    pub fn into_asset(self, created_at: DateTime<Utc>) -> Asset {
        Asset {
            id: AssetId::new(),
            world_id: self.world_id,
            asset_type: self.asset_type,
            format: self.format,
            status: AssetStatus::Ready,
            storage_key: self.storage_key,
            content_type: self.content_type,
            duration_seconds: self.duration_seconds,
            size_bytes: self.size_bytes,
            checksum: self.checksum,
            metadata: self.metadata,
            created_by: self.created_by,
            created_at,
        }
    }
}

/// A stored artifact. `storage_key` is unique across all assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,
    pub world_id: WorldId,
    pub asset_type: AssetType,
    pub format: String,
    pub status: AssetStatus,
    pub storage_key: String,
    pub content_type: String,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<i64>,
    pub checksum: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> AssetCreateSpec {
        AssetCreateSpec {
            world_id: WorldId::new(),
            asset_type: AssetType::Image,
            format: "png".into(),
            storage_key: "worlds/w/assets/a.png".into(),
            content_type: "image/png".into(),
            duration_seconds: None,
            size_bytes: Some(1024),
            checksum: None,
            metadata: None,
            created_by: "worker-1".into(),
        }
    }

    #[test]
    fn asset_type_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&AssetType::Pdf).unwrap(), "\"PDF\"");
        assert_eq!("video".parse::<AssetType>().unwrap(), AssetType::Video);
        assert!("HOLOGRAM".parse::<AssetType>().is_err());
    }

    #[test]
    fn spec_rejects_blank_storage_key() {
        let mut spec = spec();
        spec.storage_key = "  ".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn into_asset_is_ready() {
        let asset = spec().into_asset(Utc::now());
        assert_eq!(asset.status, AssetStatus::Ready);
        assert_eq!(asset.size_bytes, Some(1024));
    }
}
