//! Records and read views exchanged with the job store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lorekeeper_core::{
    Asset, AssetDerivation, AssetJob, AssetJobId, AssetStatus, AssetType, ClaimId, EntityId,
    JobStatus, LoreReferences, SourceChunkId, SourceId, WorldId,
};

/// Everything the submission flow creates in one atomic write.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAssetJob {
    pub job: AssetJob,
    pub derivation: AssetDerivation,
    /// Normalized reference set; becomes the derivation's join rows.
    pub references: LoreReferences,
}

/// Result of an idempotent create.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(AssetJobView),
    /// A non-FAILED job with the same `(world_id, input_hash)` already exists.
    Existing(AssetJobView),
}

impl CreateOutcome {
    pub fn view(&self) -> &AssetJobView {
        match self {
            CreateOutcome::Created(v) | CreateOutcome::Existing(v) => v,
        }
    }

    pub fn into_view(self) -> AssetJobView {
        match self {
            CreateOutcome::Created(v) | CreateOutcome::Existing(v) => v,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Derivation joined with its reference rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivationView {
    #[serde(flatten)]
    pub derivation: AssetDerivation,
    pub claim_ids: Vec<ClaimId>,
    pub entity_ids: Vec<EntityId>,
    pub source_chunk_ids: Vec<SourceChunkId>,
}

impl DerivationView {
    pub fn new(derivation: AssetDerivation, references: LoreReferences) -> Self {
        Self {
            derivation,
            claim_ids: references.claim_ids,
            entity_ids: references.entity_ids,
            source_chunk_ids: references.source_chunk_ids,
        }
    }

    pub fn references(&self) -> LoreReferences {
        LoreReferences {
            claim_ids: self.claim_ids.clone(),
            entity_ids: self.entity_ids.clone(),
            source_chunk_ids: self.source_chunk_ids.clone(),
            source_id: self.derivation.source_id,
        }
    }
}

/// Job + derivation + linked asset, as returned by every job endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetJobView {
    #[serde(flatten)]
    pub job: AssetJob,
    pub derivation: DerivationView,
    pub asset: Option<Asset>,
}

/// Where an asset came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetProvenance {
    pub asset_job_id: AssetJobId,
    pub job_status: JobStatus,
    pub requested_by: String,
    pub derivation: DerivationView,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetView {
    #[serde(flatten)]
    pub asset: Asset,
    pub provenance: Option<AssetProvenance>,
}

/// Listing filter; every field is optional and they combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub world_id: Option<WorldId>,
    pub status: Option<JobStatus>,
    pub asset_type: Option<AssetType>,
    pub provider: Option<String>,
    pub requested_by: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn matches(&self, job: &AssetJob) -> bool {
        self.world_id.is_none_or(|w| job.world_id == w)
            && self.status.is_none_or(|s| job.status == s)
            && self.asset_type.is_none_or(|t| job.asset_type == t)
            && self.provider.as_deref().is_none_or(|p| job.provider == p)
            && self
                .requested_by
                .as_deref()
                .is_none_or(|r| job.requested_by == r)
            && self.created_after.is_none_or(|t| job.created_at >= t)
            && self.created_before.is_none_or(|t| job.created_at <= t)
    }
}

/// Asset listing filter. The lore fields match assets whose derivation
/// references that id; all fields combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetFilter {
    pub world_id: Option<WorldId>,
    pub asset_type: Option<AssetType>,
    pub status: Option<AssetStatus>,
    pub created_by: Option<String>,
    pub claim_id: Option<ClaimId>,
    pub entity_id: Option<EntityId>,
    pub source_chunk_id: Option<SourceChunkId>,
    pub source_id: Option<SourceId>,
}

impl AssetFilter {
    /// Columns of the asset row itself.
    pub fn matches_asset(&self, asset: &Asset) -> bool {
        self.world_id.is_none_or(|w| asset.world_id == w)
            && self.asset_type.is_none_or(|t| asset.asset_type == t)
            && self.status.is_none_or(|s| asset.status == s)
            && self
                .created_by
                .as_deref()
                .is_none_or(|c| asset.created_by == c)
    }

    pub fn has_lore_filter(&self) -> bool {
        self.claim_id.is_some()
            || self.entity_id.is_some()
            || self.source_chunk_id.is_some()
            || self.source_id.is_some()
    }

    /// Lore filters against the producing derivation's references.
    pub fn matches_references(&self, references: &LoreReferences) -> bool {
        self.claim_id.is_none_or(|id| references.claim_ids.contains(&id))
            && self.entity_id.is_none_or(|id| references.entity_ids.contains(&id))
            && self
                .source_chunk_id
                .is_none_or(|id| references.source_chunk_ids.contains(&id))
            && self.source_id.is_none_or(|id| references.source_id == Some(id))
    }
}

/// Offset pagination. `limit` is expected to be pre-clamped by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self { skip: 0, limit: 10 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPage {
    pub total: u64,
    pub skip: usize,
    pub limit: usize,
    pub items: Vec<AssetJobView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetPage {
    pub total: u64,
    pub skip: usize,
    pub limit: usize,
    pub items: Vec<Asset>,
}
