//! Provenance records linking a job to the lore that justified it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::id::{AssetId, AssetJobId, DerivationId, SourceId};
use crate::lore::LoreKind;

/// Exactly one per job, created together with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDerivation {
    pub id: DerivationId,
    pub asset_job_id: AssetJobId,
    pub asset_id: Option<AssetId>,
    pub source_id: Option<SourceId>,
    pub prompt_spec: serde_json::Value,
    pub input_hash: String,
    pub lore_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AssetDerivation {
    /// Point the derivation at its artifact. Set once, never reassigned.
    pub fn link_asset(&mut self, asset_id: AssetId) -> DomainResult<()> {
        match self.asset_id {
            None => {
                self.asset_id = Some(asset_id);
                Ok(())
            }
            Some(existing) if existing == asset_id => Ok(()),
            Some(existing) => Err(DomainError::conflict(format!(
                "derivation {} already linked to asset {existing}",
                self.id
            ))),
        }
    }
}

/// Join row from a derivation to one referenced lore object. Immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivationReference {
    pub derivation_id: DerivationId,
    pub kind: LoreKind,
    pub lore_id: Uuid,
}
