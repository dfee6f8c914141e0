//! Lore references and submission-time snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::id::{ClaimId, EntityId, SourceChunkId, SourceId};

/// Kind of lore object a derivation can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoreKind {
    Claim,
    Entity,
    SourceChunk,
}

impl LoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoreKind::Claim => "claim",
            LoreKind::Entity => "entity",
            LoreKind::SourceChunk => "source_chunk",
        }
    }
}

impl core::fmt::Display for LoreKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The lore objects a request says justify it.
///
/// Id lists are kept sorted and free of duplicates once passed through
/// [`LoreReferences::normalized`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreReferences {
    #[serde(default)]
    pub claim_ids: Vec<ClaimId>,
    #[serde(default)]
    pub entity_ids: Vec<EntityId>,
    #[serde(default)]
    pub source_chunk_ids: Vec<SourceChunkId>,
    #[serde(default)]
    pub source_id: Option<SourceId>,
}

impl LoreReferences {
    pub fn normalized(mut self) -> Self {
        self.claim_ids.sort();
        self.claim_ids.dedup();
        self.entity_ids.sort();
        self.entity_ids.dedup();
        self.source_chunk_ids.sort();
        self.source_chunk_ids.dedup();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.claim_ids.is_empty()
            && self.entity_ids.is_empty()
            && self.source_chunk_ids.is_empty()
            && self.source_id.is_none()
    }

    /// Flattened `(kind, id)` pairs, claims first.
    pub fn iter(&self) -> impl Iterator<Item = (LoreKind, Uuid)> + '_ {
        self.claim_ids
            .iter()
            .map(|id| (LoreKind::Claim, Uuid::from(*id)))
            .chain(
                self.entity_ids
                    .iter()
                    .map(|id| (LoreKind::Entity, Uuid::from(*id))),
            )
            .chain(
                self.source_chunk_ids
                    .iter()
                    .map(|id| (LoreKind::SourceChunk, Uuid::from(*id))),
            )
    }

    /// Rebuild from flat reference rows.
    pub fn from_rows(
        rows: impl IntoIterator<Item = (LoreKind, Uuid)>,
        source_id: Option<SourceId>,
    ) -> Self {
        let mut refs = LoreReferences {
            source_id,
            ..Default::default()
        };
        for (kind, id) in rows {
            match kind {
                LoreKind::Claim => refs.claim_ids.push(id.into()),
                LoreKind::Entity => refs.entity_ids.push(id.into()),
                LoreKind::SourceChunk => refs.source_chunk_ids.push(id.into()),
            }
        }
        refs.normalized()
    }
}

/// Frozen view of the referenced lore at submission time.
///
/// Maps object id to a last-modified marker. The marker is empty unless
/// drift-sensitive hashing is enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoreSnapshot {
    #[serde(default)]
    pub claims: BTreeMap<String, String>,
    #[serde(default)]
    pub entities: BTreeMap<String, String>,
    #[serde(default)]
    pub source_chunks: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

impl LoreSnapshot {
    /// Snapshot with empty markers for every reference.
    pub fn of(references: &LoreReferences) -> Self {
        let mut snapshot = LoreSnapshot {
            source_id: references.source_id,
            ..Default::default()
        };
        for (kind, id) in references.iter() {
            snapshot.record(kind, id, String::new());
        }
        snapshot
    }

    pub fn record(&mut self, kind: LoreKind, id: Uuid, marker: String) {
        let bucket = match kind {
            LoreKind::Claim => &mut self.claims,
            LoreKind::Entity => &mut self.entities,
            LoreKind::SourceChunk => &mut self.source_chunks,
        };
        bucket.insert(id.to_string(), marker);
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.captured_at = Some(at);
        self
    }

    pub fn contains(&self, kind: LoreKind, id: Uuid) -> bool {
        let key = id.to_string();
        match kind {
            LoreKind::Claim => self.claims.contains_key(&key),
            LoreKind::Entity => self.entities.contains_key(&key),
            LoreKind::SourceChunk => self.source_chunks.contains_key(&key),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
