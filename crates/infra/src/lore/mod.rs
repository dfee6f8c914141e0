//! Read-only access to lore objects owned by the lore service.
//!
//! The pipeline only ever asks three questions: does a world exist, which
//! world does each referenced object belong to, and when was it last touched.

pub mod postgres;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use lorekeeper_core::{ClaimId, EntityId, LoreKind, SourceChunkId, SourceId, WorldId};

pub use postgres::PostgresLoreCatalog;

/// Ownership record for one lore object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoreRecord {
    pub kind: LoreKind,
    pub id: Uuid,
    pub world_id: WorldId,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoreCatalogError {
    #[error("lore catalog unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait LoreCatalog: Send + Sync {
    async fn world_exists(&self, world_id: WorldId) -> Result<bool, LoreCatalogError>;

    /// Records for the ids that exist; unknown ids are simply absent.
    async fn lookup(&self, kind: LoreKind, ids: &[Uuid])
    -> Result<Vec<LoreRecord>, LoreCatalogError>;

    async fn source_world(&self, source_id: SourceId)
    -> Result<Option<WorldId>, LoreCatalogError>;
}

#[async_trait::async_trait]
impl<C> LoreCatalog for Arc<C>
where
    C: LoreCatalog + ?Sized,
{
    async fn world_exists(&self, world_id: WorldId) -> Result<bool, LoreCatalogError> {
        (**self).world_exists(world_id).await
    }

    async fn lookup(
        &self,
        kind: LoreKind,
        ids: &[Uuid],
    ) -> Result<Vec<LoreRecord>, LoreCatalogError> {
        (**self).lookup(kind, ids).await
    }

    async fn source_world(
        &self,
        source_id: SourceId,
    ) -> Result<Option<WorldId>, LoreCatalogError> {
        (**self).source_world(source_id).await
    }
}

#[derive(Debug, Clone)]
struct Owned {
    world_id: WorldId,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Catalog {
    worlds: HashMap<WorldId, DateTime<Utc>>,
    claims: HashMap<Uuid, Owned>,
    entities: HashMap<Uuid, Owned>,
    sources: HashMap<SourceId, WorldId>,
    chunks: HashMap<Uuid, (SourceId, DateTime<Utc>)>,
}

/// In-memory lore catalog for tests/dev.
///
/// Chunks carry no world of their own; it is resolved through their source,
/// the same way the relational schema does it.
#[derive(Debug, Default)]
pub struct InMemoryLoreCatalog {
    inner: RwLock<Catalog>,
}

impl InMemoryLoreCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_world(&self, world_id: WorldId) {
        if let Ok(mut c) = self.inner.write() {
            c.worlds.insert(world_id, Utc::now());
        }
    }

    pub fn insert_claim(&self, world_id: WorldId, claim_id: ClaimId) {
        self.touch_claim(world_id, claim_id, Utc::now());
    }

    /// Insert or update a claim with an explicit modification time.
    pub fn touch_claim(&self, world_id: WorldId, claim_id: ClaimId, updated_at: DateTime<Utc>) {
        if let Ok(mut c) = self.inner.write() {
            c.claims.insert(
                claim_id.into(),
                Owned {
                    world_id,
                    updated_at,
                },
            );
        }
    }

    pub fn insert_entity(&self, world_id: WorldId, entity_id: EntityId) {
        if let Ok(mut c) = self.inner.write() {
            c.entities.insert(
                entity_id.into(),
                Owned {
                    world_id,
                    updated_at: Utc::now(),
                },
            );
        }
    }

    pub fn insert_source(&self, world_id: WorldId, source_id: SourceId) {
        if let Ok(mut c) = self.inner.write() {
            c.sources.insert(source_id, world_id);
        }
    }

    pub fn insert_chunk(&self, source_id: SourceId, chunk_id: SourceChunkId) {
        if let Ok(mut c) = self.inner.write() {
            c.chunks.insert(chunk_id.into(), (source_id, Utc::now()));
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Catalog>, LoreCatalogError> {
        self.inner
            .read()
            .map_err(|_| LoreCatalogError::Unavailable("lore catalog lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl LoreCatalog for InMemoryLoreCatalog {
    async fn world_exists(&self, world_id: WorldId) -> Result<bool, LoreCatalogError> {
        Ok(self.read()?.worlds.contains_key(&world_id))
    }

    async fn lookup(
        &self,
        kind: LoreKind,
        ids: &[Uuid],
    ) -> Result<Vec<LoreRecord>, LoreCatalogError> {
        let c = self.read()?;
        let records = ids
            .iter()
            .filter_map(|id| {
                let (world_id, updated_at) = match kind {
                    LoreKind::Claim => c.claims.get(id).map(|o| (o.world_id, o.updated_at))?,
                    LoreKind::Entity => c.entities.get(id).map(|o| (o.world_id, o.updated_at))?,
                    LoreKind::SourceChunk => {
                        let (source_id, updated_at) = c.chunks.get(id)?;
                        (*c.sources.get(source_id)?, *updated_at)
                    }
                };
                Some(LoreRecord {
                    kind,
                    id: *id,
                    world_id,
                    updated_at: Some(updated_at),
                })
            })
            .collect();
        Ok(records)
    }

    async fn source_world(
        &self,
        source_id: SourceId,
    ) -> Result<Option<WorldId>, LoreCatalogError> {
        Ok(self.read()?.sources.get(&source_id).copied())
    }
}
