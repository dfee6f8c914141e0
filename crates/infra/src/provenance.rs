//! Reference validation and lore snapshot capture.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use lorekeeper_core::{LoreKind, LoreReferences, LoreSnapshot, WorldId};

use crate::error::PipelineError;
use crate::lore::LoreCatalog;

/// Validates that every referenced lore object exists inside the job's world
/// and freezes what was referenced.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProvenanceBuilder {
    /// Record `updated_at` as the snapshot marker for each object.
    drift_sensitive: bool,
}

impl ProvenanceBuilder {
    pub fn new(drift_sensitive: bool) -> Self {
        Self { drift_sensitive }
    }

    pub fn is_drift_sensitive(&self) -> bool {
        self.drift_sensitive
    }

    /// Checks run in a fixed order: world, source, then claims, entities and
    /// chunks. The first failure wins.
    #[instrument(skip(self, catalog, references), fields(world_id = %world_id), err)]
    pub async fn capture<C>(
        &self,
        catalog: &C,
        world_id: WorldId,
        references: &LoreReferences,
        now: DateTime<Utc>,
    ) -> Result<LoreSnapshot, PipelineError>
    where
        C: LoreCatalog + ?Sized,
    {
        if !catalog.world_exists(world_id).await? {
            return Err(PipelineError::WorldNotFound(world_id));
        }

        if let Some(source_id) = references.source_id {
            match catalog.source_world(source_id).await? {
                None => return Err(PipelineError::reference_not_found_named("source", source_id)),
                Some(owner) if owner != world_id => {
                    return Err(PipelineError::ScopeViolation(format!(
                        "source {source_id} belongs to a different world"
                    )));
                }
                Some(_) => {}
            }
        }

        let mut snapshot = LoreSnapshot::of(references);
        for kind in [LoreKind::Claim, LoreKind::Entity, LoreKind::SourceChunk] {
            let ids: Vec<Uuid> = references
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, id)| id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let found: HashMap<Uuid, _> = catalog
                .lookup(kind, &ids)
                .await?
                .into_iter()
                .map(|record| (record.id, record))
                .collect();

            for id in ids {
                let record = found
                    .get(&id)
                    .ok_or_else(|| PipelineError::reference_not_found(kind, id))?;
                if record.world_id != world_id {
                    return Err(PipelineError::ScopeViolation(format!(
                        "{kind} {id} belongs to a different world"
                    )));
                }
                let marker = match (self.drift_sensitive, record.updated_at) {
                    (true, Some(at)) => at.to_rfc3339(),
                    _ => String::new(),
                };
                snapshot.record(kind, id, marker);
            }
        }

        debug!(
            claims = snapshot.claims.len(),
            entities = snapshot.entities.len(),
            source_chunks = snapshot.source_chunks.len(),
            "captured lore snapshot"
        );
        Ok(snapshot.captured_at(now))
    }
}
