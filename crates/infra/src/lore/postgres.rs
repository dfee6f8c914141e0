//! Postgres lore catalog over the lore service's tables.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use lorekeeper_core::{LoreKind, SourceId, WorldId};

use super::{LoreCatalog, LoreCatalogError, LoreRecord};

#[derive(Debug, Clone)]
pub struct PostgresLoreCatalog {
    pool: Arc<PgPool>,
}

impl PostgresLoreCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn lookup_sql(kind: LoreKind) -> &'static str {
    match kind {
        LoreKind::Claim => "SELECT id, world_id, updated_at FROM claim WHERE id = ANY($1)",
        LoreKind::Entity => "SELECT id, world_id, updated_at FROM entity WHERE id = ANY($1)",
        LoreKind::SourceChunk => {
            r#"
            SELECT c.id, s.world_id, c.updated_at
            FROM source_chunk c
            JOIN source s ON s.id = c.source_id
            WHERE c.id = ANY($1)
            "#
        }
    }
}

fn unavailable(operation: &str, err: sqlx::Error) -> LoreCatalogError {
    LoreCatalogError::Unavailable(format!("sqlx error in {operation}: {err}"))
}

#[async_trait::async_trait]
impl LoreCatalog for PostgresLoreCatalog {
    #[instrument(skip(self), fields(world_id = %world_id), err)]
    async fn world_exists(&self, world_id: WorldId) -> Result<bool, LoreCatalogError> {
        sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM world WHERE id = $1)")
            .bind(world_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| unavailable("world_exists", e))
    }

    #[instrument(skip(self, ids), fields(kind = %kind, count = ids.len()), err)]
    async fn lookup(
        &self,
        kind: LoreKind,
        ids: &[Uuid],
    ) -> Result<Vec<LoreRecord>, LoreCatalogError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(lookup_sql(kind))
            .bind(ids)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| unavailable("lookup", e))?;

        rows.iter()
            .map(|row| {
                let id: Uuid = row.try_get("id").map_err(|e| unavailable("lookup", e))?;
                let world_id: Uuid = row
                    .try_get("world_id")
                    .map_err(|e| unavailable("lookup", e))?;
                let updated_at: Option<DateTime<Utc>> = row
                    .try_get("updated_at")
                    .map_err(|e| unavailable("lookup", e))?;
                Ok(LoreRecord {
                    kind,
                    id,
                    world_id: world_id.into(),
                    updated_at,
                })
            })
            .collect()
    }

    async fn source_world(
        &self,
        source_id: SourceId,
    ) -> Result<Option<WorldId>, LoreCatalogError> {
        let world: Option<Uuid> =
            sqlx::query_scalar("SELECT world_id FROM source WHERE id = $1")
                .bind(source_id.as_uuid())
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| unavailable("source_world", e))?;
        Ok(world.map(Into::into))
    }
}
