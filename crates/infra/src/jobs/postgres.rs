//! Postgres-backed job store.
//!
//! ## Atomicity
//!
//! - Submission takes a transaction-scoped advisory lock on
//!   `(world_id, input_hash)` before looking for an existing job, so two
//!   concurrent identical submissions serialize and the second one sees the
//!   first.
//! - Status changes and completion lock the job row with `SELECT ... FOR UPDATE`
//!   and validate against the locked row.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;
use uuid::Uuid;

use lorekeeper_core::{
    Asset, AssetCreateSpec, AssetDerivation, AssetId, AssetJob, AssetJobId, AssetStatus,
    AssetType, JobStatus, LoreKind, LoreReferences, StatusChange, WorldId,
};

use super::store::{CompletePlan, JobStore, JobStoreError, plan_complete};
use super::types::{
    AssetFilter, AssetJobView, AssetPage, AssetProvenance, AssetView, CreateOutcome,
    DerivationView, JobFilter, JobPage, NewAssetJob, Page,
};

const MIGRATION: &str = include_str!("../../migrations/0001_asset_pipeline.sql");

const JOB_COLUMNS: &str = "id, world_id, asset_type, provider, model_id, status, priority, \
     requested_by, input_hash, prompt_spec, error_code, error_message, created_at, started_at, \
     finished_at";

const ASSET_COLUMNS: &str = "id, world_id, asset_type, format, status, storage_key, \
     content_type, duration_seconds, size_bytes, checksum, metadata, created_by, created_at";

const DERIVATION_COLUMNS: &str =
    "id, asset_job_id, asset_id, source_id, prompt_spec, input_hash, lore_snapshot, created_at";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create pipeline tables if they do not exist yet.
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn views(&self, ids: Vec<Uuid>) -> Result<Vec<AssetJobView>, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            let id = AssetJobId::from_uuid(id);
            let view = load_view(&mut conn, id)
                .await?
                .ok_or_else(|| JobStoreError::job_not_found(id))?;
            views.push(view);
        }
        Ok(views)
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(
        skip(self, new),
        fields(world_id = %new.job.world_id, input_hash = %new.job.input_hash),
        err
    )]
    async fn create_or_get(&self, new: NewAssetJob) -> Result<CreateOutcome, JobStoreError> {
        let NewAssetJob {
            job,
            derivation,
            references,
        } = new;

        let mut tx = self.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("{}:{}", job.world_id, job.input_hash))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advisory_lock", e))?;

        let latest = sqlx::query(
            r#"
            SELECT id, status
            FROM asset_job
            WHERE world_id = $1 AND input_hash = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(job.world_id.as_uuid())
        .bind(&job.input_hash)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_latest_by_hash", e))?;

        if let Some(row) = latest {
            let status: String = row.try_get("status").map_err(row_error)?;
            if parse_status(&status)? != JobStatus::Failed {
                let id = AssetJobId::from_uuid(row.try_get("id").map_err(row_error)?);
                let view = load_view(&mut tx, id)
                    .await?
                    .ok_or_else(|| JobStoreError::job_not_found(id))?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                return Ok(CreateOutcome::Existing(view));
            }
        }

        insert_job(&mut tx, &job).await?;
        insert_derivation(&mut tx, &derivation).await?;
        for (kind, lore_id) in references.normalized().iter() {
            let sql = match kind {
                LoreKind::Claim => {
                    "INSERT INTO asset_derivation_claim (derivation_id, claim_id) VALUES ($1, $2)"
                }
                LoreKind::Entity => {
                    "INSERT INTO asset_derivation_entity (derivation_id, entity_id) VALUES ($1, $2)"
                }
                LoreKind::SourceChunk => {
                    "INSERT INTO asset_derivation_source_chunk (derivation_id, source_chunk_id) VALUES ($1, $2)"
                }
            };
            sqlx::query(sql)
                .bind(derivation.id.as_uuid())
                .bind(lore_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_reference", e))?;
        }

        let view = load_view(&mut tx, job.id)
            .await?
            .ok_or_else(|| JobStoreError::job_not_found(job.id))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(CreateOutcome::Created(view))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: AssetJobId) -> Result<Option<AssetJobView>, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        load_view(&mut conn, id).await
    }

    async fn find_latest_by_hash(
        &self,
        world_id: WorldId,
        input_hash: &str,
    ) -> Result<Option<AssetJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM asset_job WHERE world_id = $1 AND input_hash = $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(world_id.as_uuid())
        .bind(input_hash)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_latest_by_hash", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, filter), fields(skip = page.skip, limit = page.limit), err)]
    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, JobStoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM asset_job WHERE TRUE");
        push_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let mut select = QueryBuilder::<Postgres>::new("SELECT id FROM asset_job WHERE TRUE");
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.skip as i64);
        let ids = select
            .build_query_scalar::<Uuid>()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        Ok(JobPage {
            total: total.max(0) as u64,
            skip: page.skip,
            limit: page.limit,
            items: self.views(ids).await?,
        })
    }

    #[instrument(skip(self, change), fields(job_id = %id, status = %change.status), err)]
    async fn apply_status_change(
        &self,
        id: AssetJobId,
        change: StatusChange,
    ) -> Result<AssetJobView, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, id)
            .await?
            .ok_or_else(|| JobStoreError::job_not_found(id))?;

        job.apply_status_change(change)?;
        update_job_status(&mut tx, &job).await?;

        let view = load_view(&mut tx, id)
            .await?
            .ok_or_else(|| JobStoreError::job_not_found(id))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(view)
    }

    #[instrument(skip(self, spec), fields(job_id = %id, storage_key = %spec.storage_key), err)]
    async fn complete(
        &self,
        id: AssetJobId,
        spec: AssetCreateSpec,
        now: DateTime<Utc>,
    ) -> Result<AssetJobView, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = lock_job(&mut tx, id)
            .await?
            .ok_or_else(|| JobStoreError::job_not_found(id))?;
        let mut derivation = load_derivation(&mut tx, id).await?.ok_or_else(|| {
            JobStoreError::Storage(format!("job {id} has no derivation record"))
        })?;
        let linked = match derivation.asset_id {
            Some(asset_id) => load_asset(&mut tx, asset_id).await?,
            None => None,
        };

        let updated = match plan_complete(&job, linked.as_ref(), &spec, now)? {
            CompletePlan::Replay => {
                let view = load_view(&mut tx, id)
                    .await?
                    .ok_or_else(|| JobStoreError::job_not_found(id))?;
                tx.commit()
                    .await
                    .map_err(|e| map_sqlx_error("commit_transaction", e))?;
                return Ok(view);
            }
            CompletePlan::Apply(updated) => updated,
        };

        let asset = spec.into_asset(now);
        derivation.link_asset(asset.id)?;
        insert_asset(&mut tx, &asset).await?;

        sqlx::query("UPDATE asset_derivation SET asset_id = $2 WHERE id = $1")
            .bind(derivation.id.as_uuid())
            .bind(asset.id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("link_asset", e))?;
        update_job_status(&mut tx, &updated).await?;

        let view = load_view(&mut tx, id)
            .await?
            .ok_or_else(|| JobStoreError::job_not_found(id))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(view)
    }

    #[instrument(skip(self), fields(asset_id = %id), err)]
    async fn get_asset(&self, id: AssetId) -> Result<Option<AssetView>, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        let Some(asset) = load_asset(&mut conn, id).await? else {
            return Ok(None);
        };

        let row = sqlx::query(&format!(
            "SELECT {DERIVATION_COLUMNS} FROM asset_derivation WHERE asset_id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("load_asset_derivation", e))?;

        let provenance = match row {
            None => None,
            Some(row) => {
                let derivation = derivation_from_row(&row)?;
                let job = load_job(&mut conn, derivation.asset_job_id).await?;
                match job {
                    None => None,
                    Some(job) => {
                        let references = load_references(&mut conn, &derivation).await?;
                        Some(AssetProvenance {
                            asset_job_id: job.id,
                            job_status: job.status,
                            requested_by: job.requested_by,
                            derivation: DerivationView::new(derivation, references),
                        })
                    }
                }
            }
        };

        Ok(Some(AssetView { asset, provenance }))
    }

    #[instrument(skip(self, filter), err)]
    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: Page,
    ) -> Result<AssetPage, JobStoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM asset WHERE TRUE");
        push_asset_filter(&mut count, filter);
        let total = count
            .build_query_scalar::<i64>()
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_assets", e))?;

        let mut select =
            QueryBuilder::<Postgres>::new(format!("SELECT {ASSET_COLUMNS} FROM asset WHERE TRUE"));
        push_asset_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(page.limit as i64)
            .push(" OFFSET ")
            .push_bind(page.skip as i64);
        let rows = select
            .build()
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_assets", e))?;

        Ok(AssetPage {
            total: total.max(0) as u64,
            skip: page.skip,
            limit: page.limit,
            items: rows.iter().map(asset_from_row).collect::<Result<_, _>>()?,
        })
    }

    #[instrument(skip(self), err)]
    async fn list_stale_queued(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AssetJobView>, JobStoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM asset_job
            WHERE status = 'QUEUED' AND created_at <= $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale_queued", e))?;

        self.views(ids).await
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
    if let Some(world_id) = filter.world_id {
        qb.push(" AND world_id = ").push_bind(*world_id.as_uuid());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(asset_type) = filter.asset_type {
        qb.push(" AND asset_type = ").push_bind(asset_type.as_str());
    }
    if let Some(provider) = &filter.provider {
        qb.push(" AND provider = ").push_bind(provider.clone());
    }
    if let Some(requested_by) = &filter.requested_by {
        qb.push(" AND requested_by = ").push_bind(requested_by.clone());
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND created_at <= ").push_bind(before);
    }
}

fn push_asset_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &AssetFilter) {
    if let Some(world_id) = filter.world_id {
        qb.push(" AND world_id = ").push_bind(*world_id.as_uuid());
    }
    if let Some(asset_type) = filter.asset_type {
        qb.push(" AND asset_type = ").push_bind(asset_type.as_str());
    }
    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(created_by) = &filter.created_by {
        qb.push(" AND created_by = ").push_bind(created_by.clone());
    }
    if let Some(source_id) = filter.source_id {
        qb.push(
            " AND EXISTS (SELECT 1 FROM asset_derivation d \
             WHERE d.asset_id = asset.id AND d.source_id = ",
        )
        .push_bind(*source_id.as_uuid())
        .push(")");
    }
    for (table, column, id) in [
        ("asset_derivation_claim", "claim_id", filter.claim_id.map(|i| *i.as_uuid())),
        ("asset_derivation_entity", "entity_id", filter.entity_id.map(|i| *i.as_uuid())),
        (
            "asset_derivation_source_chunk",
            "source_chunk_id",
            filter.source_chunk_id.map(|i| *i.as_uuid()),
        ),
    ] {
        if let Some(id) = id {
            qb.push(format!(
                " AND EXISTS (SELECT 1 FROM asset_derivation d JOIN {table} r \
                 ON r.derivation_id = d.id WHERE d.asset_id = asset.id AND r.{column} = "
            ))
            .push_bind(id)
            .push(")");
        }
    }
}

async fn insert_job(conn: &mut PgConnection, job: &AssetJob) -> Result<(), JobStoreError> {
    sqlx::query(&format!(
        "INSERT INTO asset_job ({JOB_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
    ))
    .bind(job.id.as_uuid())
    .bind(job.world_id.as_uuid())
    .bind(job.asset_type.as_str())
    .bind(&job.provider)
    .bind(&job.model_id)
    .bind(job.status.as_str())
    .bind(job.priority)
    .bind(&job.requested_by)
    .bind(&job.input_hash)
    .bind(&job.prompt_spec)
    .bind(&job.error_code)
    .bind(&job.error_message)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.finished_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

async fn insert_derivation(
    conn: &mut PgConnection,
    derivation: &AssetDerivation,
) -> Result<(), JobStoreError> {
    sqlx::query(&format!(
        "INSERT INTO asset_derivation ({DERIVATION_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
    ))
    .bind(derivation.id.as_uuid())
    .bind(derivation.asset_job_id.as_uuid())
    .bind(derivation.asset_id.map(Uuid::from))
    .bind(derivation.source_id.map(Uuid::from))
    .bind(&derivation.prompt_spec)
    .bind(&derivation.input_hash)
    .bind(&derivation.lore_snapshot)
    .bind(derivation.created_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_derivation", e))?;
    Ok(())
}

async fn insert_asset(conn: &mut PgConnection, asset: &Asset) -> Result<(), JobStoreError> {
    sqlx::query(&format!(
        "INSERT INTO asset ({ASSET_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    ))
    .bind(asset.id.as_uuid())
    .bind(asset.world_id.as_uuid())
    .bind(asset.asset_type.as_str())
    .bind(&asset.format)
    .bind(asset.status.as_str())
    .bind(&asset.storage_key)
    .bind(&asset.content_type)
    .bind(asset.duration_seconds)
    .bind(asset.size_bytes)
    .bind(&asset.checksum)
    .bind(&asset.metadata)
    .bind(&asset.created_by)
    .bind(asset.created_at)
    .execute(conn)
    .await
    .map_err(|e| match map_sqlx_error("insert_asset", e) {
        JobStoreError::Conflict(_) => JobStoreError::Conflict(format!(
            "storage_key {} already belongs to another asset",
            asset.storage_key
        )),
        other => other,
    })?;
    Ok(())
}

async fn update_job_status(conn: &mut PgConnection, job: &AssetJob) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE asset_job
        SET status = $2, error_code = $3, error_message = $4, started_at = $5, finished_at = $6
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(&job.error_code)
    .bind(&job.error_message)
    .bind(job.started_at)
    .bind(job.finished_at)
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_job_status", e))?;
    Ok(())
}

async fn lock_job(conn: &mut PgConnection, id: AssetJobId) -> Result<Option<AssetJob>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM asset_job WHERE id = $1 FOR UPDATE"
    ))
    .bind(id.as_uuid())
    .fetch_optional(conn)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;
    row.as_ref().map(job_from_row).transpose()
}

async fn load_job(conn: &mut PgConnection, id: AssetJobId) -> Result<Option<AssetJob>, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM asset_job WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await
        .map_err(|e| map_sqlx_error("load_job", e))?;
    row.as_ref().map(job_from_row).transpose()
}

async fn load_derivation(
    conn: &mut PgConnection,
    job_id: AssetJobId,
) -> Result<Option<AssetDerivation>, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {DERIVATION_COLUMNS} FROM asset_derivation WHERE asset_job_id = $1"
    ))
    .bind(job_id.as_uuid())
    .fetch_optional(conn)
    .await
    .map_err(|e| map_sqlx_error("load_derivation", e))?;
    row.as_ref().map(derivation_from_row).transpose()
}

async fn load_asset(conn: &mut PgConnection, id: AssetId) -> Result<Option<Asset>, JobStoreError> {
    let row = sqlx::query(&format!("SELECT {ASSET_COLUMNS} FROM asset WHERE id = $1"))
        .bind(id.as_uuid())
        .fetch_optional(conn)
        .await
        .map_err(|e| map_sqlx_error("load_asset", e))?;
    row.as_ref().map(asset_from_row).transpose()
}

async fn load_references(
    conn: &mut PgConnection,
    derivation: &AssetDerivation,
) -> Result<LoreReferences, JobStoreError> {
    let mut rows = Vec::new();
    for (kind, sql) in [
        (
            LoreKind::Claim,
            "SELECT claim_id FROM asset_derivation_claim WHERE derivation_id = $1",
        ),
        (
            LoreKind::Entity,
            "SELECT entity_id FROM asset_derivation_entity WHERE derivation_id = $1",
        ),
        (
            LoreKind::SourceChunk,
            "SELECT source_chunk_id FROM asset_derivation_source_chunk WHERE derivation_id = $1",
        ),
    ] {
        let ids: Vec<Uuid> = sqlx::query_scalar(sql)
            .bind(derivation.id.as_uuid())
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_references", e))?;
        rows.extend(ids.into_iter().map(|id| (kind, id)));
    }
    Ok(LoreReferences::from_rows(rows, derivation.source_id))
}

async fn load_view(
    conn: &mut PgConnection,
    id: AssetJobId,
) -> Result<Option<AssetJobView>, JobStoreError> {
    let Some(job) = load_job(conn, id).await? else {
        return Ok(None);
    };
    let derivation = load_derivation(conn, id)
        .await?
        .ok_or_else(|| JobStoreError::Storage(format!("job {id} has no derivation record")))?;
    let references = load_references(conn, &derivation).await?;
    let asset = match derivation.asset_id {
        Some(asset_id) => load_asset(conn, asset_id).await?,
        None => None,
    };

    Ok(Some(AssetJobView {
        job,
        derivation: DerivationView::new(derivation, references),
        asset,
    }))
}

fn job_from_row(row: &PgRow) -> Result<AssetJob, JobStoreError> {
    let asset_type: String = row.try_get("asset_type").map_err(row_error)?;
    let status: String = row.try_get("status").map_err(row_error)?;
    Ok(AssetJob {
        id: AssetJobId::from_uuid(row.try_get("id").map_err(row_error)?),
        world_id: WorldId::from_uuid(row.try_get("world_id").map_err(row_error)?),
        asset_type: parse_asset_type(&asset_type)?,
        provider: row.try_get("provider").map_err(row_error)?,
        model_id: row.try_get("model_id").map_err(row_error)?,
        status: parse_status(&status)?,
        priority: row.try_get("priority").map_err(row_error)?,
        requested_by: row.try_get("requested_by").map_err(row_error)?,
        input_hash: row.try_get("input_hash").map_err(row_error)?,
        prompt_spec: row.try_get("prompt_spec").map_err(row_error)?,
        error_code: row.try_get("error_code").map_err(row_error)?,
        error_message: row.try_get("error_message").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
        started_at: row.try_get("started_at").map_err(row_error)?,
        finished_at: row.try_get("finished_at").map_err(row_error)?,
    })
}

fn derivation_from_row(row: &PgRow) -> Result<AssetDerivation, JobStoreError> {
    let asset_id: Option<Uuid> = row.try_get("asset_id").map_err(row_error)?;
    let source_id: Option<Uuid> = row.try_get("source_id").map_err(row_error)?;
    Ok(AssetDerivation {
        id: row.try_get::<Uuid, _>("id").map_err(row_error)?.into(),
        asset_job_id: row.try_get::<Uuid, _>("asset_job_id").map_err(row_error)?.into(),
        asset_id: asset_id.map(Into::into),
        source_id: source_id.map(Into::into),
        prompt_spec: row.try_get("prompt_spec").map_err(row_error)?,
        input_hash: row.try_get("input_hash").map_err(row_error)?,
        lore_snapshot: row.try_get("lore_snapshot").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn asset_from_row(row: &PgRow) -> Result<Asset, JobStoreError> {
    let asset_type: String = row.try_get("asset_type").map_err(row_error)?;
    let status: String = row.try_get("status").map_err(row_error)?;
    Ok(Asset {
        id: row.try_get::<Uuid, _>("id").map_err(row_error)?.into(),
        world_id: row.try_get::<Uuid, _>("world_id").map_err(row_error)?.into(),
        asset_type: parse_asset_type(&asset_type)?,
        format: row.try_get("format").map_err(row_error)?,
        status: AssetStatus::from_str(&status)
            .map_err(|e| JobStoreError::Storage(format!("bad asset status in row: {e}")))?,
        storage_key: row.try_get("storage_key").map_err(row_error)?,
        content_type: row.try_get("content_type").map_err(row_error)?,
        duration_seconds: row.try_get("duration_seconds").map_err(row_error)?,
        size_bytes: row.try_get("size_bytes").map_err(row_error)?,
        checksum: row.try_get("checksum").map_err(row_error)?,
        metadata: row.try_get("metadata").map_err(row_error)?,
        created_by: row.try_get("created_by").map_err(row_error)?,
        created_at: row.try_get("created_at").map_err(row_error)?,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    JobStatus::from_str(raw)
        .map_err(|e| JobStoreError::Storage(format!("bad job status in row: {e}")))
}

fn parse_asset_type(raw: &str) -> Result<AssetType, JobStoreError> {
    AssetType::from_str(raw)
        .map_err(|e| JobStoreError::Storage(format!("bad asset type in row: {e}")))
}

fn row_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode row: {err}"))
}

/// Map SQLx errors to JobStoreError.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                Some("23514") => JobStoreError::Validation(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
