//! Job storage implementations.
//!
//! The store is the only writer of jobs, derivations, reference rows and
//! assets. Every status change is a single atomic read-validate-write, so two
//! workers racing on redelivered copies of one message cannot both move a job
//! out of the same state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use lorekeeper_core::{
    Asset, AssetCreateSpec, AssetDerivation, AssetId, AssetJob, AssetJobId, DerivationId,
    DerivationReference, DomainError, JobStatus, LoreReferences, StatusChange, WorldId,
    validate_transition,
};

use super::types::{
    AssetFilter, AssetJobView, AssetPage, AssetProvenance, AssetView, CreateOutcome,
    DerivationView, JobFilter, JobPage, NewAssetJob, Page,
};

/// Job store abstraction.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Insert job + derivation + reference rows, unless a non-FAILED job with
    /// the same `(world_id, input_hash)` exists, in which case that one is
    /// returned untouched.
    async fn create_or_get(&self, new: NewAssetJob) -> Result<CreateOutcome, JobStoreError>;

    async fn get(&self, id: AssetJobId) -> Result<Option<AssetJobView>, JobStoreError>;

    /// Most recent job for `(world_id, input_hash)`, any status.
    async fn find_latest_by_hash(
        &self,
        world_id: WorldId,
        input_hash: &str,
    ) -> Result<Option<AssetJob>, JobStoreError>;

    /// Newest first.
    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, JobStoreError>;

    /// Validate and apply a status change atomically.
    async fn apply_status_change(
        &self,
        id: AssetJobId,
        change: StatusChange,
    ) -> Result<AssetJobView, JobStoreError>;

    /// Create the asset, link it to the derivation and mark the job SUCCEEDED.
    ///
    /// Replaying with the same `storage_key` on an already SUCCEEDED job
    /// returns the existing view without writing anything.
    async fn complete(
        &self,
        id: AssetJobId,
        spec: AssetCreateSpec,
        now: DateTime<Utc>,
    ) -> Result<AssetJobView, JobStoreError>;

    async fn get_asset(&self, id: AssetId) -> Result<Option<AssetView>, JobStoreError>;

    /// Assets, newest first.
    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: Page,
    ) -> Result<AssetPage, JobStoreError>;

    /// QUEUED jobs created at or before `created_before`, oldest first.
    async fn list_stale_queued(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AssetJobView>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition from {current} to {attempted}")]
    InvalidTransition {
        current: JobStatus,
        attempted: JobStatus,
        allowed: Vec<JobStatus>,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn job_not_found(id: AssetJobId) -> Self {
        Self::NotFound(format!("asset job {id}"))
    }
}

impl From<DomainError> for JobStoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition {
                current,
                attempted,
                allowed,
            } => Self::InvalidTransition {
                current,
                attempted,
                allowed,
            },
            DomainError::Conflict(msg) => Self::Conflict(msg),
            DomainError::NotFound => Self::NotFound("resource".to_string()),
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::ScopeViolation(msg) => Self::Validation(msg),
        }
    }
}

#[async_trait::async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn create_or_get(&self, new: NewAssetJob) -> Result<CreateOutcome, JobStoreError> {
        (**self).create_or_get(new).await
    }

    async fn get(&self, id: AssetJobId) -> Result<Option<AssetJobView>, JobStoreError> {
        (**self).get(id).await
    }

    async fn find_latest_by_hash(
        &self,
        world_id: WorldId,
        input_hash: &str,
    ) -> Result<Option<AssetJob>, JobStoreError> {
        (**self).find_latest_by_hash(world_id, input_hash).await
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, JobStoreError> {
        (**self).list(filter, page).await
    }

    async fn apply_status_change(
        &self,
        id: AssetJobId,
        change: StatusChange,
    ) -> Result<AssetJobView, JobStoreError> {
        (**self).apply_status_change(id, change).await
    }

    async fn complete(
        &self,
        id: AssetJobId,
        spec: AssetCreateSpec,
        now: DateTime<Utc>,
    ) -> Result<AssetJobView, JobStoreError> {
        (**self).complete(id, spec, now).await
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<AssetView>, JobStoreError> {
        (**self).get_asset(id).await
    }

    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: Page,
    ) -> Result<AssetPage, JobStoreError> {
        (**self).list_assets(filter, page).await
    }

    async fn list_stale_queued(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AssetJobView>, JobStoreError> {
        (**self).list_stale_queued(created_before, limit).await
    }
}

/// Decide what `complete` does with a job in its current state.
///
/// Shared by every store implementation so replay semantics stay identical.
pub(crate) enum CompletePlan {
    /// Same artifact already linked; return as-is.
    Replay,
    /// Proceed with the given updated job.
    Apply(AssetJob),
}

pub(crate) fn plan_complete(
    job: &AssetJob,
    linked_asset: Option<&Asset>,
    spec: &AssetCreateSpec,
    now: DateTime<Utc>,
) -> Result<CompletePlan, JobStoreError> {
    if job.status == JobStatus::Succeeded {
        if linked_asset.is_some_and(|a| a.storage_key == spec.storage_key) {
            return Ok(CompletePlan::Replay);
        }
        validate_transition(job.status, JobStatus::Succeeded)?;
    }

    spec.validate()?;
    if spec.world_id != job.world_id {
        return Err(JobStoreError::Validation(format!(
            "asset world {} does not match job world {}",
            spec.world_id, job.world_id
        )));
    }
    if spec.asset_type != job.asset_type {
        return Err(JobStoreError::Validation(format!(
            "asset type {} does not match job asset type {}",
            spec.asset_type, job.asset_type
        )));
    }

    let mut updated = job.clone();
    updated.mark_succeeded(now)?;
    Ok(CompletePlan::Apply(updated))
}

/// Flat record arena; joins happen on read.
#[derive(Debug, Default)]
struct Arena {
    jobs: HashMap<AssetJobId, AssetJob>,
    derivations: HashMap<DerivationId, AssetDerivation>,
    derivation_by_job: HashMap<AssetJobId, DerivationId>,
    references: HashMap<DerivationId, Vec<DerivationReference>>,
    assets: HashMap<AssetId, Asset>,
    asset_by_storage_key: HashMap<String, AssetId>,
    jobs_by_hash: HashMap<(WorldId, String), Vec<AssetJobId>>,
}

impl Arena {
    fn view(&self, id: AssetJobId) -> Result<Option<AssetJobView>, JobStoreError> {
        let Some(job) = self.jobs.get(&id) else {
            return Ok(None);
        };
        let derivation = self.derivation_for(id)?;
        let asset = derivation
            .asset_id
            .and_then(|asset_id| self.assets.get(&asset_id).cloned());
        Ok(Some(AssetJobView {
            job: job.clone(),
            derivation: self.derivation_view(derivation),
            asset,
        }))
    }

    fn derivation_for(&self, job_id: AssetJobId) -> Result<&AssetDerivation, JobStoreError> {
        self.derivation_by_job
            .get(&job_id)
            .and_then(|d| self.derivations.get(d))
            .ok_or_else(|| {
                JobStoreError::Storage(format!("job {job_id} has no derivation record"))
            })
    }

    fn derivation_view(&self, derivation: &AssetDerivation) -> DerivationView {
        let rows = self
            .references
            .get(&derivation.id)
            .map(|rows| rows.iter().map(|r| (r.kind, r.lore_id)).collect::<Vec<_>>())
            .unwrap_or_default();
        let refs = LoreReferences::from_rows(rows, derivation.source_id);
        DerivationView::new(derivation.clone(), refs)
    }

    fn latest_by_hash(&self, world_id: WorldId, input_hash: &str) -> Option<&AssetJob> {
        self.jobs_by_hash
            .get(&(world_id, input_hash.to_string()))?
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .max_by_key(|job| (job.created_at, job.id))
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    arena: RwLock<Arena>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of asset rows (tests assert no duplicates are created).
    pub fn asset_count(&self) -> usize {
        self.arena.read().map(|a| a.assets.len()).unwrap_or(0)
    }

    pub fn job_count(&self) -> usize {
        self.arena.read().map(|a| a.jobs.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Arena>, JobStoreError> {
        self.arena
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Arena>, JobStoreError> {
        self.arena
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_or_get(&self, new: NewAssetJob) -> Result<CreateOutcome, JobStoreError> {
        let mut arena = self.write()?;

        let NewAssetJob {
            job,
            derivation,
            references,
        } = new;

        if let Some(existing) = arena.latest_by_hash(job.world_id, &job.input_hash) {
            if existing.status != JobStatus::Failed {
                let id = existing.id;
                let view = arena
                    .view(id)?
                    .ok_or_else(|| JobStoreError::job_not_found(id))?;
                return Ok(CreateOutcome::Existing(view));
            }
        }

        if derivation.asset_job_id != job.id {
            return Err(JobStoreError::Validation(
                "derivation does not belong to the job".into(),
            ));
        }

        let job_id = job.id;
        let derivation_id = derivation.id;
        let rows: Vec<DerivationReference> = references
            .normalized()
            .iter()
            .map(|(kind, lore_id)| DerivationReference {
                derivation_id,
                kind,
                lore_id,
            })
            .collect();

        arena
            .jobs_by_hash
            .entry((job.world_id, job.input_hash.clone()))
            .or_default()
            .push(job_id);
        arena.jobs.insert(job_id, job);
        arena.derivation_by_job.insert(job_id, derivation_id);
        arena.derivations.insert(derivation_id, derivation);
        arena.references.insert(derivation_id, rows);

        let view = arena
            .view(job_id)?
            .ok_or_else(|| JobStoreError::job_not_found(job_id))?;
        Ok(CreateOutcome::Created(view))
    }

    async fn get(&self, id: AssetJobId) -> Result<Option<AssetJobView>, JobStoreError> {
        self.read()?.view(id)
    }

    async fn find_latest_by_hash(
        &self,
        world_id: WorldId,
        input_hash: &str,
    ) -> Result<Option<AssetJob>, JobStoreError> {
        Ok(self.read()?.latest_by_hash(world_id, input_hash).cloned())
    }

    async fn list(&self, filter: &JobFilter, page: Page) -> Result<JobPage, JobStoreError> {
        let arena = self.read()?;
        let mut matching: Vec<&AssetJob> =
            arena.jobs.values().filter(|j| filter.matches(j)).collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.skip)
            .take(page.limit)
            .map(|job| {
                arena
                    .view(job.id)?
                    .ok_or_else(|| JobStoreError::job_not_found(job.id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(JobPage {
            total,
            skip: page.skip,
            limit: page.limit,
            items,
        })
    }

    async fn apply_status_change(
        &self,
        id: AssetJobId,
        change: StatusChange,
    ) -> Result<AssetJobView, JobStoreError> {
        let mut arena = self.write()?;
        let job = arena
            .jobs
            .get(&id)
            .ok_or_else(|| JobStoreError::job_not_found(id))?;

        let mut updated = job.clone();
        updated.apply_status_change(change)?;
        arena.jobs.insert(id, updated);

        arena
            .view(id)?
            .ok_or_else(|| JobStoreError::job_not_found(id))
    }

    async fn complete(
        &self,
        id: AssetJobId,
        spec: AssetCreateSpec,
        now: DateTime<Utc>,
    ) -> Result<AssetJobView, JobStoreError> {
        let mut arena = self.write()?;
        let job = arena
            .jobs
            .get(&id)
            .ok_or_else(|| JobStoreError::job_not_found(id))?;
        let derivation = arena.derivation_for(id)?;
        let linked = derivation.asset_id.and_then(|a| arena.assets.get(&a));

        let updated = match plan_complete(job, linked, &spec, now)? {
            CompletePlan::Replay => {
                return arena
                    .view(id)?
                    .ok_or_else(|| JobStoreError::job_not_found(id));
            }
            CompletePlan::Apply(updated) => updated,
        };

        if arena.asset_by_storage_key.contains_key(&spec.storage_key) {
            return Err(JobStoreError::Conflict(format!(
                "storage_key {} already belongs to another asset",
                spec.storage_key
            )));
        }

        let derivation_id = derivation.id;
        let asset = spec.into_asset(now);
        let asset_id = asset.id;

        let mut derivation = derivation.clone();
        derivation.link_asset(asset_id)?;

        arena
            .asset_by_storage_key
            .insert(asset.storage_key.clone(), asset_id);
        arena.assets.insert(asset_id, asset);
        arena.derivations.insert(derivation_id, derivation);
        arena.jobs.insert(id, updated);

        arena
            .view(id)?
            .ok_or_else(|| JobStoreError::job_not_found(id))
    }

    async fn get_asset(&self, id: AssetId) -> Result<Option<AssetView>, JobStoreError> {
        let arena = self.read()?;
        let Some(asset) = arena.assets.get(&id) else {
            return Ok(None);
        };

        let provenance = arena
            .derivations
            .values()
            .find(|d| d.asset_id == Some(id))
            .and_then(|derivation| {
                let job = arena.jobs.get(&derivation.asset_job_id)?;
                Some(AssetProvenance {
                    asset_job_id: job.id,
                    job_status: job.status,
                    requested_by: job.requested_by.clone(),
                    derivation: arena.derivation_view(derivation),
                })
            });

        Ok(Some(AssetView {
            asset: asset.clone(),
            provenance,
        }))
    }

    async fn list_assets(
        &self,
        filter: &AssetFilter,
        page: Page,
    ) -> Result<AssetPage, JobStoreError> {
        let arena = self.read()?;
        let mut matching: Vec<&Asset> = arena
            .assets
            .values()
            .filter(|a| filter.matches_asset(a))
            .filter(|a| {
                !filter.has_lore_filter()
                    || arena
                        .derivations
                        .values()
                        .find(|d| d.asset_id == Some(a.id))
                        .is_some_and(|d| {
                            filter.matches_references(&arena.derivation_view(d).references())
                        })
            })
            .collect();
        matching.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        Ok(AssetPage {
            total: matching.len() as u64,
            skip: page.skip,
            limit: page.limit,
            items: matching
                .into_iter()
                .skip(page.skip)
                .take(page.limit)
                .cloned()
                .collect(),
        })
    }

    async fn list_stale_queued(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AssetJobView>, JobStoreError> {
        let arena = self.read()?;
        let mut stale: Vec<&AssetJob> = arena
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.created_at <= created_before)
            .collect();
        stale.sort_by_key(|j| (j.created_at, j.id));

        stale
            .into_iter()
            .take(limit)
            .map(|job| {
                arena
                    .view(job.id)?
                    .ok_or_else(|| JobStoreError::job_not_found(job.id))
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lorekeeper_core::{
        AssetType, ClaimId, EntityId, HashInput, LoreSnapshot, compute_input_hash,
    };
    use serde_json::json;

    /// Lore ids derived from the world id, so the same world and prompt
    /// always hash the same.
    pub(crate) fn world_references(world_id: WorldId) -> LoreReferences {
        let base = world_id.as_uuid().as_u128();
        let id = |n: u128| uuid::Uuid::from_u128(base ^ n);
        LoreReferences {
            claim_ids: vec![ClaimId::from_uuid(id(1))],
            entity_ids: vec![EntityId::from_uuid(id(2)), EntityId::from_uuid(id(3))],
            ..Default::default()
        }
        .normalized()
    }

    pub(crate) fn new_job(world_id: WorldId, prompt: serde_json::Value) -> NewAssetJob {
        let references = world_references(world_id);
        let input_hash = compute_input_hash(&HashInput {
            world_id,
            asset_type: AssetType::Image,
            provider: "dalle",
            model_id: None,
            prompt_spec: &prompt,
            references: &references,
            snapshot: None,
        });
        let now = Utc::now();
        let job = AssetJob::queued(
            world_id,
            AssetType::Image,
            "dalle",
            None,
            None,
            "user-1",
            input_hash.clone(),
            prompt.clone(),
            now,
        );
        let derivation = AssetDerivation {
            id: DerivationId::new(),
            asset_job_id: job.id,
            asset_id: None,
            source_id: None,
            prompt_spec: prompt,
            input_hash,
            lore_snapshot: LoreSnapshot::of(&references).to_json(),
            created_at: now,
        };
        NewAssetJob {
            job,
            derivation,
            references,
        }
    }

    pub(crate) fn asset_spec(world_id: WorldId, key: &str) -> AssetCreateSpec {
        AssetCreateSpec {
            world_id,
            asset_type: AssetType::Image,
            format: "png".into(),
            storage_key: key.into(),
            content_type: "image/png".into(),
            duration_seconds: None,
            size_bytes: Some(2048),
            checksum: None,
            metadata: None,
            created_by: "worker-1".into(),
        }
    }

    async fn running(store: &InMemoryJobStore, id: AssetJobId) {
        store
            .apply_status_change(id, StatusChange::to(JobStatus::Running, Utc::now()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_is_idempotent_per_hash() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();

        let first = store
            .create_or_get(new_job(world, json!({"d": "castle"})))
            .await
            .unwrap();
        assert!(first.is_created());

        let second = store
            .create_or_get(new_job(world, json!({"d": "castle"})))
            .await
            .unwrap();
        assert!(!second.is_created());
        assert_eq!(second.view().job.id, first.view().job.id);
        assert_eq!(second.view().job.input_hash, first.view().job.input_hash);
        assert_eq!(store.job_count(), 1);
    }

    #[test]
    fn helper_jobs_hash_by_world_and_prompt() {
        let world = WorldId::new();
        let a = new_job(world, json!({"d": "castle"}));
        let b = new_job(world, json!({"d": "castle"}));
        assert_eq!(a.job.input_hash, b.job.input_hash);
        assert_eq!(a.references, b.references);
        assert_ne!(a.job.id, b.job.id);

        let other_prompt = new_job(world, json!({"d": "keep"}));
        assert_ne!(other_prompt.job.input_hash, a.job.input_hash);
        let other_world = new_job(WorldId::new(), json!({"d": "castle"}));
        assert_ne!(other_world.job.input_hash, a.job.input_hash);
    }

    #[tokio::test]
    async fn failed_job_does_not_short_circuit() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let first = store
            .create_or_get(new_job(world, json!({"d": "castle"})))
            .await
            .unwrap()
            .into_view();

        running(&store, first.job.id).await;
        let mut fail = StatusChange::to(JobStatus::Failed, Utc::now());
        fail.error_code = Some("PROVIDER_ERROR".into());
        store.apply_status_change(first.job.id, fail).await.unwrap();

        let retry = store
            .create_or_get(new_job(world, json!({"d": "castle"})))
            .await
            .unwrap();
        assert!(retry.is_created());
        assert_ne!(retry.view().job.id, first.job.id);

        let latest = store
            .find_latest_by_hash(world, &first.job.input_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, retry.view().job.id);
    }

    #[tokio::test]
    async fn view_joins_reference_rows() {
        let store = InMemoryJobStore::new();
        let new = new_job(WorldId::new(), json!({"d": "x"}));
        let refs = new.references.clone();
        let view = store.create_or_get(new).await.unwrap().into_view();
        assert_eq!(view.derivation.references(), refs);
        assert!(view.asset.is_none());
        assert_eq!(view.job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn rejected_transition_leaves_job_unchanged() {
        let store = InMemoryJobStore::new();
        let view = store
            .create_or_get(new_job(WorldId::new(), json!({"d": "x"})))
            .await
            .unwrap()
            .into_view();

        let err = store
            .apply_status_change(
                view.job.id,
                StatusChange::to(JobStatus::Failed, Utc::now()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));

        let after = store.get(view.job.id).await.unwrap().unwrap();
        assert_eq!(after.job, view.job);
    }

    #[tokio::test]
    async fn complete_twice_creates_one_asset() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let view = store
            .create_or_get(new_job(world, json!({"d": "x"})))
            .await
            .unwrap()
            .into_view();
        running(&store, view.job.id).await;

        let first = store
            .complete(view.job.id, asset_spec(world, "k/a.png"), Utc::now())
            .await
            .unwrap();
        let second = store
            .complete(view.job.id, asset_spec(world, "k/a.png"), Utc::now())
            .await
            .unwrap();

        let first_asset = first.asset.unwrap();
        assert_eq!(second.asset.unwrap().id, first_asset.id);
        assert_eq!(second.derivation.derivation.asset_id, Some(first_asset.id));
        assert_eq!(second.job.status, JobStatus::Succeeded);
        assert_eq!(second.job.finished_at, first.job.finished_at);
        assert_eq!(store.asset_count(), 1);
    }

    #[tokio::test]
    async fn complete_with_different_key_after_success_is_rejected() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let view = store
            .create_or_get(new_job(world, json!({"d": "x"})))
            .await
            .unwrap()
            .into_view();
        store
            .complete(view.job.id, asset_spec(world, "k/a.png"), Utc::now())
            .await
            .unwrap();

        let err = store
            .complete(view.job.id, asset_spec(world, "k/b.png"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            JobStoreError::InvalidTransition {
                current: JobStatus::Succeeded,
                attempted: JobStatus::Succeeded,
                ..
            }
        ));
        assert_eq!(store.asset_count(), 1);
    }

    #[tokio::test]
    async fn storage_key_is_unique_across_jobs() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let a = store
            .create_or_get(new_job(world, json!({"d": "a"})))
            .await
            .unwrap()
            .into_view();
        let b = store
            .create_or_get(new_job(world, json!({"d": "b"})))
            .await
            .unwrap()
            .into_view();

        store
            .complete(a.job.id, asset_spec(world, "shared.png"), Utc::now())
            .await
            .unwrap();
        let err = store
            .complete(b.job.id, asset_spec(world, "shared.png"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));

        let b_after = store.get(b.job.id).await.unwrap().unwrap();
        assert_eq!(b_after.job.status, JobStatus::Queued);
        assert!(b_after.derivation.derivation.asset_id.is_none());
    }

    #[tokio::test]
    async fn complete_on_cancelled_job_is_rejected() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let view = store
            .create_or_get(new_job(world, json!({"d": "x"})))
            .await
            .unwrap()
            .into_view();
        store
            .apply_status_change(view.job.id, StatusChange::to(JobStatus::Cancelled, Utc::now()))
            .await
            .unwrap();

        let err = store
            .complete(view.job.id, asset_spec(world, "k.png"), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));
        assert_eq!(store.asset_count(), 0);
    }

    #[tokio::test]
    async fn asset_read_path_carries_provenance() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let new = new_job(world, json!({"d": "x"}));
        let refs = new.references.clone();
        let view = store.create_or_get(new).await.unwrap().into_view();
        let done = store
            .complete(view.job.id, asset_spec(world, "k.png"), Utc::now())
            .await
            .unwrap();

        let asset_id = done.asset.unwrap().id;
        let asset = store.get_asset(asset_id).await.unwrap().unwrap();
        let provenance = asset.provenance.unwrap();
        assert_eq!(provenance.asset_job_id, view.job.id);
        assert_eq!(provenance.derivation.references(), refs);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_identical_creates_yield_one_job() {
        let store = InMemoryJobStore::arc();
        let world = WorldId::new();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            tasks.spawn(async move { store.create_or_get(new_job(world, json!({"d": "x"}))).await });
        }
        let mut created = 0;
        let mut ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.unwrap().unwrap();
            created += usize::from(outcome.is_created());
            ids.push(outcome.view().job.id);
        }

        assert_eq!(created, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_completes_with_one_key_create_one_asset() {
        let store = InMemoryJobStore::arc();
        let world = WorldId::new();
        let view = store
            .create_or_get(new_job(world, json!({"d": "x"})))
            .await
            .unwrap()
            .into_view();
        running(&store, view.job.id).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = view.job.id;
            tasks.spawn(async move {
                store
                    .complete(id, asset_spec(world, "k/race.png"), Utc::now())
                    .await
            });
        }
        let mut asset_ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let done = joined.unwrap().unwrap();
            assert_eq!(done.job.status, JobStatus::Succeeded);
            asset_ids.push(done.asset.unwrap().id);
        }

        asset_ids.dedup();
        assert_eq!(asset_ids.len(), 1);
        assert_eq!(store.asset_count(), 1);
    }

    #[tokio::test]
    async fn list_assets_filters_by_row_and_lore() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let other = WorldId::new();
        for (w, prompt, key) in [
            (world, "a", "w/a.png"),
            (world, "b", "w/b.png"),
            (other, "c", "o/c.png"),
        ] {
            let view = store
                .create_or_get(new_job(w, json!({"d": prompt})))
                .await
                .unwrap()
                .into_view();
            store
                .complete(view.job.id, asset_spec(w, key), Utc::now())
                .await
                .unwrap();
        }

        let all = store
            .list_assets(&AssetFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(all.total, 3);
        assert!(
            all.items
                .windows(2)
                .all(|w| (w[0].created_at, w[0].id) >= (w[1].created_at, w[1].id))
        );

        let filter = AssetFilter {
            world_id: Some(world),
            ..Default::default()
        };
        let page = store
            .list_assets(&filter, Page { skip: 1, limit: 1 })
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].world_id, world);

        let entity = world_references(other).entity_ids[0];
        let filter = AssetFilter {
            entity_id: Some(entity),
            ..Default::default()
        };
        let page = store.list_assets(&filter, Page::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].storage_key, "o/c.png");

        let filter = AssetFilter {
            created_by: Some("someone-else".into()),
            ..Default::default()
        };
        assert_eq!(
            store.list_assets(&filter, Page::default()).await.unwrap().total,
            0
        );
    }

    #[tokio::test]
    async fn list_filters_and_pages_newest_first() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mut new = new_job(world, json!({"d": i}));
            new.job.created_at = Utc::now() + chrono::Duration::seconds(i);
            ids.push(new.job.id);
            store.create_or_get(new).await.unwrap();
        }
        store
            .create_or_get(new_job(WorldId::new(), json!({"d": "other"})))
            .await
            .unwrap();

        let filter = JobFilter {
            world_id: Some(world),
            ..Default::default()
        };
        let page = store.list(&filter, Page { skip: 1, limit: 2 }).await.unwrap();
        assert_eq!(page.total, 5);
        let got: Vec<_> = page.items.iter().map(|v| v.job.id).collect();
        assert_eq!(got, vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn stale_queued_jobs_are_listed_oldest_first() {
        let store = InMemoryJobStore::new();
        let world = WorldId::new();
        let mut old = new_job(world, json!({"d": "old"}));
        old.job.created_at = Utc::now() - chrono::Duration::minutes(30);
        let old_id = old.job.id;
        store.create_or_get(old).await.unwrap();
        store
            .create_or_get(new_job(world, json!({"d": "fresh"})))
            .await
            .unwrap();

        let stale = store
            .list_stale_queued(Utc::now() - chrono::Duration::minutes(5), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].job.id, old_id);
    }
}
