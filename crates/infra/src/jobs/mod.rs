//! Persistence for asset jobs, derivations and assets.
//!
//! ## Components
//!
//! - `JobStore`: atomic create-or-get, status transitions and completion
//! - `InMemoryJobStore`: single-lock arena used by tests and dev mode
//! - `PostgresJobStore`: row-locking implementation for production

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    AssetFilter, AssetJobView, AssetPage, AssetProvenance, AssetView, CreateOutcome,
    DerivationView, JobFilter, JobPage, NewAssetJob, Page,
};
