//! `lorekeeper-core`: domain foundation for the asset pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! typed ids, the job status state machine, asset and provenance records, and
//! the canonical input hasher.

pub mod asset;
pub mod derivation;
pub mod error;
pub mod hashing;
pub mod id;
pub mod job;
pub mod lore;

pub use asset::{Asset, AssetCreateSpec, AssetStatus, AssetType};
pub use derivation::{AssetDerivation, DerivationReference};
pub use error::{DomainError, DomainResult};
pub use hashing::{HashInput, compute_input_hash};
pub use id::{
    AssetId, AssetJobId, ClaimId, DerivationId, EntityId, SourceChunkId, SourceId, WorldId,
};
pub use job::{AssetJob, JobStatus, StatusChange, validate_transition};
pub use lore::{LoreKind, LoreReferences, LoreSnapshot};
