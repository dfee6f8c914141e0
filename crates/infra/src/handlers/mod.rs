//! Job handlers registered with the consumer.

pub mod asset_generation;

pub use asset_generation::{
    AssetGenerationHandler, GeneratedAsset, GenerationProvider, MockGenerationProvider,
    ProviderError,
};
