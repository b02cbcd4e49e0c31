//! Shared types, error model, and configuration for the research pipeline.
//!
//! This crate is the foundation depended on by all other workspace crates.
//! It provides:
//! - [`CorpusError`] — the unified error type, plus per-stage error taxonomies
//! - Domain types ([`Candidate`], [`RawHit`], [`ExpansionSet`], [`PipelineResult`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, MAX_SUB_QUERIES, OpenRouterConfig, PipelineConfig, PipelineSettings,
    ProviderConfig, ProvidersConfig, QualityWeights, config_dir, config_file_path, init_config,
    load_config, load_config_from, read_api_key, validate_api_key,
};
pub use error::{
    AcquisitionError, CleaningError, CorpusError, ExpansionError, ExtractionError, ProviderError,
    Result,
};
pub use types::{
    Candidate, ChunkSpan, ExpansionMethod, ExpansionSet, PipelineResult, RawHit, RunId,
    StageStats,
};
