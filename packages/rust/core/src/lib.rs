//! Research pipeline orchestration and the post-acquisition stages.
//!
//! This crate ties together discovery, acquisition, quality filtering and
//! model cleaning into one run ([`pipeline::run`]).

pub mod aggregate;
pub mod cleaner;
pub mod pipeline;
pub mod quality;

pub use aggregate::{RunSummary, aggregate};
pub use cleaner::{BatchedCleaner, CleaningReport, ModelCleaningResult, parse_cleaning_response};
pub use pipeline::{PipelineDeps, ProgressReporter, SilentProgress, run};
pub use quality::{FilterReport, GarbageFilter, QualityAssessment, QualitySignals, Signal};
