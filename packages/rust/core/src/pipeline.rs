//! End-to-end research pipeline: query → expand → search → select →
//! acquire → filter → clean → result.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{info, instrument, warn};

use corpus_crawler::{AcquisitionGate, DomainFailureCache, GateConfig};
use corpus_discovery::{QueryExpander, SearchProvider, dispatch, select};
use corpus_llm::ModelBackend;
use corpus_shared::{CorpusError, PipelineConfig, PipelineResult, Result, RunId, StageStats};

use crate::aggregate::{RunSummary, aggregate};
use crate::cleaner::BatchedCleaner;
use crate::quality::GarbageFilter;

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a phase finishes, with a one-line summary.
    fn phase_done(&self, name: &str, summary: &str);
    /// Called when the pipeline completes.
    fn done(&self, result: &PipelineResult);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn phase_done(&self, _name: &str, _summary: &str) {}
    fn done(&self, _result: &PipelineResult) {}
}

/// External collaborators of a run.
#[derive(Clone, Default)]
pub struct PipelineDeps {
    /// Model used for expansion and cleaning. `None` runs the heuristic
    /// expander and leaves every candidate uncleaned.
    pub model: Option<Arc<dyn ModelBackend>>,
    pub providers: Vec<Arc<dyn SearchProvider>>,
    /// Errors raised while building providers, reported with the run.
    pub provider_setup_errors: Vec<String>,
    /// Shared across runs by long-lived callers; a fresh cache otherwise.
    pub domain_cache: Option<DomainFailureCache>,
}

/// Run the research pipeline for `query`.
///
/// Fails only on an invalid configuration or an empty query. Every other
/// problem (provider outages, fetch failures, model errors, the run
/// deadline) degrades the result and is listed in its `errors`.
#[instrument(skip_all, fields(query = %query))]
pub async fn run(
    query: &str,
    config: &PipelineConfig,
    deps: &PipelineDeps,
    progress: &dyn ProgressReporter,
) -> Result<PipelineResult> {
    config.validate()?;
    if query.trim().is_empty() {
        return Err(CorpusError::validation("query must not be empty"));
    }

    let start = Instant::now();
    let run_id = RunId::new();
    let started_at = Utc::now();
    let deadline = config.run_deadline.map(|d| start + d);
    info!(%run_id, "starting research pipeline");

    let mut stats = StageStats::default();
    let mut run_errors: Vec<String> = deps
        .provider_setup_errors
        .iter()
        .map(|e| format!("search: {e}"))
        .collect();

    // --- Expansion ---
    progress.phase("Expanding query");
    let expansion = QueryExpander::new(deps.model.clone(), config)
        .expand(query)
        .await;
    let mut usage = expansion.usage;
    let expansion_set = expansion.set;
    progress.phase_done(
        "Expanding query",
        &format!(
            "{} sub-queries ({:?})",
            expansion_set.sub_queries.len(),
            expansion_set.method
        ),
    );

    // --- Search ---
    progress.phase("Searching");
    if deps.providers.is_empty() {
        run_errors.push("search: no search providers configured".to_string());
    }
    let dispatched = dispatch(
        &expansion_set,
        &deps.providers,
        config.results_per_provider,
        config.per_call_timeout,
        config.max_concurrency_global,
    )
    .await;
    run_errors.extend(dispatched.errors.iter().map(|e| format!("search: {e}")));
    stats.raw_hits = dispatched.hits.len();
    progress.phase_done(
        "Searching",
        &format!(
            "{} hits from {} providers",
            dispatched.hits.len(),
            dispatched.providers_used.len()
        ),
    );

    // --- Selection ---
    progress.phase("Selecting candidates");
    let selection = select(
        &dispatched.hits,
        config.target_candidate_count,
        config.relevance_threshold,
        config.relevance_relaxation_step,
    );
    stats.rejected_below_threshold = selection.below_threshold;
    stats.fallback_pulled = selection.fallback_pulled;
    stats.final_threshold = selection.final_threshold;
    progress.phase_done(
        "Selecting candidates",
        &format!(
            "{} of {} unique URLs, {} via fallback",
            selection.selected.len(),
            selection.merged_total,
            selection.fallback_pulled
        ),
    );

    // --- Acquisition ---
    progress.phase("Acquiring documents");
    let cache = deps.domain_cache.clone().unwrap_or_else(|| {
        DomainFailureCache::new(config.domain_failure_threshold, config.domain_backoff)
    });
    let gate = AcquisitionGate::new(GateConfig::from(config), cache)?;
    let (mut candidates, acquisition) = gate.acquire_all(selection.selected, deadline).await;
    progress.phase_done(
        "Acquiring documents",
        &format!(
            "{} fetched, {} failed, {} chunked",
            acquisition.succeeded, acquisition.failed, acquisition.chunked
        ),
    );

    // --- Quality filter ---
    progress.phase("Filtering");
    let filter = GarbageFilter::new(config).filter_all(&mut candidates);
    stats.pdf_exempted = filter.pdf_exempted;
    progress.phase_done(
        "Filtering",
        &format!("{} filtered, {} PDFs exempt", filter.filtered, filter.pdf_exempted),
    );

    // --- Cleaning ---
    if deadline.is_some_and(|d| Instant::now() >= d) {
        let skipped = candidates.iter().filter(|c| c.eligible_for_cleaning()).count();
        warn!(skipped, "run deadline reached, skipping cleaning");
        run_errors.push(format!(
            "run deadline reached before cleaning; {skipped} candidates left uncleaned"
        ));
    } else {
        progress.phase("Cleaning");
        let cleaning = BatchedCleaner::new(deps.model.clone(), config)
            .clean_all(&mut candidates, &expansion_set.original_query)
            .await;
        usage.merge(cleaning.usage);
        progress.phase_done(
            "Cleaning",
            &format!(
                "{} cleaned, {} failed in {} batches",
                cleaning.cleaned, cleaning.failed, cleaning.batches
            ),
        );
    }

    stats.model_calls = usage.calls;
    stats.tokens_in = usage.tokens_in;
    stats.tokens_out = usage.tokens_out;

    let result = aggregate(
        RunSummary {
            run_id,
            started_at,
            expansion_set,
            providers_used: dispatched.providers_used,
            run_errors,
            total_candidates_discovered: selection.merged_total,
            filter_notes: filter.notes,
            stats,
            processing_time: start.elapsed(),
        },
        candidates,
    );

    progress.done(&result);

    info!(
        run_id = %result.run_id,
        cleaned = result.total_cleaned,
        selected = result.total_selected_for_acquisition,
        partial_failure = result.partial_failure,
        elapsed_ms = result.processing_time.as_millis() as u64,
        "research pipeline complete"
    );

    Ok(result)
}
