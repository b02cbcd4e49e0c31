//! Final assembly of the pipeline result.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::info;

use corpus_shared::{Candidate, ExpansionSet, PipelineResult, RunId, StageStats};

/// Everything the aggregator needs besides the candidates.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub expansion_set: ExpansionSet,
    pub providers_used: Vec<String>,
    /// Run-level errors (provider failures, skipped stages).
    pub run_errors: Vec<String>,
    pub total_candidates_discovered: usize,
    pub filter_notes: Vec<String>,
    pub stats: StageStats,
    pub processing_time: Duration,
}

/// Collect every candidate, filtered and failed ones included, into the
/// final result.
///
/// `errors` lists run-level errors first, then one entry per acquisition
/// failure and per cleaning failure. Filter reasons stay in `filter_notes`.
/// `partial_failure` is set whenever `errors` is non-empty; a run with no
/// cleaned candidate always reports it, with an explanatory error.
pub fn aggregate(summary: RunSummary, mut candidates: Vec<Candidate>) -> PipelineResult {
    candidates.sort_by_key(|c| c.rank);

    let mut errors = summary.run_errors;
    for c in &candidates {
        if let Some(e) = &c.fetch_error {
            errors.push(format!("acquisition: {}: {e}", c.source_url));
        }
    }
    for c in &candidates {
        if let Some(e) = &c.cleaning_error {
            errors.push(format!("cleaning: {}: {e}", c.source_url));
        }
    }

    let total_cleaned = candidates
        .iter()
        .filter(|c| c.cleaned_content.is_some())
        .count();

    let mut stats = summary.stats;
    stats.fetch_failed = candidates.iter().filter(|c| !c.fetch_succeeded).count();
    stats.garbage_filtered = candidates.iter().filter(|c| c.garbage_filtered).count();
    stats.chunked_documents = candidates.iter().filter(|c| !c.chunks.is_empty()).count();
    stats.cleaning_failed = candidates
        .iter()
        .filter(|c| c.cleaning_error.is_some())
        .count();

    if total_cleaned == 0 {
        let fetched = candidates.len() - stats.fetch_failed;
        errors.push(format!(
            "no cleaned content produced: {} selected, {fetched} fetched, {} filtered, {} failed cleaning",
            candidates.len(),
            stats.garbage_filtered,
            stats.cleaning_failed
        ));
    }
    let partial_failure = !errors.is_empty();

    info!(
        selected = candidates.len(),
        cleaned = total_cleaned,
        errors = errors.len(),
        partial_failure,
        "pipeline result assembled"
    );

    PipelineResult {
        run_id: summary.run_id,
        started_at: summary.started_at,
        original_query: summary.expansion_set.original_query.clone(),
        expansion_set: summary.expansion_set,
        total_selected_for_acquisition: candidates.len(),
        candidates,
        providers_used: summary.providers_used,
        total_candidates_discovered: summary.total_candidates_discovered,
        total_cleaned,
        processing_time: summary.processing_time,
        partial_failure,
        errors,
        filter_notes: summary.filter_notes,
        stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corpus_shared::RawHit;
    use std::collections::BTreeMap;

    fn summary() -> RunSummary {
        RunSummary {
            run_id: RunId::new(),
            started_at: Utc::now(),
            expansion_set: ExpansionSet::unexpanded("wind"),
            providers_used: vec!["tavily".into()],
            run_errors: Vec::new(),
            total_candidates_discovered: 4,
            filter_notes: vec!["https://c.example/: quality 0.20 below threshold".into()],
            stats: StageStats::default(),
            processing_time: Duration::from_millis(1500),
        }
    }

    fn candidate(url: &str, rank: usize) -> Candidate {
        let hit = RawHit {
            source_url: url.into(),
            title: String::new(),
            snippet: String::new(),
            relevance_score: 0.5,
            query_variant: "wind".into(),
            provider: "tavily".into(),
            metadata: BTreeMap::new(),
        };
        let mut c = Candidate::from_hit(url.into(), &hit, rank);
        c.rank = rank;
        c
    }

    #[test]
    fn errors_and_counts() {
        let mut cleaned = candidate("https://a.example/", 0);
        cleaned.fetch_succeeded = true;
        cleaned.cleaned_content = Some("text".into());

        let mut failed = candidate("https://b.example/", 1);
        failed.fetch_error = Some("paywall-detected: HTTP 402".into());

        let mut filtered = candidate("https://c.example/", 2);
        filtered.fetch_succeeded = true;
        filtered.garbage_filtered = true;
        filtered.filter_reason = Some("quality 0.20 below threshold".into());

        let mut unclean = candidate("https://d.example/", 3);
        unclean.fetch_succeeded = true;
        unclean.cleaning_error = Some("empty-response: model returned no text".into());

        let result = aggregate(summary(), vec![unclean, filtered, failed, cleaned]);

        assert_eq!(
            result.candidates.iter().map(|c| c.rank).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
        assert_eq!(result.total_cleaned, 1);
        assert_eq!(result.total_selected_for_acquisition, 4);
        assert_eq!(
            result.errors,
            vec![
                "acquisition: https://b.example/: paywall-detected: HTTP 402".to_string(),
                "cleaning: https://d.example/: empty-response: model returned no text".to_string(),
            ]
        );
        // Filter reasons are informational only.
        assert_eq!(result.filter_notes.len(), 1);
        assert!(result.partial_failure);
        assert_eq!(result.stats.fetch_failed, 1);
        assert_eq!(result.stats.garbage_filtered, 1);
        assert_eq!(result.stats.cleaning_failed, 1);
        assert_eq!(result.original_query, "wind");
    }

    #[test]
    fn clean_run_is_not_partial() {
        let mut c = candidate("https://a.example/", 0);
        c.fetch_succeeded = true;
        c.cleaned_content = Some("text".into());

        let result = aggregate(summary(), vec![c]);
        assert!(!result.partial_failure);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn zero_cleaned_still_returns_result() {
        let result = aggregate(summary(), Vec::new());
        assert!(result.partial_failure);
        assert_eq!(result.total_cleaned, 0);
        assert!(result.errors[0].starts_with("no cleaned content produced"));
    }
}
