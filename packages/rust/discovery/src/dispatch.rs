//! Concurrent fan-out of sub-queries across search providers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use corpus_shared::{ExpansionSet, ProviderError, RawHit};

use crate::providers::SearchProvider;

/// Everything the dispatcher learned from one fan-out.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Flat hit list, duplicates included, ordered by (sub-query, provider).
    pub hits: Vec<RawHit>,
    /// One entry per failed (provider, sub-query) call.
    pub errors: Vec<ProviderError>,
    /// Providers with at least one successful call, in configured order.
    pub providers_used: Vec<String>,
    /// Hits discarded by a provider's floor score.
    pub below_floor: usize,
}

/// Run every (provider, sub-query) pair on its own task, at most
/// `max_concurrency` at a time.
///
/// Each call gets its own `timeout`, counted from when it starts; a failing
/// call contributes zero hits and never cancels its siblings.
#[instrument(skip_all, fields(providers = providers.len(), sub_queries = expansion.sub_queries.len()))]
pub async fn dispatch(
    expansion: &ExpansionSet,
    providers: &[Arc<dyn SearchProvider>],
    max_results: usize,
    timeout: Duration,
    max_concurrency: usize,
) -> DispatchOutcome {
    let start = Instant::now();
    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));

    let mut handles = Vec::with_capacity(expansion.sub_queries.len() * providers.len());
    for sub_query in &expansion.sub_queries {
        for (idx, provider) in providers.iter().enumerate() {
            let task = tokio::spawn(search_one(
                Arc::clone(provider),
                sub_query.clone(),
                max_results,
                timeout,
                Arc::clone(&permits),
            ));
            handles.push((idx, Arc::clone(provider), task));
        }
    }

    let mut results = Vec::with_capacity(handles.len());
    for (idx, provider, task) in handles {
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(ProviderError::Request {
                provider: provider.name().to_string(),
                message: format!("search task failed: {e}"),
            }),
        };
        results.push((idx, provider, result));
    }

    let mut outcome = DispatchOutcome::default();
    let mut succeeded = vec![false; providers.len()];

    for (idx, provider, result) in results {
        match result {
            Ok(hits) => {
                succeeded[idx] = true;
                let floor = provider.min_score();
                for hit in hits {
                    if hit.relevance_score < floor {
                        outcome.below_floor += 1;
                    } else {
                        outcome.hits.push(hit);
                    }
                }
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "search call failed");
                outcome.errors.push(e);
            }
        }
    }

    outcome.providers_used = providers
        .iter()
        .zip(succeeded)
        .filter(|(_, ok)| *ok)
        .map(|(p, _)| p.name().to_string())
        .collect();

    info!(
        hits = outcome.hits.len(),
        below_floor = outcome.below_floor,
        errors = outcome.errors.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "search dispatch complete"
    );

    outcome
}

async fn search_one(
    provider: Arc<dyn SearchProvider>,
    sub_query: String,
    max_results: usize,
    timeout: Duration,
    permits: Arc<Semaphore>,
) -> Result<Vec<RawHit>, ProviderError> {
    let _permit = permits
        .acquire_owned()
        .await
        .map_err(|_| ProviderError::Request {
            provider: provider.name().to_string(),
            message: "search semaphore closed".into(),
        })?;
    match tokio::time::timeout(timeout, provider.search(&sub_query, max_results)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout {
            provider: provider.name().to_string(),
            elapsed: timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corpus_shared::ExpansionMethod;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns `scores.len()` hits per sub-query, or an error.
    struct FakeProvider {
        name: &'static str,
        floor: f64,
        scores: Vec<f64>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl SearchProvider for FakeProvider {
        fn name(&self) -> &str {
            self.name
        }

        fn min_score(&self) -> f64 {
            self.floor
        }

        async fn search(&self, sub_query: &str, _max: usize) -> Result<Vec<RawHit>, ProviderError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(ProviderError::Http {
                    provider: self.name.into(),
                    status: 500,
                });
            }
            Ok(self
                .scores
                .iter()
                .enumerate()
                .map(|(i, s)| RawHit {
                    source_url: format!("https://{}.example/{}/{i}", self.name, sub_query.len()),
                    title: String::new(),
                    snippet: String::new(),
                    relevance_score: *s,
                    query_variant: sub_query.to_string(),
                    provider: self.name.into(),
                    metadata: BTreeMap::new(),
                })
                .collect())
        }
    }

    /// Records how many searches run at once.
    #[derive(Default)]
    struct CountingProvider {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SearchProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, sub_query: &str, _max: usize) -> Result<Vec<RawHit>, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![RawHit {
                source_url: format!("https://counting.example/{sub_query}"),
                title: String::new(),
                snippet: String::new(),
                relevance_score: 0.5,
                query_variant: sub_query.to_string(),
                provider: "counting".into(),
                metadata: BTreeMap::new(),
            }])
        }
    }

    fn expansion() -> ExpansionSet {
        ExpansionSet {
            original_query: "q".into(),
            sub_queries: vec!["alpha".into(), "beta query".into()],
            method: ExpansionMethod::Heuristic,
            fallback_reason: None,
        }
    }

    fn provider(name: &'static str, floor: f64, fail: bool, delay_ms: u64) -> Arc<dyn SearchProvider> {
        Arc::new(FakeProvider {
            name,
            floor,
            scores: vec![0.9, 0.4, 0.1],
            fail,
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[tokio::test]
    async fn floor_filters_and_tags_provenance() {
        let providers = vec![provider("one", 0.3, false, 0), provider("two", 0.0, false, 0)];
        let outcome = dispatch(&expansion(), &providers, 10, Duration::from_secs(1), 8).await;

        // one: 2 kept per sub-query; two: 3 kept per sub-query
        assert_eq!(outcome.hits.len(), 10);
        assert_eq!(outcome.below_floor, 2);
        assert_eq!(outcome.providers_used, vec!["one", "two"]);
        assert_eq!(outcome.hits[0].query_variant, "alpha");
        assert_eq!(outcome.hits.last().map(|h| h.query_variant.as_str()), Some("beta query"));
    }

    #[tokio::test]
    async fn failing_provider_is_isolated() {
        let providers = vec![provider("bad", 0.0, true, 0), provider("good", 0.0, false, 0)];
        let outcome = dispatch(&expansion(), &providers, 10, Duration::from_secs(1), 8).await;

        assert_eq!(outcome.errors.len(), 2);
        assert_eq!(outcome.hits.len(), 6);
        assert_eq!(outcome.providers_used, vec!["good"]);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let providers = vec![provider("slow", 0.0, false, 500), provider("fast", 0.0, false, 0)];
        let outcome = dispatch(&expansion(), &providers, 10, Duration::from_millis(50), 8).await;

        assert_eq!(outcome.hits.len(), 6);
        assert!(
            outcome
                .errors
                .iter()
                .all(|e| matches!(e, ProviderError::Timeout { provider, .. } if provider == "slow"))
        );
    }

    #[tokio::test]
    async fn concurrent_searches_stay_within_the_limit() {
        let counting = Arc::new(CountingProvider::default());
        let providers: Vec<Arc<dyn SearchProvider>> =
            vec![counting.clone(), counting.clone(), counting.clone()];
        let expansion = ExpansionSet {
            sub_queries: (0..4).map(|i| format!("angle-{i}")).collect(),
            ..expansion()
        };

        let outcome = dispatch(&expansion, &providers, 10, Duration::from_secs(1), 2).await;

        assert_eq!(counting.calls.load(Ordering::SeqCst), 12);
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(outcome.hits.len(), 12);
        // Hit order follows (sub-query, provider), not completion order.
        assert_eq!(outcome.hits[0].query_variant, "angle-0");
        assert_eq!(outcome.hits[11].query_variant, "angle-3");
    }
}
