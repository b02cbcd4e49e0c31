//! Deduplication by canonical URL and top-K selection with adaptive fallback.

use std::collections::HashMap;

use tracing::{debug, info, instrument};
use url::Url;

use corpus_shared::{Candidate, RawHit};

/// Query parameters that only carry attribution.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "yclid", "mc_cid", "mc_eid", "igshid", "ref",
    "ref_src", "_ga", "_gl", "spm", "si",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

/// Normalize a URL into the deduplication key.
///
/// Lowercases scheme and host, drops default ports and fragments, strips
/// tracking parameters, sorts what remains, and removes a trailing slash
/// from non-root paths. Returns `None` for unparseable or non-HTTP URLs.
pub fn canonicalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// Result of merging and selecting candidates.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    /// Selected candidates in rank order.
    pub selected: Vec<Candidate>,
    /// Unique candidates after merging.
    pub merged_total: usize,
    /// Merged candidates that were not selected.
    pub rejected: usize,
    /// Merged candidates scoring below the initial threshold.
    pub below_threshold: usize,
    /// Selected candidates that scored below the initial threshold.
    pub fallback_pulled: usize,
    /// Threshold in force when selection stopped.
    pub final_threshold: f64,
    /// Hits dropped because their URL could not be canonicalized.
    pub invalid_urls: usize,
}

/// Merge raw hits into unique candidates keyed by canonical URL.
///
/// The highest score wins, along with that hit's title, snippet and
/// primary query variant. Variants and providers are unioned in discovery
/// order. Output keeps first-discovery order.
pub fn merge_hits(hits: &[RawHit]) -> (Vec<Candidate>, usize) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut merged: Vec<Candidate> = Vec::new();
    let mut invalid = 0;

    for (order, hit) in hits.iter().enumerate() {
        let Some(key) = canonicalize_url(&hit.source_url) else {
            debug!(url = %hit.source_url, "dropping hit with invalid URL");
            invalid += 1;
            continue;
        };

        match index.get(&key) {
            Some(&i) => {
                let c = &mut merged[i];
                if !c.query_variants.contains(&hit.query_variant) {
                    c.query_variants.push(hit.query_variant.clone());
                }
                if !c.providers.contains(&hit.provider) {
                    c.providers.push(hit.provider.clone());
                }
                for (k, v) in &hit.metadata {
                    c.metadata.entry(k.clone()).or_insert_with(|| v.clone());
                }
                if hit.relevance_score > c.relevance_score {
                    c.relevance_score = hit.relevance_score;
                    c.query_variant = hit.query_variant.clone();
                    c.source_url = hit.source_url.clone();
                    if !hit.title.is_empty() {
                        c.title = hit.title.clone();
                    }
                    if !hit.snippet.is_empty() {
                        c.snippet = hit.snippet.clone();
                    }
                }
            }
            None => {
                index.insert(key.clone(), merged.len());
                merged.push(Candidate::from_hit(key, hit, order));
            }
        }
    }

    (merged, invalid)
}

/// Pick the top `target` candidates, relaxing `threshold` by `step` until
/// enough clear the bar or it reaches zero.
#[instrument(skip_all, fields(hits = hits.len(), k = target, threshold = threshold))]
pub fn select(hits: &[RawHit], target: usize, threshold: f64, step: f64) -> SelectionOutcome {
    let (mut merged, invalid_urls) = merge_hits(hits);
    let merged_total = merged.len();

    // Stable: equal scores keep discovery order.
    merged.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));

    let above = |t: f64| merged.iter().take_while(|c| c.relevance_score >= t).count();
    let below_threshold = merged_total - above(threshold);

    let mut current = threshold;
    let step = if step > 0.0 { step } else { 1.0 };
    while above(current) < target && current > 0.0 {
        current = (((current - step) * 1e6).round() / 1e6).max(0.0);
        debug!(threshold = current, available = above(current), "relaxing relevance threshold");
    }

    let take = above(current).min(target);
    let mut selected: Vec<Candidate> = merged.into_iter().take(take).collect();
    let mut fallback_pulled = 0;
    for (rank, c) in selected.iter_mut().enumerate() {
        c.rank = rank;
        if c.relevance_score < threshold {
            c.selected_by_fallback = true;
            fallback_pulled += 1;
        }
    }

    info!(
        merged = merged_total,
        selected = selected.len(),
        fallback_pulled,
        final_threshold = current,
        "candidate selection complete"
    );

    SelectionOutcome {
        rejected: merged_total - selected.len(),
        selected,
        merged_total,
        below_threshold,
        fallback_pulled,
        final_threshold: current,
        invalid_urls,
    }
}
