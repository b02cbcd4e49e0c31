//! Core domain types for a research run.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for run identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

/// How the sub-queries of an [`ExpansionSet`] were produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionMethod {
    /// Produced by a language-model call.
    Model,
    /// Produced by the deterministic template fallback.
    Heuristic,
}

/// The set of sub-queries derived from one user query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpansionSet {
    pub original_query: String,
    /// Ordered, de-duplicated, never empty.
    pub sub_queries: Vec<String>,
    pub method: ExpansionMethod,
    /// Why the model path was abandoned, when it was.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl ExpansionSet {
    /// An expansion that only carries the original query.
    pub fn unexpanded(query: &str) -> Self {
        Self {
            original_query: query.to_string(),
            sub_queries: vec![query.to_string()],
            method: ExpansionMethod::Heuristic,
            fallback_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// RawHit
// ---------------------------------------------------------------------------

/// One search result, as returned by a provider and tagged with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHit {
    pub source_url: String,
    pub title: String,
    pub snippet: String,
    /// Normalized to [0, 1].
    pub relevance_score: f64,
    /// The sub-query that produced this hit.
    pub query_variant: String,
    /// Provider name (e.g. `tavily`).
    pub provider: String,
    /// Provider-specific extras (publish date, author, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// A byte range of `extracted_content` handled as one cleaning unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpan {
    /// Position in the reassembly order.
    pub index: usize,
    /// Byte offset (inclusive), always on a char boundary.
    pub start: usize,
    /// Byte offset (exclusive), always on a char boundary.
    pub end: usize,
}

/// One discovered source and its accumulated processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    // --- identity / discovery ---
    /// Canonicalized URL, unique within a run.
    pub key: String,
    /// The sub-query of the highest-scoring hit for this URL.
    pub query_variant: String,
    /// Every sub-query that surfaced this URL, in discovery order.
    pub query_variants: Vec<String>,
    /// Every provider that surfaced this URL, in discovery order.
    pub providers: Vec<String>,
    pub source_url: String,
    pub title: String,
    pub snippet: String,
    pub relevance_score: f64,
    pub discovered_at: DateTime<Utc>,
    /// Index of the first raw hit for this URL (tie-break order).
    pub discovery_order: usize,
    /// Position in the selection (0 = best).
    pub rank: usize,
    /// Pulled in below the configured threshold by the adaptive fallback.
    #[serde(default)]
    pub selected_by_fallback: bool,

    // --- acquisition ---
    #[serde(default)]
    pub fetch_succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
    #[serde(default)]
    pub is_pdf: bool,

    // --- raw capture ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
    #[serde(default)]
    pub raw_content_length: usize,

    // --- extraction ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_content: Option<String>,
    #[serde(default)]
    pub extracted_content_length: usize,
    /// Chunk boundaries when the document was too large to clean in one call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chunks: Vec<ChunkSpan>,

    // --- quality gate ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_filter_length: Option<usize>,
    #[serde(default)]
    pub garbage_filtered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,

    // --- cleaning ---
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaned_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleaning_error: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Candidate {
    /// Create a fresh candidate from the first hit seen for a canonical key.
    pub fn from_hit(key: String, hit: &RawHit, discovery_order: usize) -> Self {
        Self {
            key,
            query_variant: hit.query_variant.clone(),
            query_variants: vec![hit.query_variant.clone()],
            providers: vec![hit.provider.clone()],
            source_url: hit.source_url.clone(),
            title: hit.title.clone(),
            snippet: hit.snippet.clone(),
            relevance_score: hit.relevance_score,
            discovered_at: Utc::now(),
            discovery_order,
            rank: 0,
            selected_by_fallback: false,
            fetch_succeeded: false,
            fetch_error: None,
            is_pdf: false,
            raw_content: None,
            raw_content_length: 0,
            extracted_content: None,
            extracted_content_length: 0,
            chunks: Vec::new(),
            pre_filter_length: None,
            garbage_filtered: false,
            filter_reason: None,
            quality_score: None,
            cleaned_content: None,
            cleaned_length: None,
            cleaning_error: None,
            metadata: hit.metadata.clone(),
        }
    }

    /// Host of `source_url`, lowercased. Empty when the URL has no host.
    pub fn domain(&self) -> String {
        url::Url::parse(&self.source_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
            .unwrap_or_default()
    }

    /// Whether this candidate should be handed to the cleaner.
    pub fn eligible_for_cleaning(&self) -> bool {
        self.fetch_succeeded
            && !self.garbage_filtered
            && self
                .extracted_content
                .as_deref()
                .is_some_and(|t| !t.trim().is_empty())
    }

    /// Text of one chunk, or `None` when the span is out of range.
    pub fn chunk_text(&self, span: &ChunkSpan) -> Option<&str> {
        self.extracted_content
            .as_deref()
            .and_then(|t| t.get(span.start..span.end))
    }

    /// Insert a metadata entry.
    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}

// ---------------------------------------------------------------------------
// PipelineResult
// ---------------------------------------------------------------------------

/// Per-stage counters for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageStats {
    pub raw_hits: usize,
    pub rejected_below_threshold: usize,
    pub fallback_pulled: usize,
    pub final_threshold: f64,
    pub fetch_failed: usize,
    pub garbage_filtered: usize,
    pub pdf_exempted: usize,
    pub chunked_documents: usize,
    pub cleaning_failed: usize,
    pub model_calls: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// The sole contract handed to report synthesis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub original_query: String,
    pub expansion_set: ExpansionSet,
    /// Every selected candidate, ordered by selection rank.
    pub candidates: Vec<Candidate>,
    pub providers_used: Vec<String>,
    pub total_candidates_discovered: usize,
    pub total_selected_for_acquisition: usize,
    pub total_cleaned: usize,
    #[serde(rename = "processing_time_ms", with = "duration_ms")]
    pub processing_time: std::time::Duration,
    pub partial_failure: bool,
    pub errors: Vec<String>,
    /// Garbage-filter reasons, informational only.
    #[serde(default)]
    pub filter_notes: Vec<String>,
    #[serde(default)]
    pub stats: StageStats,
}

impl PipelineResult {
    /// Candidates that carry cleaned text.
    pub fn cleaned(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.cleaned_content.is_some())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str) -> RawHit {
        RawHit {
            source_url: url.into(),
            title: "Wind report".into(),
            snippet: "Offshore capacity grew".into(),
            relevance_score: 0.7,
            query_variant: "current wind energy developments".into(),
            provider: "tavily".into(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn candidate_from_hit_carries_provenance() {
        let c = Candidate::from_hit("https://a.example/x".into(), &hit("https://A.example/x"), 4);
        assert_eq!(c.query_variants, vec!["current wind energy developments"]);
        assert_eq!(c.providers, vec!["tavily"]);
        assert_eq!(c.discovery_order, 4);
        assert_eq!(c.domain(), "a.example");
        assert!(!c.eligible_for_cleaning());
    }

    #[test]
    fn chunk_text_reads_span() {
        let mut c = Candidate::from_hit("k".into(), &hit("https://a.example/"), 0);
        c.extracted_content = Some("abcdef".into());
        assert_eq!(c.chunk_text(&ChunkSpan { index: 0, start: 2, end: 4 }), Some("cd"));
        assert_eq!(c.chunk_text(&ChunkSpan { index: 1, start: 4, end: 99 }), None);
    }

    #[test]
    fn result_serializes_processing_time_as_millis() {
        let result = PipelineResult {
            run_id: RunId::new(),
            started_at: Utc::now(),
            original_query: "q".into(),
            expansion_set: ExpansionSet::unexpanded("q"),
            candidates: vec![],
            providers_used: vec![],
            total_candidates_discovered: 0,
            total_selected_for_acquisition: 0,
            total_cleaned: 0,
            processing_time: std::time::Duration::from_millis(1500),
            partial_failure: true,
            errors: vec!["no candidates".into()],
            filter_notes: vec![],
            stats: StageStats::default(),
        };
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["processing_time_ms"], 1500);

        let parsed: PipelineResult = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed.processing_time.as_millis(), 1500);
    }
}
