//! Batched model-assisted content cleaning.
//!
//! Small and medium documents are packed into batches (bounded by item count
//! and total characters) and cleaned with one request per batch. Chunked
//! documents, and any document too large for one request, send one request
//! per piece with bounded parallelism and are reassembled in order. Every model call sits behind the same
//! semaphore, has its own timeout, and is retried a bounded number of times;
//! a retry only re-sends the items that are still unresolved.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use corpus_crawler::chunk_spans;
use corpus_llm::{CompletionRequest, ModelBackend, UsageTotals, parse_json_block};
use corpus_shared::{Candidate, ChunkSpan, CleaningError, PipelineConfig};

/// Cleaned text longer than this multiple of its input is flagged.
const EXPANSION_SMELL_RATIO: f64 = 1.5;

/// Metadata key set when cleaning grew the text suspiciously.
pub const EXPANSION_SMELL_KEY: &str = "cleaning_expansion_ratio";

/// Output tokens one cleaning request may ask for.
pub const MAX_OUTPUT_TOKENS: u32 = 16_384;

/// Conservative characters-per-token estimate used to size requests.
const CHARS_PER_TOKEN: usize = 3;

/// Most input characters one request carries. Cleaned text runs about as
/// long as its input, so the input must leave room for JSON escaping inside
/// `MAX_OUTPUT_TOKENS`.
pub const MAX_REQUEST_CHARS: usize = MAX_OUTPUT_TOKENS as usize * CHARS_PER_TOKEN * 3 / 4;

static SYSTEM_PROMPT: LazyLock<String> = LazyLock::new(|| {
    [
        "You clean raw text extracted from web pages and PDFs for a research corpus.",
        "Remove navigation, menus, cookie and subscription notices, advertisements, share \
         buttons, comment sections and text unrelated to the document's subject.",
        "Preserve every fact, figure, number, date, name and direct quotation exactly as written.",
        "Do not summarize, paraphrase, reorder or add anything. Keep paragraph breaks.",
        "Respond with JSON only: {\"results\": [{\"id\": \"<document id>\", \"cleaned\": \"<text>\"}]} \
         with one entry per document.",
    ]
    .join("\n")
});

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// One item of the model's cleaning response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelCleaningResult {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub cleaned: Option<String>,
}

/// Accepted response shapes: the documented object, or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CleaningPayload {
    Wrapped { results: Vec<ModelCleaningResult> },
    Bare(Vec<ModelCleaningResult>),
}

impl CleaningPayload {
    fn into_results(self) -> Vec<ModelCleaningResult> {
        match self {
            Self::Wrapped { results } | Self::Bare(results) => results,
        }
    }
}

fn id_as_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => Ok(s.trim().to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or number, got {other}"
        ))),
    }
}

/// Parse a model reply into id → cleaned text.
pub fn parse_cleaning_response(
    text: &str,
) -> Result<HashMap<String, Option<String>>, CleaningError> {
    let payload: CleaningPayload =
        parse_json_block(text).map_err(|e| CleaningError::MalformedOutput(e.to_string()))?;
    Ok(payload
        .into_results()
        .into_iter()
        .map(|r| (r.id, r.cleaned))
        .collect())
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Counters for one cleaning pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleaningReport {
    pub eligible: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub batches: usize,
    pub chunked_documents: usize,
    pub chunk_requests: usize,
    pub expansion_smells: usize,
    pub usage: UsageTotals,
}

// ---------------------------------------------------------------------------
// Work planning
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum WorkUnit {
    /// Candidate indices cleaned together in one request.
    Batch(Vec<usize>),
    /// A candidate cleaned one span at a time.
    Chunked(usize, Vec<ChunkSpan>),
}

/// Pack eligible candidates into work units, preserving rank order.
///
/// Candidates with acquisition chunks, or longer than `char_budget`, are
/// cleaned piecewise with no piece over `char_budget` characters.
fn plan_units(
    candidates: &[Candidate],
    eligible: &[usize],
    batch_size: usize,
    char_budget: usize,
) -> Vec<WorkUnit> {
    let mut units = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_chars = 0;

    for &idx in eligible {
        let candidate = &candidates[idx];
        let chars = candidate.extracted_content_length;
        if !candidate.chunks.is_empty() || chars > char_budget {
            units.push(WorkUnit::Chunked(idx, cleaning_spans(candidate, char_budget)));
            continue;
        }
        let full = current.len() >= batch_size
            || (!current.is_empty() && current_chars + chars > char_budget);
        if full {
            units.push(WorkUnit::Batch(std::mem::take(&mut current)));
            current_chars = 0;
        }
        current.push(idx);
        current_chars += chars;
    }
    if !current.is_empty() {
        units.push(WorkUnit::Batch(current));
    }
    units
}

/// Split a candidate's text into spans of at most `limit` characters.
/// Acquisition chunks are kept and only split further when too long.
fn cleaning_spans(candidate: &Candidate, limit: usize) -> Vec<ChunkSpan> {
    let text = candidate.extracted_content.as_deref().unwrap_or_default();
    let whole = [ChunkSpan {
        index: 0,
        start: 0,
        end: text.len(),
    }];
    let base: &[ChunkSpan] = if candidate.chunks.is_empty() {
        &whole
    } else {
        &candidate.chunks
    };

    let mut spans: Vec<ChunkSpan> = Vec::with_capacity(base.len());
    for span in base {
        let pieces = match text.get(span.start..span.end) {
            Some(piece) => chunk_spans(piece, limit, limit),
            // Left as is; cleaning reports it out of range.
            None => Vec::new(),
        };
        if pieces.is_empty() {
            spans.push(ChunkSpan {
                index: spans.len(),
                ..*span
            });
            continue;
        }
        for piece in pieces {
            spans.push(ChunkSpan {
                index: spans.len(),
                start: span.start + piece.start,
                end: span.start + piece.end,
            });
        }
    }
    spans
}

struct UnitOutcome {
    items: Vec<(usize, Result<String, CleaningError>)>,
    usage: UsageTotals,
    requests: usize,
    chunked: bool,
}

// ---------------------------------------------------------------------------
// Cleaner
// ---------------------------------------------------------------------------

/// Batched, concurrency-bounded model cleaner.
pub struct BatchedCleaner {
    model: Option<Arc<dyn ModelBackend>>,
    batch_size: usize,
    char_budget: usize,
    concurrency: usize,
    max_attempts: u32,
    timeout: Duration,
}

impl BatchedCleaner {
    pub fn new(model: Option<Arc<dyn ModelBackend>>, config: &PipelineConfig) -> Self {
        Self {
            model,
            batch_size: config.cleaning_batch_size.max(1),
            char_budget: config.cleaning_batch_char_budget.clamp(1, MAX_REQUEST_CHARS),
            concurrency: config.max_concurrency_cleaning.max(1),
            max_attempts: config.max_model_attempts.max(1),
            timeout: config.per_call_timeout,
        }
    }

    /// Clean every eligible candidate in place.
    ///
    /// A failure is recorded on its own candidate as `cleaning_error`; it
    /// never affects other candidates in the same batch.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn clean_all(&self, candidates: &mut [Candidate], query: &str) -> CleaningReport {
        let eligible: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.eligible_for_cleaning())
            .map(|(i, _)| i)
            .collect();

        let mut report = CleaningReport {
            eligible: eligible.len(),
            ..CleaningReport::default()
        };
        if eligible.is_empty() {
            return report;
        }

        let Some(model) = &self.model else {
            warn!(count = eligible.len(), "no model backend, candidates left uncleaned");
            for idx in eligible {
                candidates[idx].cleaning_error = Some(CleaningError::NoBackend.to_string());
                report.failed += 1;
            }
            return report;
        };

        let units = plan_units(candidates, &eligible, self.batch_size, self.char_budget);
        report.batches = units.iter().filter(|u| matches!(u, WorkUnit::Batch(_))).count();
        report.chunked_documents = units.len() - report.batches;
        debug!(units = units.len(), batches = report.batches, "cleaning planned");

        let permits = Semaphore::new(self.concurrency);
        let outcomes = {
            let view: &[Candidate] = candidates;
            join_all(
                units
                    .iter()
                    .map(|unit| self.run_unit(model.as_ref(), &permits, view, unit, query)),
            )
            .await
        };

        for outcome in outcomes {
            report.usage.merge(outcome.usage);
            if outcome.chunked {
                report.chunk_requests += outcome.requests;
            }
            for (idx, result) in outcome.items {
                let candidate = &mut candidates[idx];
                match result {
                    Ok(text) => {
                        if apply_cleaned(candidate, text) {
                            report.expansion_smells += 1;
                        }
                        report.cleaned += 1;
                    }
                    Err(e) => {
                        warn!(url = %candidate.source_url, error = %e, "cleaning failed");
                        candidate.cleaning_error = Some(e.to_string());
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            cleaned = report.cleaned,
            failed = report.failed,
            calls = report.usage.calls,
            tokens_in = report.usage.tokens_in,
            tokens_out = report.usage.tokens_out,
            "cleaning complete"
        );
        report
    }

    async fn run_unit(
        &self,
        model: &dyn ModelBackend,
        permits: &Semaphore,
        candidates: &[Candidate],
        unit: &WorkUnit,
        query: &str,
    ) -> UnitOutcome {
        match unit {
            WorkUnit::Batch(indices) => {
                let docs: Vec<&str> = indices
                    .iter()
                    .map(|&i| candidates[i].extracted_content.as_deref().unwrap_or_default())
                    .collect();
                let (results, usage) = self.clean_docs(model, permits, &docs, query, None).await;
                UnitOutcome {
                    items: indices.iter().copied().zip(results).collect(),
                    requests: usage.calls,
                    usage,
                    chunked: false,
                }
            }
            WorkUnit::Chunked(idx, spans) => {
                let (result, usage) = self
                    .clean_chunked(model, permits, &candidates[*idx], spans, query)
                    .await;
                UnitOutcome {
                    items: vec![(*idx, result)],
                    requests: usage.calls,
                    usage,
                    chunked: true,
                }
            }
        }
    }

    /// Clean a document span by span; any failed span fails the whole document.
    async fn clean_chunked(
        &self,
        model: &dyn ModelBackend,
        permits: &Semaphore,
        candidate: &Candidate,
        spans: &[ChunkSpan],
        query: &str,
    ) -> (Result<String, CleaningError>, UsageTotals) {
        let total = spans.len();
        let futures = spans.iter().map(|span| async move {
            let Some(text) = candidate.chunk_text(span) else {
                return (
                    span.index,
                    Err(CleaningError::MalformedOutput("chunk span out of range".into())),
                    UsageTotals::default(),
                );
            };
            let (mut results, usage) = self
                .clean_docs(model, permits, &[text], query, Some((span.index, total)))
                .await;
            let result = results
                .pop()
                .unwrap_or(Err(CleaningError::EmptyResponse));
            (span.index, result, usage)
        });

        // join_all yields in input order, whatever order the calls finish in.
        let results = join_all(futures).await;

        let mut usage = UsageTotals::default();
        let mut parts = Vec::with_capacity(total);
        let mut failure = None;
        for (index, result, chunk_usage) in results {
            usage.merge(chunk_usage);
            match result {
                Ok(text) => parts.push(text),
                Err(e) if failure.is_none() => {
                    failure = Some(CleaningError::Chunk {
                        index,
                        source: Box::new(e),
                    });
                }
                Err(_) => {}
            }
        }

        match failure {
            Some(e) => (Err(e), usage),
            None => (Ok(parts.join("\n\n")), usage),
        }
    }

    /// Clean `docs` in one request, re-sending unresolved items up to the
    /// attempt limit. Results line up with `docs`.
    async fn clean_docs(
        &self,
        model: &dyn ModelBackend,
        permits: &Semaphore,
        docs: &[&str],
        query: &str,
        chunk: Option<(usize, usize)>,
    ) -> (Vec<Result<String, CleaningError>>, UsageTotals) {
        let mut usage = UsageTotals::default();
        let mut results: Vec<Result<String, CleaningError>> = docs
            .iter()
            .map(|_| Err(CleaningError::Model("not attempted".into())))
            .collect();

        for attempt in 1..=self.max_attempts {
            let pending: Vec<usize> = (0..docs.len()).filter(|&i| results[i].is_err()).collect();
            if pending.is_empty() {
                break;
            }

            let request = build_request(docs, &pending, query, chunk);
            let reply = {
                let Ok(_permit) = permits.acquire().await else {
                    let err = CleaningError::Model("cleaning semaphore closed".into());
                    for &i in &pending {
                        results[i] = Err(err.clone());
                    }
                    break;
                };
                tokio::time::timeout(self.timeout, model.complete(request)).await
            };

            let completion = match reply {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => {
                    usage.record_failed_call();
                    debug!(attempt, error = %e, "cleaning call failed");
                    let retryable = e.is_retryable();
                    for &i in &pending {
                        results[i] = Err(CleaningError::Model(e.to_string()));
                    }
                    if !retryable {
                        break;
                    }
                    continue;
                }
                Err(_) => {
                    usage.record_failed_call();
                    debug!(attempt, "cleaning call timed out");
                    for &i in &pending {
                        results[i] = Err(CleaningError::Timeout {
                            elapsed: self.timeout,
                        });
                    }
                    continue;
                }
            };
            usage.record(&completion);

            let parsed = match parse_cleaning_response(&completion.text) {
                Ok(map) => map,
                Err(e) => {
                    debug!(attempt, error = %e, "cleaning output rejected");
                    for &i in &pending {
                        results[i] = Err(e.clone());
                    }
                    continue;
                }
            };

            for &i in &pending {
                let id = doc_id(i);
                results[i] = match parsed.get(&id) {
                    Some(Some(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
                    Some(_) => Err(CleaningError::EmptyResponse),
                    None => Err(CleaningError::MalformedOutput(format!(
                        "no result for document {id}"
                    ))),
                };
            }
        }

        (results, usage)
    }
}

fn doc_id(position: usize) -> String {
    (position + 1).to_string()
}

fn build_request(
    docs: &[&str],
    pending: &[usize],
    query: &str,
    chunk: Option<(usize, usize)>,
) -> CompletionRequest {
    let mut prompt = format!("Research question: {query}\n\n");
    if let Some((index, total)) = chunk {
        prompt.push_str(&format!(
            "The document below is part {} of {total} of a longer document, cut at an \
             arbitrary point. Clean it on its own; do not add transitions.\n\n",
            index + 1
        ));
    }
    let mut input_chars = 0;
    for &i in pending {
        input_chars += docs[i].chars().count();
        prompt.push_str(&format!(
            "<document id=\"{}\">\n{}\n</document>\n\n",
            doc_id(i),
            docs[i]
        ));
    }

    CompletionRequest::new(SYSTEM_PROMPT.as_str(), prompt)
        .with_max_tokens(output_budget(input_chars, pending.len()))
        .with_temperature(0.0)
        .json()
}

/// Output tokens for a request cleaning `input_chars` characters across
/// `docs` documents: the input's token estimate plus a third for escaping
/// and the JSON envelope.
fn output_budget(input_chars: usize, docs: usize) -> u32 {
    let estimate = input_chars.div_ceil(CHARS_PER_TOKEN);
    let tokens = estimate + estimate / 3 + 32 * docs + 64;
    tokens.clamp(1_024, MAX_OUTPUT_TOKENS as usize) as u32
}

/// Store cleaned text; returns `true` if it grew suspiciously.
fn apply_cleaned(candidate: &mut Candidate, text: String) -> bool {
    let cleaned_len = text.chars().count();
    let input_len = candidate.extracted_content_length.max(1);
    candidate.cleaned_length = Some(cleaned_len);
    candidate.cleaned_content = Some(text);
    candidate.cleaning_error = None;

    let ratio = cleaned_len as f64 / input_len as f64;
    if ratio > EXPANSION_SMELL_RATIO {
        warn!(
            url = %candidate.source_url,
            extracted = input_len,
            cleaned = cleaned_len,
            "cleaned text is much longer than its input"
        );
        candidate.set_meta(EXPANSION_SMELL_KEY, (ratio * 100.0).round() / 100.0);
        return true;
    }
    false
}
