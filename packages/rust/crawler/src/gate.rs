//! Acquisition gate: concurrent, bounded fetching of selected candidates.
//!
//! Every candidate runs as its own task and owns its record until the task
//! returns it. A global semaphore bounds total in-flight fetches and a
//! per-domain semaphore keeps any one host from being hammered. Host checks
//! and the domain circuit breaker are consulted before any network call.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use url::Url;

use corpus_shared::{AcquisitionError, Candidate, CorpusError, PipelineConfig, Result};

use crate::breaker::DomainFailureCache;
use crate::chunk::chunk_spans;
use crate::fetch::{FetchedDocument, fetch_document};
use crate::preflight::{DocumentKind, check_host, is_ssrf_target, probe};

/// User-Agent string for fetch requests.
const USER_AGENT: &str = concat!("corpus/", env!("CARGO_PKG_VERSION"));

const MAX_REDIRECTS: usize = 5;

/// Metadata key holding the stable failure tag of a failed fetch.
pub const FETCH_ERROR_KIND: &str = "fetch_error_kind";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The slice of pipeline configuration the gate needs.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub max_concurrency_global: usize,
    pub max_concurrency_per_domain: usize,
    pub pdf_size_cap_bytes: u64,
    pub pdf_chunk_size_chars: usize,
    pub chunking_threshold_chars: usize,
    pub domain_denylist: BTreeSet<String>,
    pub per_call_timeout: Duration,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    pub allow_private_hosts: bool,
}

impl From<&PipelineConfig> for GateConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_concurrency_global: config.max_concurrency_global.max(1),
            max_concurrency_per_domain: config.max_concurrency_per_domain.max(1),
            pdf_size_cap_bytes: config.pdf_size_cap_bytes,
            pdf_chunk_size_chars: config.pdf_chunk_size_chars,
            chunking_threshold_chars: config.chunking_threshold_chars,
            domain_denylist: config.domain_denylist.clone(),
            per_call_timeout: config.per_call_timeout,
            allow_private_hosts: config.allow_private_hosts,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

/// Build the HTTP client used for preflight and fetch.
///
/// Redirects are followed up to a limit and never into private address
/// space unless private hosts are allowed.
pub fn build_client(config: &GateConfig) -> Result<Client> {
    let allow_private = config.allow_private_hosts;
    let policy = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_private && is_ssrf_target(attempt.url()) {
            attempt.error("redirect into a private address")
        } else {
            attempt.follow()
        }
    });

    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(policy)
        .timeout(config.per_call_timeout)
        .build()
        .map_err(|e| CorpusError::Network(format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Counters for one acquisition pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub pdfs: usize,
    pub chunked: usize,
    /// Failure count per stable error kind.
    pub failures_by_kind: BTreeMap<String, usize>,
    /// Domains whose circuit was open when the pass finished.
    pub open_domains: Vec<String>,
}

impl AcquisitionReport {
    fn from_candidates(candidates: &[Candidate]) -> Self {
        let mut report = Self {
            attempted: candidates.len(),
            ..Self::default()
        };
        for c in candidates {
            if c.fetch_succeeded {
                report.succeeded += 1;
                if c.is_pdf {
                    report.pdfs += 1;
                }
                if !c.chunks.is_empty() {
                    report.chunked += 1;
                }
            } else {
                report.failed += 1;
                let kind = c
                    .metadata
                    .get(FETCH_ERROR_KIND)
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                *report.failures_by_kind.entry(kind.to_string()).or_default() += 1;
            }
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Fetches candidates under global and per-domain concurrency limits.
pub struct AcquisitionGate {
    client: Client,
    config: Arc<GateConfig>,
    cache: DomainFailureCache,
}

struct TaskContext {
    client: Client,
    config: Arc<GateConfig>,
    cache: DomainFailureCache,
    global: Arc<Semaphore>,
    domain: Arc<Semaphore>,
    deadline: Option<Instant>,
}

impl AcquisitionGate {
    pub fn new(config: GateConfig, cache: DomainFailureCache) -> Result<Self> {
        let client = build_client(&config)?;
        Ok(Self {
            client,
            config: Arc::new(config),
            cache,
        })
    }

    pub fn domain_cache(&self) -> &DomainFailureCache {
        &self.cache
    }

    /// Acquire every candidate and return them in rank order.
    ///
    /// Never fails as a whole: each candidate comes back with either
    /// extracted content or a `fetch_error`. Once `deadline` passes, no new
    /// fetch is started; fetches already in flight finish normally.
    #[instrument(skip_all, fields(candidates = candidates.len()))]
    pub async fn acquire_all(
        &self,
        candidates: Vec<Candidate>,
        deadline: Option<Instant>,
    ) -> (Vec<Candidate>, AcquisitionReport) {
        let global = Arc::new(Semaphore::new(self.config.max_concurrency_global));
        let mut per_domain: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut finished: Vec<Candidate> = Vec::with_capacity(candidates.len());
        let mut handles = Vec::with_capacity(candidates.len());

        for mut candidate in candidates {
            if deadline_passed(deadline) {
                record_failure(&mut candidate, &AcquisitionError::DeadlineReached);
                finished.push(candidate);
                continue;
            }

            let domain = per_domain
                .entry(candidate.domain())
                .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrency_per_domain)))
                .clone();
            let ctx = TaskContext {
                client: self.client.clone(),
                config: self.config.clone(),
                cache: self.cache.clone(),
                global: global.clone(),
                domain,
                deadline,
            };
            let fallback = candidate.clone();
            handles.push((fallback, tokio::spawn(acquire_one(candidate, ctx))));
        }

        for (fallback, handle) in handles {
            match handle.await {
                Ok(candidate) => finished.push(candidate),
                Err(e) => {
                    warn!(url = %fallback.source_url, error = %e, "acquisition task failed");
                    let mut candidate = fallback;
                    record_failure(
                        &mut candidate,
                        &AcquisitionError::Network(format!("acquisition task failed: {e}")),
                    );
                    finished.push(candidate);
                }
            }
        }

        finished.sort_by_key(|c| c.rank);

        let mut report = AcquisitionReport::from_candidates(&finished);
        report.open_domains = self.cache.open_domains().await;

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            pdfs = report.pdfs,
            chunked = report.chunked,
            "acquisition complete"
        );

        (finished, report)
    }
}

async fn acquire_one(mut candidate: Candidate, ctx: TaskContext) -> Candidate {
    match try_acquire(&candidate, &ctx).await {
        Ok(doc) => apply_document(&mut candidate, doc, &ctx.config),
        Err(err) => {
            debug!(url = %candidate.source_url, error = %err, "acquisition failed");
            record_failure(&mut candidate, &err);
        }
    }
    candidate
}

async fn try_acquire(
    candidate: &Candidate,
    ctx: &TaskContext,
) -> std::result::Result<FetchedDocument, AcquisitionError> {
    let url = Url::parse(&candidate.source_url)
        .map_err(|e| AcquisitionError::InvalidUrl(format!("{}: {e}", candidate.source_url)))?;
    let host = check_host(&url, &ctx.config)?;

    let _domain_permit = ctx
        .domain
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| AcquisitionError::Network("domain semaphore closed".into()))?;
    let _permit = ctx
        .global
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| AcquisitionError::Network("semaphore closed".into()))?;

    if deadline_passed(ctx.deadline) {
        return Err(AcquisitionError::DeadlineReached);
    }
    ctx.cache.check(&host).await?;

    let result = async {
        let probe = probe(&ctx.client, &url, &ctx.config).await?;
        fetch_document(&ctx.client, &url, &probe, &ctx.config).await
    }
    .await;

    match &result {
        Ok(_) => ctx.cache.record_success(&host).await,
        Err(e) if e.counts_against_domain() => {
            ctx.cache.record_failure(&host, e.kind()).await;
        }
        Err(_) => {}
    }
    result
}

fn apply_document(candidate: &mut Candidate, doc: FetchedDocument, config: &GateConfig) {
    candidate.fetch_succeeded = true;
    candidate.fetch_error = None;
    candidate.is_pdf = doc.kind == DocumentKind::Pdf;

    candidate.raw_content_length = doc.raw.chars().count();
    candidate.raw_content = Some(doc.raw);

    candidate.chunks = chunk_spans(
        &doc.extracted,
        config.chunking_threshold_chars,
        config.pdf_chunk_size_chars,
    );
    candidate.extracted_content_length = doc.extracted.chars().count();
    candidate.extracted_content = Some(doc.extracted);

    if candidate.title.trim().is_empty() {
        if let Some(title) = doc.metadata.get("title").and_then(|v| v.as_str()) {
            candidate.title = title.to_string();
        }
    }
    candidate.metadata.extend(doc.metadata);

    if !candidate.chunks.is_empty() {
        debug!(
            url = %candidate.source_url,
            chunks = candidate.chunks.len(),
            "document chunked"
        );
    }
}

fn record_failure(candidate: &mut Candidate, err: &AcquisitionError) {
    candidate.fetch_succeeded = false;
    candidate.fetch_error = Some(err.to_string());
    candidate.set_meta(FETCH_ERROR_KIND, err.kind());
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}
