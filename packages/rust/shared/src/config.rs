//! Application configuration for the research pipeline.
//!
//! User config lives at `~/.corpus/corpus.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CorpusError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "corpus.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".corpus";

/// Upper bound on generated sub-queries.
pub const MAX_SUB_QUERIES: usize = 4;

// ---------------------------------------------------------------------------
// Config structs (matching corpus.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// OpenRouter (model backend) settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Search provider settings.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Pipeline tunables.
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for expansion and cleaning.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// OpenAI-compatible API root.
    #[serde(default = "default_openrouter_url")]
    pub base_url: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_openrouter_url(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_openrouter_url() -> String {
    "https://openrouter.ai/api/v1".into()
}

/// `[providers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "default_tavily")]
    pub tavily: ProviderConfig,

    #[serde(default = "default_exa")]
    pub exa: ProviderConfig,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            tavily: default_tavily(),
            exa: default_exa(),
        }
    }
}

/// `[providers.<name>]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the env var holding the API key.
    pub api_key_env: String,

    /// API root.
    pub base_url: String,

    /// Hits scoring below this are dropped before any page fetch.
    #[serde(default)]
    pub min_score: f64,
}

fn default_tavily() -> ProviderConfig {
    ProviderConfig {
        enabled: true,
        api_key_env: "TAVILY_API_KEY".into(),
        base_url: "https://api.tavily.com".into(),
        min_score: 0.2,
    }
}
fn default_exa() -> ProviderConfig {
    ProviderConfig {
        enabled: true,
        api_key_env: "EXA_API_KEY".into(),
        base_url: "https://api.exa.ai".into(),
        min_score: 0.1,
    }
}

/// Relative weights of the garbage-filter signals.
///
/// Left tunable on purpose: rejection rates swing widely across similar
/// queries, so no single weighting is baked in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityWeights {
    #[serde(default = "default_w_repetition")]
    pub repetition: f64,
    #[serde(default = "default_w_boilerplate")]
    pub boilerplate: f64,
    #[serde(default = "default_w_spam")]
    pub spam: f64,
    #[serde(default = "default_w_domain")]
    pub domain: f64,
}

impl Default for QualityWeights {
    fn default() -> Self {
        Self {
            repetition: default_w_repetition(),
            boilerplate: default_w_boilerplate(),
            spam: default_w_spam(),
            domain: default_w_domain(),
        }
    }
}

fn default_w_repetition() -> f64 {
    0.3
}
fn default_w_boilerplate() -> f64 {
    0.3
}
fn default_w_spam() -> f64 {
    0.25
}
fn default_w_domain() -> f64 {
    0.15
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    #[serde(default = "default_target")]
    pub target_candidate_count: usize,
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f64,
    #[serde(default = "default_relaxation_step")]
    pub relevance_relaxation_step: f64,
    #[serde(default = "default_max_sub_queries")]
    pub max_sub_queries: usize,
    #[serde(default)]
    pub include_original_query: bool,
    #[serde(default = "default_results_per_provider")]
    pub results_per_provider: usize,
    #[serde(default = "default_global_concurrency")]
    pub max_concurrency_global: usize,
    #[serde(default = "default_per_domain_concurrency")]
    pub max_concurrency_per_domain: usize,
    #[serde(default = "default_cleaning_concurrency")]
    pub max_concurrency_cleaning: usize,
    #[serde(default = "default_pdf_cap")]
    pub pdf_size_cap_bytes: u64,
    #[serde(default = "default_chunk_size")]
    pub pdf_chunk_size_chars: usize,
    #[serde(default = "default_chunking_threshold")]
    pub chunking_threshold_chars: usize,
    #[serde(default = "default_filter_threshold")]
    pub garbage_filter_threshold: f64,
    #[serde(default = "default_true")]
    pub garbage_filter_pdf_exempt: bool,
    #[serde(default)]
    pub quality_weights: QualityWeights,
    #[serde(default = "default_min_words")]
    pub min_words: usize,
    #[serde(default = "default_batch_size")]
    pub cleaning_batch_size: usize,
    #[serde(default = "default_batch_budget")]
    pub cleaning_batch_char_budget: usize,
    #[serde(default = "default_max_attempts")]
    pub max_model_attempts: u32,
    #[serde(default)]
    pub domain_denylist: BTreeSet<String>,
    #[serde(default = "default_failure_threshold")]
    pub domain_failure_threshold: u32,
    #[serde(default = "default_backoff_secs")]
    pub domain_backoff_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub per_call_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_deadline_secs: Option<u64>,
    #[serde(default)]
    pub allow_private_hosts: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_candidate_count: default_target(),
            relevance_threshold: default_relevance_threshold(),
            relevance_relaxation_step: default_relaxation_step(),
            max_sub_queries: default_max_sub_queries(),
            include_original_query: false,
            results_per_provider: default_results_per_provider(),
            max_concurrency_global: default_global_concurrency(),
            max_concurrency_per_domain: default_per_domain_concurrency(),
            max_concurrency_cleaning: default_cleaning_concurrency(),
            pdf_size_cap_bytes: default_pdf_cap(),
            pdf_chunk_size_chars: default_chunk_size(),
            chunking_threshold_chars: default_chunking_threshold(),
            garbage_filter_threshold: default_filter_threshold(),
            garbage_filter_pdf_exempt: true,
            quality_weights: QualityWeights::default(),
            min_words: default_min_words(),
            cleaning_batch_size: default_batch_size(),
            cleaning_batch_char_budget: default_batch_budget(),
            max_model_attempts: default_max_attempts(),
            domain_denylist: default_denylist(),
            domain_failure_threshold: default_failure_threshold(),
            domain_backoff_secs: default_backoff_secs(),
            per_call_timeout_secs: default_timeout_secs(),
            run_deadline_secs: None,
            allow_private_hosts: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_target() -> usize {
    10
}
fn default_relevance_threshold() -> f64 {
    0.5
}
fn default_relaxation_step() -> f64 {
    0.1
}
fn default_max_sub_queries() -> usize {
    3
}
fn default_results_per_provider() -> usize {
    10
}
fn default_global_concurrency() -> usize {
    8
}
fn default_per_domain_concurrency() -> usize {
    2
}
fn default_cleaning_concurrency() -> usize {
    4
}
fn default_pdf_cap() -> u64 {
    25 * 1024 * 1024
}
fn default_chunk_size() -> usize {
    30_000
}
fn default_chunking_threshold() -> usize {
    250_000
}
fn default_filter_threshold() -> f64 {
    0.45
}
fn default_min_words() -> usize {
    30
}
fn default_batch_size() -> usize {
    4
}
fn default_batch_budget() -> usize {
    30_000
}
fn default_max_attempts() -> u32 {
    2
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    900
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_denylist() -> BTreeSet<String> {
    [
        "pinterest.com",
        "facebook.com",
        "instagram.com",
        "tiktok.com",
        "quora.com",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration — merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Selection size K.
    pub target_candidate_count: usize,
    /// Initial selection bar.
    pub relevance_threshold: f64,
    /// How far the bar drops per fallback round.
    pub relevance_relaxation_step: f64,
    /// Number of model-generated angles (1..=4).
    pub max_sub_queries: usize,
    /// Prepend the original query to the sub-queries.
    pub include_original_query: bool,
    /// `max_results` passed to each provider call.
    pub results_per_provider: usize,
    pub max_concurrency_global: usize,
    pub max_concurrency_per_domain: usize,
    pub max_concurrency_cleaning: usize,
    pub pdf_size_cap_bytes: u64,
    /// Fixed chunk size for oversized documents.
    pub pdf_chunk_size_chars: usize,
    /// Documents longer than this are chunked.
    pub chunking_threshold_chars: usize,
    pub garbage_filter_threshold: f64,
    pub garbage_filter_pdf_exempt: bool,
    pub quality_weights: QualityWeights,
    /// Texts shorter than this many words score as thin content.
    pub min_words: usize,
    pub cleaning_batch_size: usize,
    /// Max characters grouped into one cleaning request.
    pub cleaning_batch_char_budget: usize,
    /// Attempts per model call before the item is marked failed.
    pub max_model_attempts: u32,
    pub domain_denylist: BTreeSet<String>,
    /// Failures before a domain's circuit opens.
    pub domain_failure_threshold: u32,
    pub domain_backoff: Duration,
    pub per_call_timeout: Duration,
    /// Stop scheduling new work after this long.
    pub run_deadline: Option<Duration>,
    /// Permit loopback/private hosts (integration tests, intranets).
    pub allow_private_hosts: bool,
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        let p = &config.pipeline;
        Self {
            target_candidate_count: p.target_candidate_count,
            relevance_threshold: p.relevance_threshold,
            relevance_relaxation_step: p.relevance_relaxation_step,
            max_sub_queries: p.max_sub_queries,
            include_original_query: p.include_original_query,
            results_per_provider: p.results_per_provider,
            max_concurrency_global: p.max_concurrency_global,
            max_concurrency_per_domain: p.max_concurrency_per_domain,
            max_concurrency_cleaning: p.max_concurrency_cleaning,
            pdf_size_cap_bytes: p.pdf_size_cap_bytes,
            pdf_chunk_size_chars: p.pdf_chunk_size_chars,
            chunking_threshold_chars: p.chunking_threshold_chars,
            garbage_filter_threshold: p.garbage_filter_threshold,
            garbage_filter_pdf_exempt: p.garbage_filter_pdf_exempt,
            quality_weights: p.quality_weights,
            min_words: p.min_words,
            cleaning_batch_size: p.cleaning_batch_size,
            cleaning_batch_char_budget: p.cleaning_batch_char_budget,
            max_model_attempts: p.max_model_attempts,
            domain_denylist: p
                .domain_denylist
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect(),
            domain_failure_threshold: p.domain_failure_threshold,
            domain_backoff: Duration::from_secs(p.domain_backoff_secs),
            per_call_timeout: Duration::from_secs(p.per_call_timeout_secs),
            run_deadline: p.run_deadline_secs.map(Duration::from_secs),
            allow_private_hosts: p.allow_private_hosts,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl PipelineConfig {
    /// Reject programmer-error configurations before a run starts.
    pub fn validate(&self) -> Result<()> {
        if self.target_candidate_count == 0 {
            return Err(CorpusError::validation(
                "target_candidate_count must be greater than 0",
            ));
        }
        for (name, value) in [
            ("relevance_threshold", self.relevance_threshold),
            ("garbage_filter_threshold", self.garbage_filter_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CorpusError::validation(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(self.relevance_relaxation_step > 0.0 && self.relevance_relaxation_step <= 1.0) {
            return Err(CorpusError::validation(
                "relevance_relaxation_step must be within (0, 1]",
            ));
        }
        if !(1..=MAX_SUB_QUERIES).contains(&self.max_sub_queries) {
            return Err(CorpusError::validation(format!(
                "max_sub_queries must be within 1..={MAX_SUB_QUERIES}"
            )));
        }
        for (name, value) in [
            ("results_per_provider", self.results_per_provider),
            ("max_concurrency_global", self.max_concurrency_global),
            ("max_concurrency_per_domain", self.max_concurrency_per_domain),
            ("max_concurrency_cleaning", self.max_concurrency_cleaning),
            ("pdf_chunk_size_chars", self.pdf_chunk_size_chars),
            ("cleaning_batch_size", self.cleaning_batch_size),
            ("cleaning_batch_char_budget", self.cleaning_batch_char_budget),
        ] {
            if value == 0 {
                return Err(CorpusError::validation(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.max_model_attempts == 0 {
            return Err(CorpusError::validation(
                "max_model_attempts must be at least 1",
            ));
        }
        if self.domain_failure_threshold == 0 {
            return Err(CorpusError::validation(
                "domain_failure_threshold must be at least 1",
            ));
        }
        if self.per_call_timeout.is_zero() {
            return Err(CorpusError::validation("per_call_timeout must be non-zero"));
        }
        let w = &self.quality_weights;
        let total = w.repetition + w.boilerplate + w.spam + w.domain;
        if [w.repetition, w.boilerplate, w.spam, w.domain]
            .iter()
            .any(|v| *v < 0.0)
            || total <= 0.0
        {
            return Err(CorpusError::validation(
                "quality_weights must be non-negative with a positive sum",
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.corpus/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CorpusError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.corpus/corpus.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CorpusError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CorpusError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CorpusError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CorpusError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CorpusError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a non-empty API key from the named env var.
pub fn read_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(CorpusError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    read_api_key(&config.openrouter.api_key_env).map(|_| ())
}
