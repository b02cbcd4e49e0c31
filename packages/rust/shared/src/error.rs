//! Error types for the research pipeline.
//!
//! Library crates use [`CorpusError`] via `thiserror` for conditions that
//! abort an operation. Per-stage failures that must stay local to a single
//! candidate, chunk, or provider have their own typed enums; their `Display`
//! output is what gets recorded on the candidate or in the run's error list.
//! The CLI wraps everything with `color-eyre`.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for operations that can genuinely fail a call.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error (client construction, transport).
    #[error("network error: {0}")]
    Network(String),

    /// Parsing error (JSON payloads, HTML, URLs).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Model backend error.
    #[error("model error: {0}")]
    Model(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Invalid input or configuration values.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CorpusError>;

impl CorpusError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage taxonomies
// ---------------------------------------------------------------------------

/// Query expansion failure. Always recovered by the heuristic fallback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExpansionError {
    #[error("model-error: {0}")]
    Model(String),

    #[error("malformed-output: {0}")]
    Malformed(String),
}

/// A search provider call that contributed zero hits.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider {provider} timed out after {}ms", elapsed.as_millis())]
    Timeout { provider: String, elapsed: Duration },

    #[error("provider {provider} returned HTTP {status}")]
    Http { provider: String, status: u16 },

    #[error("provider {provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("provider {provider} response unparseable: {message}")]
    Parse { provider: String, message: String },

    #[error("provider {provider} not configured: {message}")]
    NotConfigured { provider: String, message: String },
}

/// Why a candidate could not be acquired.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcquisitionError {
    #[error("denylisted-domain: {domain}")]
    Denylisted { domain: String },

    #[error("blocked-host: {host}")]
    BlockedHost { host: String },

    #[error("blocked-content-type: {content_type}")]
    BlockedContentType { content_type: String },

    #[error("paywall-detected: {signal}")]
    PaywallDetected { signal: String },

    #[error("timeout: no response within {}ms", elapsed.as_millis())]
    Timeout { elapsed: Duration },

    #[error("http-error: HTTP {status}")]
    Http { status: u16 },

    #[error("network-error: {0}")]
    Network(String),

    #[error("domain-circuit-open: {domain} after {failures} failures")]
    DomainCircuitOpen { domain: String, failures: u32 },

    #[error("invalid-url: {0}")]
    InvalidUrl(String),

    #[error("deadline-reached: run deadline passed before fetch was scheduled")]
    DeadlineReached,

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl AcquisitionError {
    /// Stable kind tag (the prefix of the `Display` output).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Denylisted { .. } => "denylisted-domain",
            Self::BlockedHost { .. } => "blocked-host",
            Self::BlockedContentType { .. } => "blocked-content-type",
            Self::PaywallDetected { .. } => "paywall-detected",
            Self::Timeout { .. } => "timeout",
            Self::Http { .. } => "http-error",
            Self::Network(_) => "network-error",
            Self::DomainCircuitOpen { .. } => "domain-circuit-open",
            Self::InvalidUrl(_) => "invalid-url",
            Self::DeadlineReached => "deadline-reached",
            Self::Extraction(e) => e.kind(),
        }
    }

    /// Whether this failure says something about the host's health and
    /// should count toward its circuit breaker.
    pub fn counts_against_domain(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) | Self::PaywallDetected { .. } => true,
            Self::Http { status } => *status == 403 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Content extraction failure after a successful transfer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExtractionError {
    #[error("pdf-too-large: {size} bytes exceeds cap of {cap} bytes")]
    PdfTooLarge { size: u64, cap: u64 },

    #[error("pdf-invalid: {0}")]
    PdfInvalid(String),

    #[error("extraction-empty: no textual content extracted")]
    Empty,

    #[error("conversion-failed: {0}")]
    Conversion(String),

    #[error("chunk-failure: chunk {index}: {message}")]
    ChunkFailure { index: usize, message: String },
}

impl ExtractionError {
    /// Stable kind tag (the prefix of the `Display` output).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PdfTooLarge { .. } => "pdf-too-large",
            Self::PdfInvalid(_) => "pdf-invalid",
            Self::Empty => "extraction-empty",
            Self::Conversion(_) => "conversion-failed",
            Self::ChunkFailure { .. } => "chunk-failure",
        }
    }
}

/// Per-candidate (or per-chunk) cleaning failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CleaningError {
    #[error("model-error: {0}")]
    Model(String),

    #[error("malformed-output: {0}")]
    MalformedOutput(String),

    #[error("empty-response: model returned no text for this item")]
    EmptyResponse,

    #[error("timeout: model call exceeded {}ms", elapsed.as_millis())]
    Timeout { elapsed: Duration },

    #[error("chunk-failure: chunk {index}: {source}")]
    Chunk {
        index: usize,
        #[source]
        source: Box<CleaningError>,
    },

    #[error("no-backend: no model backend configured for cleaning")]
    NoBackend,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CorpusError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = CorpusError::validation("target_candidate_count must be > 0");
        assert!(err.to_string().contains("target_candidate_count"));
    }

    #[test]
    fn acquisition_display_starts_with_kind() {
        let errors = [
            AcquisitionError::PaywallDetected {
                signal: "redirect to /login".into(),
            },
            AcquisitionError::Timeout {
                elapsed: Duration::from_secs(3),
            },
            AcquisitionError::DomainCircuitOpen {
                domain: "slow.example".into(),
                failures: 3,
            },
            AcquisitionError::Extraction(ExtractionError::PdfTooLarge { size: 10, cap: 5 }),
        ];
        for err in errors {
            assert!(
                err.to_string().starts_with(err.kind()),
                "{err} should start with {}",
                err.kind()
            );
        }
    }

    #[test]
    fn domain_health_classification() {
        assert!(AcquisitionError::Http { status: 503 }.counts_against_domain());
        assert!(AcquisitionError::Http { status: 429 }.counts_against_domain());
        assert!(!AcquisitionError::Http { status: 404 }.counts_against_domain());
        assert!(
            !AcquisitionError::BlockedContentType {
                content_type: "image/png".into()
            }
            .counts_against_domain()
        );
    }

    #[test]
    fn chunk_cleaning_error_names_index() {
        let err = CleaningError::Chunk {
            index: 2,
            source: Box::new(CleaningError::EmptyResponse),
        };
        assert!(err.to_string().starts_with("chunk-failure: chunk 2"));
    }
}
