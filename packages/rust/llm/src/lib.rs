//! Model backend abstraction.
//!
//! Query expansion and content cleaning both talk to a language model
//! through the [`ModelBackend`] trait. The production implementation is
//! [`OpenRouterBackend`], an OpenAI-compatible chat-completions client;
//! tests substitute scripted backends.

pub mod json;
pub mod openrouter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use json::{extract_json_block, parse_json_block};
pub use openrouter::OpenRouterBackend;

/// One completion request.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the backend for a JSON object response when supported.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// A model response with usage accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: String,
    pub latency_ms: u64,
}

/// Running totals of model usage across a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl UsageTotals {
    /// Count one completed call.
    pub fn record(&mut self, completion: &Completion) {
        self.calls += 1;
        self.tokens_in += completion.tokens_in;
        self.tokens_out += completion.tokens_out;
    }

    /// Count a call that produced no completion.
    pub fn record_failed_call(&mut self) {
        self.calls += 1;
    }

    pub fn merge(&mut self, other: UsageTotals) {
        self.calls += other.calls;
        self.tokens_in += other.tokens_in;
        self.tokens_out += other.tokens_out;
    }
}

/// Model backend errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    /// Connection failed before a response arrived.
    #[error("network error: {0}")]
    Network(String),

    /// The request exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Non-2xx response.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    /// Response body did not match the expected shape.
    #[error("parse error: {0}")]
    Parse(String),

    /// The model answered with no content.
    #[error("empty response")]
    EmptyResponse,

    /// Generation stopped at the `max_tokens` limit; the text is incomplete.
    #[error("output truncated at the token limit")]
    Truncated,
}

impl ModelError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::EmptyResponse => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::Parse(_) | Self::Truncated => false,
        }
    }
}

/// A language-model backend.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Short name used in logs and provenance (`openrouter`, `scripted`, ...).
    fn name(&self) -> &str;

    /// Run one completion.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = CompletionRequest::new("sys", "hello")
            .with_max_tokens(256)
            .with_temperature(0.2)
            .json();
        assert_eq!(req.system, "sys");
        assert_eq!(req.max_tokens, Some(256));
        assert!(req.json_mode);
    }

    #[test]
    fn usage_totals_accumulate() {
        let completion = Completion {
            text: "ok".into(),
            tokens_in: 10,
            tokens_out: 4,
            model: "m".into(),
            latency_ms: 1,
        };
        let mut totals = UsageTotals::default();
        totals.record(&completion);
        totals.record_failed_call();

        let mut other = UsageTotals::default();
        other.record(&completion);
        totals.merge(other);

        assert_eq!(totals.calls, 3);
        assert_eq!(totals.tokens_in, 20);
        assert_eq!(totals.tokens_out, 8);
    }

    #[test]
    fn retry_classification() {
        assert!(ModelError::Timeout.is_retryable());
        assert!(
            ModelError::Api {
                status: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            !ModelError::Api {
                status: 401,
                message: "bad key".into()
            }
            .is_retryable()
        );
        assert!(!ModelError::Parse("x".into()).is_retryable());
        // The same request would stop at the same limit.
        assert!(!ModelError::Truncated.is_retryable());
    }
}
