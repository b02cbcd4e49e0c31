//! OpenRouter chat-completions backend.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use corpus_shared::{OpenRouterConfig, Result as CorpusResult, read_api_key};

use crate::{Completion, CompletionRequest, ModelBackend, ModelError};

/// Default request timeout when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible chat-completions client pointed at OpenRouter.
#[derive(Clone)]
pub struct OpenRouterBackend {
    http_client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for OpenRouterBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterBackend")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenRouterBackend {
    /// Create a backend with an explicit key, endpoint, and model.
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, ModelError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ModelError::Network(e.to_string()))?;
        Ok(Self {
            http_client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        })
    }

    /// Build from the `[openrouter]` config section, reading the key from its env var.
    pub fn from_config(config: &OpenRouterConfig) -> CorpusResult<Self> {
        let api_key = read_api_key(&config.api_key_env)?;
        Self::new(
            api_key,
            &config.base_url,
            &config.default_model,
            DEFAULT_TIMEOUT,
        )
        .map_err(|e| corpus_shared::CorpusError::Model(e.to_string()))
    }

    /// Model identifier sent with each request.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelBackend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    #[instrument(skip_all, fields(model = %self.model, prompt_len = request.prompt.len()))]
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError> {
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(ChatMessage {
                role: "system",
                content: &request.system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &self.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let start = Instant::now();
        let response = self
            .http_client
            .post(format!("{}/chat/completions", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout
                } else {
                    ModelError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "model API returned error status");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Parse(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(ModelError::EmptyResponse)?;
        if choice.finish_reason.as_deref() == Some("length") {
            warn!(max_tokens = ?request.max_tokens, "completion stopped at the token limit");
            return Err(ModelError::Truncated);
        }
        let text = choice
            .message
            .content
            .filter(|t| !t.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)?;

        let usage = parsed.usage.unwrap_or(Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
        });
        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(
            tokens_in = usage.prompt_tokens,
            tokens_out = usage.completion_tokens,
            latency_ms,
            "completion received"
        );

        Ok(Completion {
            text,
            tokens_in: usage.prompt_tokens,
            tokens_out: usage.completion_tokens,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer) -> OpenRouterBackend {
        OpenRouterBackend::new("test-key", server.uri(), "test/model", Duration::from_secs(5))
            .expect("client")
    }

    #[tokio::test]
    async fn complete_parses_choice_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "test/model",
                "choices": [{"message": {"role": "assistant", "content": "[\"a\"]"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            })))
            .mount(&server)
            .await;

        let completion = backend(&server)
            .complete(CompletionRequest::new("sys", "hi"))
            .await
            .expect("completion");
        assert_eq!(completion.text, "[\"a\"]");
        assert_eq!(completion.tokens_in, 12);
        assert_eq!(completion.tokens_out, 3);
        assert_eq!(completion.model, "test/model");
    }

    #[tokio::test]
    async fn error_status_maps_to_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = backend(&server)
            .complete(CompletionRequest::new("", "hi"))
            .await
            .unwrap_err();
        match err {
            ModelError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blank_content_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "   "}}]
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .complete(CompletionRequest::new("", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::EmptyResponse));
    }

    #[tokio::test]
    async fn length_cutoff_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "max_tokens": 64 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {"content": "{\"results\": [{\"id\": \"1\", \"cleaned\": \"The tur"},
                    "finish_reason": "length"
                }],
                "usage": {"prompt_tokens": 900, "completion_tokens": 64}
            })))
            .mount(&server)
            .await;

        let err = backend(&server)
            .complete(CompletionRequest::new("", "clean this").with_max_tokens(64))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Truncated), "{err:?}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn stop_finish_reason_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "done"}, "finish_reason": "stop"}]
            })))
            .mount(&server)
            .await;

        let completion = backend(&server)
            .complete(CompletionRequest::new("", "hi"))
            .await
            .expect("completion");
        assert_eq!(completion.text, "done");
        assert_eq!(completion.tokens_out, 0);
    }

    #[test]
    fn from_config_requires_key() {
        let config = OpenRouterConfig {
            api_key_env: "CORPUS_TEST_MISSING_OPENROUTER_KEY".into(),
            ..OpenRouterConfig::default()
        };
        assert!(OpenRouterBackend::from_config(&config).is_err());
    }
}
