//! Exa search adapter.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use corpus_shared::{ProviderError, RawHit};

use super::{SearchProvider, clamp_score, http_client, positional_score};

const NAME: &str = "exa";

/// Snippet length requested from Exa's contents API.
const SNIPPET_CHARS: usize = 1_000;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaRequest<'a> {
    query: &'a str,
    num_results: usize,
    #[serde(rename = "type")]
    kind: &'static str,
    contents: ExaContents,
}

#[derive(Debug, Serialize)]
struct ExaContents {
    text: ExaTextConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExaTextConfig {
    max_characters: usize,
}

#[derive(Debug, Deserialize)]
struct ExaResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExaResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    highlights: Vec<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default)]
    author: Option<String>,
}

/// Exa `/search` client.
pub struct ExaProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    min_score: f64,
    timeout: Duration,
}

impl ExaProvider {
    pub fn new(
        api_key: impl Into<String>,
        base_url: &str,
        min_score: f64,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            min_score,
            timeout,
        })
    }
}

#[async_trait]
impl SearchProvider for ExaProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn min_score(&self) -> f64 {
        self.min_score
    }

    #[instrument(skip_all, fields(provider = NAME, sub_query = %sub_query))]
    async fn search(&self, sub_query: &str, max_results: usize) -> Result<Vec<RawHit>, ProviderError> {
        let request = ExaRequest {
            query: sub_query,
            num_results: max_results,
            kind: "auto",
            contents: ExaContents {
                text: ExaTextConfig {
                    max_characters: SNIPPET_CHARS,
                },
            },
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("x-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout {
                        provider: NAME.into(),
                        elapsed: self.timeout,
                    }
                } else {
                    ProviderError::Request {
                        provider: NAME.into(),
                        message: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Http {
                provider: NAME.into(),
                status: status.as_u16(),
            });
        }

        let body: ExaResponse = response.json().await.map_err(|e| ProviderError::Parse {
            provider: NAME.into(),
            message: e.to_string(),
        })?;

        let total = body.results.len();
        let hits: Vec<RawHit> = body
            .results
            .into_iter()
            .enumerate()
            .filter(|(_, r)| !r.url.trim().is_empty())
            .map(|(i, r)| {
                let mut metadata = BTreeMap::new();
                if let Some(date) = r.published_date {
                    metadata.insert("published_date".to_string(), date.into());
                }
                if let Some(author) = r.author.filter(|a| !a.is_empty()) {
                    metadata.insert("author".to_string(), author.into());
                }
                let snippet = r
                    .text
                    .or_else(|| r.highlights.into_iter().next())
                    .unwrap_or_default();
                RawHit {
                    source_url: r.url.trim().to_string(),
                    title: r.title.unwrap_or_default(),
                    snippet,
                    relevance_score: r
                        .score
                        .map(clamp_score)
                        .unwrap_or_else(|| positional_score(i, total)),
                    query_variant: sub_query.to_string(),
                    provider: NAME.to_string(),
                    metadata,
                }
            })
            .collect();

        debug!(hits = hits.len(), "exa search complete");
        Ok(hits)
    }
}
