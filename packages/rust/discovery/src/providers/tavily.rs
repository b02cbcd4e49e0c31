//! Tavily search adapter.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use corpus_shared::{ProviderError, RawHit};

use super::{SearchProvider, clamp_score, http_client, positional_score};

const NAME: &str = "tavily";

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    search_depth: &'static str,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    published_date: Option<String>,
}

/// Tavily `/search` client.
pub struct TavilyProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    min_score: f64,
    timeout: Duration,
}

impl TavilyProvider {
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
impl SearchProvider for TavilyProvider {
    fn name(&self) -> &str {
        NAME
    }

    fn min_score(&self) -> f64 {
        self.min_score
    }

    #[instrument(skip_all, fields(provider = NAME, sub_query = %sub_query))]
    async fn search(&self, sub_query: &str, max_results: usize) -> Result<Vec<RawHit>, ProviderError> {
        let request = TavilyRequest {
            query: sub_query,
            search_depth: "basic",
            max_results,
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .header(header::AUTHORIZATION, format!("Bearer {}", self.api_key))
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

        let body: TavilyResponse = response.json().await.map_err(|e| ProviderError::Parse {
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
                RawHit {
                    source_url: r.url.trim().to_string(),
                    title: r.title.unwrap_or_default(),
                    snippet: r.content.unwrap_or_default(),
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

        debug!(hits = hits.len(), "tavily search complete");
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header as header_match, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_results_with_provenance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header_match("authorization", "Bearer tv-key"))
            .and(body_partial_json(serde_json::json!({"query": "current wind energy", "max_results": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "results": [
                    {"url": "https://a.example/wind", "title": "Wind", "content": "Offshore", "score": 0.91,
                     "published_date": "2025-03-01"},
                    {"url": "https://b.example/x", "title": "B", "content": "...", "score": 1.4},
                    {"url": "", "title": "empty"}
                ]
            })))
            .mount(&server)
            .await;

        let provider =
            TavilyProvider::new("tv-key", &server.uri(), 0.2, Duration::from_secs(5)).expect("client");
        let hits = provider.search("current wind energy", 5).await.expect("search");

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].provider, "tavily");
        assert_eq!(hits[0].query_variant, "current wind energy");
        assert_eq!(hits[0].relevance_score, 0.91);
        assert_eq!(hits[0].metadata["published_date"], "2025-03-01");
        assert_eq!(hits[1].relevance_score, 1.0);
    }

    #[tokio::test]
    async fn http_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let provider =
            TavilyProvider::new("k", &server.uri(), 0.0, Duration::from_secs(5)).expect("client");
        let err = provider.search("q", 5).await.unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 429, .. }));
    }
}
