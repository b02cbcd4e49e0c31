//! Search provider adapters.
//!
//! Each adapter owns its auth and request shape and parses the provider's
//! JSON into [`RawHit`]s at the boundary. Scores are normalized to [0, 1];
//! when a provider omits one, a rank-derived score is used instead.

mod exa;
mod tavily;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use corpus_shared::{AppConfig, ProviderError, RawHit, read_api_key};

pub use exa::ExaProvider;
pub use tavily::TavilyProvider;

/// User-Agent sent with provider requests.
pub(crate) const USER_AGENT: &str = concat!("corpus/", env!("CARGO_PKG_VERSION"));

/// A web search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Stable provider name recorded on every hit.
    fn name(&self) -> &str;

    /// Hits scoring below this floor are dropped by the dispatcher.
    fn min_score(&self) -> f64 {
        0.0
    }

    /// Run one search. Hits are tagged with `sub_query` as their variant.
    async fn search(&self, sub_query: &str, max_results: usize) -> Result<Vec<RawHit>, ProviderError>;
}

/// Score for the hit at `position` (0-based) of `total` when the provider gives none.
pub(crate) fn positional_score(position: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    1.0 - (position as f64 / total as f64) * 0.5
}

pub(crate) fn clamp_score(score: f64) -> f64 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
}

/// Build every enabled provider whose API key is present.
///
/// Missing keys are returned as [`ProviderError::NotConfigured`] so the run
/// can report them instead of silently searching with fewer providers.
pub fn providers_from_config(
    config: &AppConfig,
    timeout: Duration,
) -> (Vec<Arc<dyn SearchProvider>>, Vec<ProviderError>) {
    let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();
    let mut errors = Vec::new();

    let tavily = &config.providers.tavily;
    if tavily.enabled {
        match read_api_key(&tavily.api_key_env)
            .map_err(|e| e.to_string())
            .and_then(|key| {
                TavilyProvider::new(key, &tavily.base_url, tavily.min_score, timeout)
                    .map_err(|e| e.to_string())
            }) {
            Ok(p) => providers.push(Arc::new(p)),
            Err(message) => errors.push(ProviderError::NotConfigured {
                provider: "tavily".into(),
                message,
            }),
        }
    }

    let exa = &config.providers.exa;
    if exa.enabled {
        match read_api_key(&exa.api_key_env)
            .map_err(|e| e.to_string())
            .and_then(|key| {
                ExaProvider::new(key, &exa.base_url, exa.min_score, timeout)
                    .map_err(|e| e.to_string())
            }) {
            Ok(p) => providers.push(Arc::new(p)),
            Err(message) => errors.push(ProviderError::NotConfigured {
                provider: "exa".into(),
                message,
            }),
        }
    }

    (providers, errors)
}
