//! Query expansion: one user query in, a handful of diverse sub-queries out.
//!
//! The model path asks for exactly N distinct research angles as a JSON
//! array. When no model is configured, or every bounded attempt fails or
//! returns something unusable, a deterministic template expander keyed by
//! the detected [`QueryType`] takes over. [`QueryExpander::expand`] never
//! fails.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use corpus_llm::{CompletionRequest, ModelBackend, UsageTotals, parse_json_block};
use corpus_shared::{ExpansionError, ExpansionMethod, ExpansionSet, MAX_SUB_QUERIES, PipelineConfig};

const SYSTEM_PROMPT: &str = "You are a research planner. You rewrite one research question \
into distinct web search queries that each cover a different angle. Respond with a JSON \
array of strings and nothing else.";

/// Coarse query category driving the template fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Product,
    Historical,
    News,
    Business,
    General,
}

static PRODUCT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(best|review|reviews|vs\.?|versus|compare|comparison|price|pricing|buy|specs|alternatives?)\b")
        .expect("valid product regex")
});

static NEWS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(latest|recent|news|today|breaking|this week|this year|current|developments|updates?)\b")
        .expect("valid news regex")
});

static HISTORICAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(history|historical|origins?|evolution|ancient|medieval|century|timeline|founded|invented)\b")
        .expect("valid historical regex")
});

static BUSINESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(company|companies|market|revenue|stock|startup|industry|competitors?|earnings|valuation|business)\b")
        .expect("valid business regex")
});

/// Temporal words removed from news queries before filling templates.
static TEMPORAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(latest|recent|current|new|newest|today'?s?|breaking|this week|this year)\b")
        .expect("valid temporal regex")
});

static NEWS_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s+(developments|news|updates|trends)$").expect("valid suffix regex")
});

static PRODUCT_WORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(best|top|reviews?)\b").expect("valid product words regex")
});

static HISTORY_WORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(history of|history|historical)\b").expect("valid history words regex")
});

/// Classify a query for the template fallback.
pub fn detect_query_type(query: &str) -> QueryType {
    if PRODUCT_RE.is_match(query) {
        QueryType::Product
    } else if NEWS_RE.is_match(query) {
        QueryType::News
    } else if HISTORICAL_RE.is_match(query) {
        QueryType::Historical
    } else if BUSINESS_RE.is_match(query) {
        QueryType::Business
    } else {
        QueryType::General
    }
}

fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn strip_words(re: &Regex, query: &str) -> String {
    let stripped = squash(&re.replace_all(query, " "));
    if stripped.is_empty() {
        squash(query)
    } else {
        stripped
    }
}

/// Fill the template angles for `query` and keep the first `n`.
pub fn heuristic_expand(query: &str, n: usize) -> Vec<String> {
    let query = squash(query);
    let angles: Vec<String> = match detect_query_type(&query) {
        QueryType::News => {
            let core = strip_words(&TEMPORAL_RE, &query);
            let topic = {
                let t = NEWS_SUFFIX_RE.replace(&core, "").to_string();
                if t.is_empty() { core.clone() } else { t }
            };
            vec![
                format!("current {core}"),
                format!("historical {topic} trends"),
                format!("future {topic} forecasts"),
                format!("{topic} expert analysis"),
            ]
        }
        QueryType::Product => {
            let topic = strip_words(&PRODUCT_WORDS_RE, &query);
            vec![
                format!("{topic} reviews"),
                format!("{topic} comparison with alternatives"),
                format!("{topic} specifications and pricing"),
                format!("{topic} common problems"),
            ]
        }
        QueryType::Historical => {
            let topic = strip_words(&HISTORY_WORDS_RE, &query);
            vec![
                format!("{topic} origins"),
                format!("{topic} key events timeline"),
                format!("{topic} historical significance"),
                format!("{topic} legacy today"),
            ]
        }
        QueryType::Business => vec![
            format!("{query} market analysis"),
            format!("{query} competitors"),
            format!("{query} financial performance"),
            format!("{query} industry outlook"),
        ],
        QueryType::General => vec![
            format!("{query} background and history"),
            format!("current state of {query}"),
            format!("future of {query}"),
            format!("{query} compared to alternatives"),
        ],
    };
    dedupe(angles).into_iter().take(n).collect()
}

/// Trim, drop empties, and remove case-insensitive duplicates, keeping first occurrence.
fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|s| squash(&s))
        .filter(|s| !s.is_empty() && seen.insert(s.to_lowercase()))
        .collect()
}

/// Expansion result plus the model usage it cost.
#[derive(Debug, Clone)]
pub struct ExpansionOutcome {
    pub set: ExpansionSet,
    pub usage: UsageTotals,
}

/// The single query-expansion service shared by every provider dispatch.
pub struct QueryExpander {
    model: Option<Arc<dyn ModelBackend>>,
    max_sub_queries: usize,
    include_original: bool,
    max_attempts: u32,
    timeout: Duration,
}

impl QueryExpander {
    pub fn new(model: Option<Arc<dyn ModelBackend>>, config: &PipelineConfig) -> Self {
        Self {
            model,
            max_sub_queries: config.max_sub_queries.clamp(1, MAX_SUB_QUERIES),
            include_original: config.include_original_query,
            max_attempts: config.max_model_attempts.max(1),
            timeout: config.per_call_timeout,
        }
    }

    /// Expand `query` into sub-queries. Never fails.
    #[instrument(skip_all, fields(query = %query))]
    pub async fn expand(&self, query: &str) -> ExpansionOutcome {
        let query = squash(query);
        let mut usage = UsageTotals::default();

        if query.is_empty() {
            return ExpansionOutcome {
                set: ExpansionSet::unexpanded(&query),
                usage,
            };
        }

        let (angles, method, fallback_reason) = match &self.model {
            Some(model) => match self.expand_with_model(model.as_ref(), &query, &mut usage).await {
                Ok(angles) => (angles, ExpansionMethod::Model, None),
                Err(e) => {
                    warn!(error = %e, "model expansion failed, using heuristic fallback");
                    (
                        heuristic_expand(&query, self.max_sub_queries),
                        ExpansionMethod::Heuristic,
                        Some(e.to_string()),
                    )
                }
            },
            None => (
                heuristic_expand(&query, self.max_sub_queries),
                ExpansionMethod::Heuristic,
                Some("no model backend configured".to_string()),
            ),
        };

        let mut sub_queries = Vec::with_capacity(angles.len() + 1);
        if self.include_original {
            sub_queries.push(query.clone());
        }
        sub_queries.extend(angles);
        let mut sub_queries = dedupe(sub_queries);
        if sub_queries.is_empty() {
            sub_queries.push(query.clone());
        }

        info!(
            count = sub_queries.len(),
            method = ?method,
            "query expanded"
        );

        ExpansionOutcome {
            set: ExpansionSet {
                original_query: query,
                sub_queries,
                method,
                fallback_reason,
            },
            usage,
        }
    }

    async fn expand_with_model(
        &self,
        model: &dyn ModelBackend,
        query: &str,
        usage: &mut UsageTotals,
    ) -> Result<Vec<String>, ExpansionError> {
        let n = self.max_sub_queries;
        let prompt = format!(
            "Research question: \"{query}\"\n\n\
             Write exactly {n} web search queries, each covering a distinct angle \
             (for example historical background, current state, future outlook, \
             comparison). Keep each under 12 words and do not repeat the question verbatim.\n\
             Return only a JSON array of {n} strings."
        );

        let mut last_error = ExpansionError::Model("no attempts made".into());
        for attempt in 1..=self.max_attempts {
            let request = CompletionRequest::new(SYSTEM_PROMPT, prompt.clone())
                .with_max_tokens(300)
                .with_temperature(0.4);

            let completion = match tokio::time::timeout(self.timeout, model.complete(request)).await {
                Ok(Ok(c)) => c,
                Ok(Err(e)) => {
                    usage.record_failed_call();
                    debug!(attempt, error = %e, "expansion call failed");
                    last_error = ExpansionError::Model(e.to_string());
                    continue;
                }
                Err(_) => {
                    usage.record_failed_call();
                    debug!(attempt, "expansion call timed out");
                    last_error = ExpansionError::Model(format!(
                        "timed out after {}ms",
                        self.timeout.as_millis()
                    ));
                    continue;
                }
            };
            usage.record(&completion);

            match parse_angles(&completion.text, n) {
                Ok(angles) => return Ok(angles),
                Err(e) => {
                    debug!(attempt, error = %e, "expansion output rejected");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Validate model output: a JSON array with at least one usable string.
fn parse_angles(text: &str, n: usize) -> Result<Vec<String>, ExpansionError> {
    let raw: Vec<serde_json::Value> =
        parse_json_block(text).map_err(|e| ExpansionError::Malformed(e.to_string()))?;
    let strings: Vec<String> = raw
        .into_iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    let angles: Vec<String> = dedupe(strings).into_iter().take(n).collect();
    if angles.is_empty() {
        return Err(ExpansionError::Malformed(
            "no usable sub-queries in model output".into(),
        ));
    }
    Ok(angles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use corpus_llm::{Completion, ModelError};
    use std::sync::Mutex;

    /// Returns queued replies in order; errors once the queue is empty.
    struct ScriptedModel {
        replies: Mutex<Vec<Result<String, ModelError>>>,
    }

    impl ScriptedModel {
        fn new(mut replies: Vec<Result<String, ModelError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _request: CompletionRequest) -> Result<Completion, ModelError> {
            let next = self.replies.lock().expect("lock").pop();
            match next {
                Some(Ok(text)) => Ok(Completion {
                    text,
                    tokens_in: 5,
                    tokens_out: 7,
                    model: "scripted".into(),
                    latency_ms: 1,
                }),
                Some(Err(e)) => Err(e),
                None => Err(ModelError::EmptyResponse),
            }
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[test]
    fn news_query_fills_templates() {
        assert_eq!(
            detect_query_type("latest wind energy developments"),
            QueryType::News
        );
        assert_eq!(
            heuristic_expand("latest wind energy developments", 3),
            vec![
                "current wind energy developments",
                "historical wind energy trends",
                "future wind energy forecasts",
            ]
        );
    }

    #[test]
    fn query_type_detection() {
        assert_eq!(detect_query_type("best noise cancelling headphones"), QueryType::Product);
        assert_eq!(detect_query_type("history of the printing press"), QueryType::Historical);
        assert_eq!(detect_query_type("nvidia competitors"), QueryType::Business);
        assert_eq!(detect_query_type("how do tides work"), QueryType::General);
    }

    #[test]
    fn heuristic_respects_count() {
        assert_eq!(heuristic_expand("how do tides work", 1).len(), 1);
        assert_eq!(heuristic_expand("how do tides work", 4).len(), 4);
    }

    #[tokio::test]
    async fn model_path_used_when_valid() {
        let model = ScriptedModel::new(vec![Ok(
            "```json\n[\"wind power history\", \"offshore wind 2025\", \"wind energy outlook\"]\n```"
                .into(),
        )]);
        let expander = QueryExpander::new(Some(model), &config());
        let outcome = expander.expand("latest wind energy developments").await;

        assert_eq!(outcome.set.method, ExpansionMethod::Model);
        assert_eq!(outcome.set.sub_queries.len(), 3);
        assert_eq!(outcome.set.sub_queries[0], "wind power history");
        assert!(outcome.set.fallback_reason.is_none());
        assert_eq!(outcome.usage.calls, 1);
        assert_eq!(outcome.usage.tokens_out, 7);
    }

    #[tokio::test]
    async fn malformed_output_retries_then_falls_back() {
        let model = ScriptedModel::new(vec![
            Ok("I cannot help with that".into()),
            Ok("[]".into()),
        ]);
        let expander = QueryExpander::new(Some(model), &config());
        let outcome = expander.expand("latest wind energy developments").await;

        assert_eq!(outcome.set.method, ExpansionMethod::Heuristic);
        assert_eq!(outcome.usage.calls, 2);
        assert!(
            outcome
                .set
                .fallback_reason
                .as_deref()
                .is_some_and(|r| r.starts_with("malformed-output"))
        );
        assert_eq!(outcome.set.sub_queries[0], "current wind energy developments");
    }

    #[tokio::test]
    async fn model_error_falls_back() {
        let model = ScriptedModel::new(vec![
            Err(ModelError::Timeout),
            Err(ModelError::Network("reset".into())),
        ]);
        let expander = QueryExpander::new(Some(model), &config());
        let outcome = expander.expand("how do tides work").await;
        assert_eq!(outcome.set.method, ExpansionMethod::Heuristic);
        assert_eq!(outcome.set.sub_queries.len(), 3);
    }

    #[tokio::test]
    async fn original_query_prepended_and_deduped() {
        let model = ScriptedModel::new(vec![Ok(
            "[\"Tides Explained\", \"tides explained\", \"moon and tides\"]".into(),
        )]);
        let cfg = PipelineConfig {
            include_original_query: true,
            ..config()
        };
        let expander = QueryExpander::new(Some(model), &cfg);
        let outcome = expander.expand("  tides   explained ").await;
        assert_eq!(
            outcome.set.sub_queries,
            vec!["tides explained", "moon and tides"]
        );
    }

    #[tokio::test]
    async fn no_model_uses_heuristic() {
        let expander = QueryExpander::new(None, &config());
        let outcome = expander.expand("nvidia competitors").await;
        assert_eq!(outcome.set.method, ExpansionMethod::Heuristic);
        assert_eq!(outcome.usage.calls, 0);
        assert!(!outcome.set.sub_queries.is_empty());
    }
}
