//! Per-domain circuit breaker for the acquisition gate.
//!
//! Failures that say something about a host's health (timeouts, transport
//! errors, paywalls, 403/429/5xx) increment that domain's count. Once the
//! count reaches the threshold the circuit opens and further candidates on
//! the domain are refused without a network call until the backoff expires.
//! After the backoff one probe is let through; a single further failure
//! reopens the circuit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use corpus_shared::AcquisitionError;

/// Failure record for one domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainFailure {
    pub failure_count: u32,
    pub last_failure_reason: String,
    /// Set while the circuit is open.
    pub backoff_until: Option<Instant>,
}

/// Concurrency-safe map of domain → failure record.
///
/// Cloning shares the underlying map. A fresh cache is created per run
/// unless the caller deliberately injects a shared one.
#[derive(Debug, Clone)]
pub struct DomainFailureCache {
    inner: Arc<Mutex<HashMap<String, DomainFailure>>>,
    threshold: u32,
    backoff: Duration,
}

impl DomainFailureCache {
    pub fn new(threshold: u32, backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            threshold: threshold.max(1),
            backoff,
        }
    }

    /// Refuse the domain if its circuit is open.
    pub async fn check(&self, domain: &str) -> Result<(), AcquisitionError> {
        let mut map = self.inner.lock().await;
        let Some(entry) = map.get_mut(domain) else {
            return Ok(());
        };
        match entry.backoff_until {
            Some(until) if Instant::now() < until => Err(AcquisitionError::DomainCircuitOpen {
                domain: domain.to_string(),
                failures: entry.failure_count,
            }),
            Some(_) => {
                // Half-open: let one request through; one more failure reopens.
                debug!(domain, "circuit backoff expired, allowing probe");
                entry.backoff_until = None;
                entry.failure_count = self.threshold.saturating_sub(1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Count a failure; returns `true` if this failure opened the circuit.
    pub async fn record_failure(&self, domain: &str, reason: &str) -> bool {
        let mut map = self.inner.lock().await;
        let entry = map.entry(domain.to_string()).or_insert_with(|| DomainFailure {
            failure_count: 0,
            last_failure_reason: String::new(),
            backoff_until: None,
        });
        entry.failure_count += 1;
        entry.last_failure_reason = reason.to_string();

        if entry.failure_count >= self.threshold && entry.backoff_until.is_none() {
            entry.backoff_until = Some(Instant::now() + self.backoff);
            warn!(
                domain,
                failures = entry.failure_count,
                reason,
                backoff_secs = self.backoff.as_secs(),
                "domain circuit opened"
            );
            return true;
        }
        false
    }

    /// A success clears the domain's record.
    pub async fn record_success(&self, domain: &str) {
        self.inner.lock().await.remove(domain);
    }

    /// Domains whose circuit is currently open.
    pub async fn open_domains(&self) -> Vec<String> {
        let now = Instant::now();
        let map = self.inner.lock().await;
        let mut open: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.backoff_until.is_some_and(|until| now < until))
            .map(|(d, _)| d.clone())
            .collect();
        open.sort();
        open
    }

    /// Copy of the current state, ordered by domain.
    pub async fn snapshot(&self) -> BTreeMap<String, DomainFailure> {
        self.inner
            .lock()
            .await
            .iter()
            .map(|(d, e)| (d.clone(), e.clone()))
            .collect()
    }
}
