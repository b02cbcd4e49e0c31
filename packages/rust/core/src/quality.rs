//! Heuristic garbage filter.
//!
//! Runs before any model call. Each fetched, non-exempt candidate gets a
//! composite `quality_score` in [0,1]: a weighted geometric mean over three
//! penalties and a prior:
//!
//! - repetition: duplicated lines and repeated 5-word shingles
//! - boilerplate: menu-like short lines and cookie/subscribe/share phrases
//! - spam: promotional keyword density and shouting
//! - domain prior: reputation of the host
//!
//! Text shorter than `min_words` is scaled down as thin content. The filter
//! never modifies content.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use corpus_shared::{Candidate, PipelineConfig, QualityWeights};

const SHINGLE_SIZE: usize = 5;

const MIN_GOODNESS: f64 = 0.01;

/// Keyword hits per 100 words that count as saturated spam.
const SPAM_SATURATION_PER_100: f64 = 3.0;

const BOILERPLATE_PHRASES: &[&str] = &[
    "accept all cookies",
    "we use cookies",
    "cookie policy",
    "privacy policy",
    "terms of service",
    "terms of use",
    "all rights reserved",
    "sign up for our newsletter",
    "subscribe to our newsletter",
    "follow us on",
    "share this article",
    "share on facebook",
    "share on twitter",
    "skip to content",
    "skip to main content",
    "related articles",
    "recommended for you",
    "advertisement",
    "log in",
    "sign in",
    "back to top",
    "read more",
];

static SPAM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:buy now|click here|order now|act now|limited time offer|free shipping|best price|lowest price|discount code|promo code|coupon code|casino|jackpot|viagra|cialis|payday loan|earn money fast|work from home|make money online|100% free|risk[- ]free|guaranteed results|miracle|crypto giveaway)\b",
    )
    .expect("valid regex")
});

/// Reputable hosts and suffixes.
const TRUSTED_SUFFIXES: &[&str] = &[
    ".gov", ".edu", ".mil", ".int", ".ac.uk", ".gov.uk", ".europa.eu", "wikipedia.org",
    "arxiv.org", "nature.com", "science.org", "nih.gov", "who.int", "reuters.com", "apnews.com",
    "bbc.co.uk", "bbc.com", "acm.org", "ieee.org", "springer.com", "sciencedirect.com",
];

/// Content farms and aggregator hosts.
const LOW_REPUTATION_SUFFIXES: &[&str] = &[
    "ezinearticles.com",
    "hubpages.com",
    "ehow.com",
    "answers.com",
    "articlesbase.com",
    "buzzfeed.com",
    "blogspot.com",
    "wattpad.com",
];

const PRIOR_TRUSTED: f64 = 0.95;
const PRIOR_DEFAULT: f64 = 0.6;
const PRIOR_LOW: f64 = 0.2;

/// Which signal dragged a score down the most.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Repetition,
    Boilerplate,
    Spam,
    DomainReputation,
    ThinContent,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Repetition => "repetition",
            Self::Boilerplate => "boilerplate",
            Self::Spam => "spam",
            Self::DomainReputation => "domain reputation",
            Self::ThinContent => "thin content",
        }
    }
}

/// Raw signal values for one text.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualitySignals {
    /// 0 = no repetition, 1 = entirely repeated.
    pub repetition: f64,
    pub boilerplate: f64,
    pub spam: f64,
    /// 0 = disreputable, 1 = highly reputable.
    pub domain_prior: f64,
    pub word_count: usize,
}

/// A scored text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityAssessment {
    pub score: f64,
    pub signals: QualitySignals,
    pub dominant: Signal,
}

impl QualityAssessment {
    /// Human-readable reason naming the dominant signal.
    pub fn reason(&self, threshold: f64) -> String {
        let detail = match self.dominant {
            Signal::Repetition => format!("repetition ratio {:.2}", self.signals.repetition),
            Signal::Boilerplate => format!("boilerplate density {:.2}", self.signals.boilerplate),
            Signal::Spam => format!("spam density {:.2}", self.signals.spam),
            Signal::DomainReputation => format!("domain prior {:.2}", self.signals.domain_prior),
            Signal::ThinContent => format!("{} words", self.signals.word_count),
        };
        format!(
            "quality {:.2} below threshold {:.2}: {} ({detail})",
            self.score,
            threshold,
            self.dominant.as_str()
        )
    }
}

/// Counters for one filter pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterReport {
    pub evaluated: usize,
    pub filtered: usize,
    pub pdf_exempted: usize,
    /// `"{url}: {reason}"` for every filtered candidate.
    pub notes: Vec<String>,
}

/// Multi-signal heuristic quality gate.
#[derive(Debug, Clone)]
pub struct GarbageFilter {
    threshold: f64,
    pdf_exempt: bool,
    weights: QualityWeights,
    min_words: usize,
}

impl GarbageFilter {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            threshold: config.garbage_filter_threshold,
            pdf_exempt: config.garbage_filter_pdf_exempt,
            weights: config.quality_weights,
            min_words: config.min_words,
        }
    }

    /// Score a text from `domain`.
    pub fn assess(&self, text: &str, domain: &str) -> QualityAssessment {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let words: Vec<&str> = text.split_whitespace().collect();

        let signals = QualitySignals {
            repetition: repetition_ratio(&lines, &words),
            boilerplate: boilerplate_density(&lines),
            spam: spam_density(text, &words),
            domain_prior: domain_prior(domain),
            word_count: words.len(),
        };

        // Weighted geometric mean of per-signal goodness: one saturated
        // signal is enough to sink the score.
        let w = self.weights;
        let total_weight = (w.repetition + w.boilerplate + w.spam + w.domain).max(f64::EPSILON);
        let losses = [
            (Signal::Repetition, w.repetition * loss(1.0 - signals.repetition)),
            (Signal::Boilerplate, w.boilerplate * loss(1.0 - signals.boilerplate)),
            (Signal::Spam, w.spam * loss(1.0 - signals.spam)),
            (Signal::DomainReputation, w.domain * loss(signals.domain_prior)),
        ];
        let composite = (-losses.iter().map(|(_, l)| l).sum::<f64>() / total_weight).exp();

        let thin = self.min_words > 0 && signals.word_count < self.min_words;
        let score = if thin {
            composite * (signals.word_count as f64 / self.min_words as f64)
        } else {
            composite
        };

        let dominant = if thin {
            Signal::ThinContent
        } else {
            losses
                .iter()
                .fold((Signal::Repetition, f64::MIN), |best, (s, l)| {
                    if *l > best.1 { (*s, *l) } else { best }
                })
                .0
        };

        QualityAssessment {
            score: score.clamp(0.0, 1.0),
            signals,
            dominant,
        }
    }

    /// Score every eligible candidate in place.
    ///
    /// Only fetched candidates are touched. PDFs bypass scoring when the
    /// exemption is on; `pre_filter_length` is recorded either way.
    #[instrument(skip_all, fields(candidates = candidates.len(), threshold = self.threshold))]
    pub fn filter_all(&self, candidates: &mut [Candidate]) -> FilterReport {
        let mut report = FilterReport::default();

        for candidate in candidates.iter_mut().filter(|c| c.fetch_succeeded) {
            candidate.pre_filter_length = Some(candidate.extracted_content_length);

            if candidate.is_pdf && self.pdf_exempt {
                report.pdf_exempted += 1;
                candidate.set_meta("filter_exempt", "pdf");
                debug!(url = %candidate.source_url, "pdf exempt from garbage filter");
                continue;
            }

            report.evaluated += 1;
            let text = candidate.extracted_content.as_deref().unwrap_or_default();
            if text.trim().is_empty() {
                warn!(url = %candidate.source_url, "fetched candidate reached the filter with no text");
                candidate.quality_score = Some(0.0);
                candidate.garbage_filtered = true;
                candidate.filter_reason = Some("no extractable text".to_string());
                report.filtered += 1;
                report
                    .notes
                    .push(format!("{}: no extractable text", candidate.source_url));
                continue;
            }

            let assessment = self.assess(text, &candidate.domain());
            candidate.quality_score = Some(round3(assessment.score));
            candidate.set_meta(
                "quality_signals",
                serde_json::to_value(assessment.signals).unwrap_or_default(),
            );

            if assessment.score < self.threshold {
                let reason = assessment.reason(self.threshold);
                debug!(url = %candidate.source_url, %reason, "candidate filtered");
                report.notes.push(format!("{}: {reason}", candidate.source_url));
                candidate.garbage_filtered = true;
                candidate.filter_reason = Some(reason);
                report.filtered += 1;
            }
        }

        info!(
            evaluated = report.evaluated,
            filtered = report.filtered,
            pdf_exempted = report.pdf_exempted,
            "garbage filter complete"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Larger of the duplicate-line ratio and the repeated-shingle ratio.
fn repetition_ratio(lines: &[&str], words: &[&str]) -> f64 {
    let line_ratio = if lines.len() < 2 {
        0.0
    } else {
        let unique: HashSet<String> = lines.iter().map(|l| l.to_lowercase()).collect();
        1.0 - unique.len() as f64 / lines.len() as f64
    };

    let shingle_ratio = if words.len() < SHINGLE_SIZE * 2 {
        0.0
    } else {
        let lowered: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
        let shingles: Vec<&[String]> = lowered.windows(SHINGLE_SIZE).collect();
        let unique: HashSet<&[String]> = shingles.iter().copied().collect();
        1.0 - unique.len() as f64 / shingles.len() as f64
    };

    line_ratio.max(shingle_ratio).clamp(0.0, 1.0)
}

/// Share of lines that look like navigation or site furniture.
fn boilerplate_density(lines: &[&str]) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    let flagged = lines
        .iter()
        .filter(|line| {
            let lower = line.to_lowercase();
            if BOILERPLATE_PHRASES.iter().any(|p| lower.contains(p)) {
                return true;
            }
            if line.starts_with('#') || line.starts_with('|') {
                return false;
            }
            let word_count = line.split_whitespace().count();
            let terminal = line.ends_with(['.', '!', '?', ':', ';', '"', ')']);
            word_count <= 3 && !terminal
        })
        .count();
    flagged as f64 / lines.len() as f64
}

/// Promotional keyword density, or shouting, whichever is worse.
fn spam_density(text: &str, words: &[&str]) -> f64 {
    if words.is_empty() {
        return 0.0;
    }
    let hits = SPAM_RE.find_iter(text).count() + text.matches("!!!").count();
    let per_100 = hits as f64 * 100.0 / words.len() as f64;
    let keyword_score = (per_100 / SPAM_SATURATION_PER_100).min(1.0);

    let long_words: Vec<&&str> = words
        .iter()
        .filter(|w| w.chars().filter(|c| c.is_alphabetic()).count() >= 4)
        .collect();
    let shouting = if long_words.len() < 10 {
        0.0
    } else {
        let caps = long_words
            .iter()
            .filter(|w| {
                w.chars()
                    .filter(|c| c.is_alphabetic())
                    .all(char::is_uppercase)
            })
            .count();
        let ratio = caps as f64 / long_words.len() as f64;
        // Acronyms are normal; sustained caps are not.
        ((ratio - 0.15) / 0.35).clamp(0.0, 1.0)
    };

    keyword_score.max(shouting)
}

/// Reputation prior for a host.
pub fn domain_prior(domain: &str) -> f64 {
    let domain = domain.trim_start_matches("www.");
    let matches = |suffix: &&str| {
        if let Some(bare) = suffix.strip_prefix('.') {
            domain.ends_with(*suffix) || domain == bare
        } else {
            domain == *suffix || domain.ends_with(&format!(".{suffix}"))
        }
    };
    if TRUSTED_SUFFIXES.iter().any(matches) {
        PRIOR_TRUSTED
    } else if LOW_REPUTATION_SUFFIXES.iter().any(matches) {
        PRIOR_LOW
    } else {
        PRIOR_DEFAULT
    }
}

/// Negative log of a goodness value, floored so a zero stays finite.
fn loss(goodness: f64) -> f64 {
    -goodness.clamp(MIN_GOODNESS, 1.0).ln()
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}
