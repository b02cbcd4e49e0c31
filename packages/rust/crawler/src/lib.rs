//! Document acquisition for selected candidates.
//!
//! This crate provides:
//! - [`gate`] — concurrent, bounded acquisition of a candidate list
//! - [`preflight`] — host checks and the HEAD probe
//! - [`fetch`] — HTML, text and PDF download and extraction
//! - [`extract`] — main-content isolation and page metadata
//! - [`breaker`] — per-domain circuit breaker
//! - [`chunk`] — fixed-size chunking of oversized documents

pub mod breaker;
pub mod chunk;
pub mod extract;
pub mod fetch;
pub mod gate;
pub mod preflight;

pub use breaker::{DomainFailure, DomainFailureCache};
pub use chunk::chunk_spans;
pub use extract::{ExtractedPage, detect_paywall, extract_page};
pub use fetch::{FetchedDocument, fetch_document};
pub use gate::{AcquisitionGate, AcquisitionReport, FETCH_ERROR_KIND, GateConfig, build_client};
pub use preflight::{DocumentKind, Probe, check_host, denylisted, probe};
