//! Source discovery: query expansion, provider fan-out, and candidate selection.
//!
//! The three stages run in order and hand plain data to each other:
//! [`QueryExpander::expand`] produces an [`ExpansionSet`](corpus_shared::ExpansionSet),
//! [`dispatch`] turns it into raw hits across every [`SearchProvider`], and
//! [`select`] merges the hits by canonical URL and picks the top K.

pub mod dispatch;
pub mod expansion;
pub mod providers;
pub mod select;

pub use dispatch::{DispatchOutcome, dispatch};
pub use expansion::{ExpansionOutcome, QueryExpander, QueryType, detect_query_type, heuristic_expand};
pub use providers::{ExaProvider, SearchProvider, TavilyProvider, providers_from_config};
pub use select::{SelectionOutcome, canonicalize_url, merge_hits, select};
