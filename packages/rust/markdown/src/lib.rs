//! Text extraction for fetched documents.
//!
//! HTML content fragments are converted to lightweight Markdown with `htmd`
//! and run through cleanup passes tuned for prose: links collapse to their
//! anchor text, images and menu-like link runs are dropped, and repeated
//! lines are removed. PDF text gets its own normalization in [`pdf`].

mod cleanup;
pub mod pdf;

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, instrument};

use corpus_shared::{CorpusError, Result};

pub use pdf::normalize_pdf_text;

/// Tags whose content never carries article text.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "iframe", "noscript", "svg", "form", "button", "canvas", "video",
    "audio", "template",
];

static TABLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static TR_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static CELL_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid selector"));

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Result of converting an HTML content fragment to text.
#[derive(Debug, Clone)]
pub struct ConvertResult {
    /// Cleaned Markdown-flavoured text.
    pub text: String,
    /// First H1 of the converted text, if any.
    pub title: Option<String>,
    /// Word count, excluding fenced code.
    pub word_count: usize,
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// Convert an already-isolated content fragment to clean text.
///
/// 1. Pre-processes HTML tables into Markdown tables
/// 2. Converts HTML → Markdown via `htmd`
/// 3. Runs the prose cleanup pipeline
#[instrument(skip_all, fields(html_len = content_html.len()))]
pub fn convert(content_html: &str) -> Result<ConvertResult> {
    let content_html = preprocess_tables(content_html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();

    let raw_markdown = converter
        .convert(&content_html)
        .map_err(|e| CorpusError::Conversion(format!("htmd conversion failed: {e}")))?;

    debug!(raw_len = raw_markdown.len(), "htmd conversion complete");

    let text = cleanup::run_pipeline(&raw_markdown);
    let title = extract_title(&text);
    let word_count = count_words(&text);

    debug!(word_count, final_len = text.len(), "conversion complete");

    Ok(ConvertResult {
        text,
        title,
        word_count,
    })
}

/// Count words, ignoring fenced code blocks.
pub fn count_words(text: &str) -> usize {
    static CODE_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("valid regex"));

    CODE_BLOCK_RE
        .replace_all(text, "")
        .split_whitespace()
        .filter(|w| w.chars().any(char::is_alphanumeric))
        .count()
}

// ---------------------------------------------------------------------------
// Table pre-processing
// ---------------------------------------------------------------------------

/// Replace `<table>` elements with Markdown tables; `htmd` leaves them as cell soup.
fn preprocess_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    if doc.select(&TABLE_SEL).next().is_none() {
        return html.to_string();
    }

    let mut result = html.to_string();
    for table in doc.select(&TABLE_SEL) {
        let md_table = table_to_markdown(&table);
        result = result.replacen(&table.html(), &md_table, 1);
    }
    result
}

fn table_to_markdown(table: &scraper::ElementRef) -> String {
    let mut rows: Vec<Vec<String>> = table
        .select(&TR_SEL)
        .map(|tr| {
            tr.select(&CELL_SEL)
                .map(|cell| {
                    cell.text()
                        .collect::<String>()
                        .split_whitespace()
                        .collect::<Vec<_>>()
                        .join(" ")
                        .replace('|', "\\|")
                })
                .collect::<Vec<_>>()
        })
        .filter(|r| !r.is_empty())
        .collect();

    let cols = rows.iter().map(Vec::len).max().unwrap_or(0);
    if cols == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(cols, String::new());
    }

    let mut md = String::from("\n\n");
    for (i, row) in rows.iter().enumerate() {
        md.push_str("| ");
        md.push_str(&row.join(" | "));
        md.push_str(" |\n");
        if i == 0 {
            md.push_str("| ");
            md.push_str(&vec!["---"; cols].join(" | "));
            md.push_str(" |\n");
        }
    }
    md.push('\n');
    md
}

fn extract_title(text: &str) -> Option<String> {
    static H1_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^# (.+)$").expect("valid regex"));

    H1_RE.captures(text).map(|c| c[1].trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_keeps_prose_and_headings() {
        let html = "<h1>Offshore Wind</h1><p>Capacity grew <strong>12%</strong> in 2024.</p>";
        let result = convert(html).unwrap();

        assert!(result.text.contains("# Offshore Wind"));
        assert!(result.text.contains("12%"));
        assert_eq!(result.title.as_deref(), Some("Offshore Wind"));
        assert!(result.word_count >= 6);
    }

    #[test]
    fn convert_collapses_links_and_drops_images() {
        let html = r#"<p>See the <a href="/report">annual report</a> for details.</p>
            <p><img src="chart.png" alt="chart"></p>"#;
        let result = convert(html).unwrap();

        assert!(result.text.contains("See the annual report for details."));
        assert!(!result.text.contains("]("));
        assert!(!result.text.contains("chart.png"));
    }

    #[test]
    fn convert_skips_scripts_and_forms() {
        let html = r#"<p>Body text.</p><script>track()</script>
            <form><input name="email"><button>Subscribe</button></form>"#;
        let result = convert(html).unwrap();

        assert!(result.text.contains("Body text."));
        assert!(!result.text.contains("track()"));
        assert!(!result.text.contains("Subscribe"));
    }

    #[test]
    fn convert_preserves_tables() {
        let html = r#"<table>
            <thead><tr><th>Year</th><th>GW</th></tr></thead>
            <tbody><tr><td>2023</td><td>64</td></tr><tr><td>2024</td><td>117</td></tr></tbody>
        </table>"#;
        let result = convert(html).unwrap();

        assert!(result.text.contains("| Year | GW |"));
        assert!(result.text.contains("| 2024 | 117 |"));
    }

    #[test]
    fn convert_empty_fragment() {
        let result = convert("").unwrap();
        assert_eq!(result.word_count, 0);
        assert!(result.title.is_none());
    }

    #[test]
    fn word_count_excludes_code_and_symbols() {
        assert_eq!(count_words("One two three. --- |"), 3);
        assert_eq!(count_words("Intro\n```\nlots of code here\n```\nEnd"), 2);
    }
}
