//! Main-content isolation and page metadata for fetched HTML.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use corpus_markdown::count_words;

/// Main content selectors, most specific first.
const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "[role=\"main\"]",
    "main",
    "#content",
    ".post-content",
    ".entry-content",
    ".article-body",
    ".article-content",
    "#main",
];

/// A content container is trusted when it carries at least this many words.
const MIN_CONTAINER_WORDS: usize = 50;

/// Chrome removed from any content container.
const CHROME_SELECTOR: &str = "nav, aside, script, style, noscript, form, iframe, \
     .sidebar, .nav, .menu, .breadcrumb, .breadcrumbs, .share, .social, .related, \
     .comments, #comments, .cookie, .cookie-banner, .newsletter, .advertisement, \
     [role=\"navigation\"], [aria-hidden=\"true\"]";

/// Extra chrome stripped when falling back to `<body>`; page headers and
/// footers would otherwise swamp the text.
const BODY_CHROME_SELECTOR: &str = "header, footer, [role=\"banner\"], [role=\"contentinfo\"]";

/// Phrases that mark a truncated subscriber-only body.
const PAYWALL_MARKERS: &[&str] = &[
    "subscribe to continue reading",
    "subscribe to read",
    "this article is for subscribers",
    "already a subscriber",
    "to continue reading, please",
    "sign in to continue reading",
    "create a free account to continue",
    "you have reached your free article limit",
    "this content is for members only",
];

/// Bodies at least this long are kept even when a paywall marker appears.
const PAYWALL_MAX_WORDS: usize = 250;

static CHROME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(CHROME_SELECTOR).expect("valid selector"));
static BODY_CHROME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(BODY_CHROME_SELECTOR).expect("valid selector"));
static BODY_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("body").expect("valid selector"));
static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static HTML_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("html").expect("valid selector"));
static TIME_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("time[datetime]").expect("valid selector"));
static PAYWALL_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(".paywall, #paywall, [class*=\"paywall\"], [data-paywall]")
        .expect("valid selector")
});

/// Content fragment and metadata pulled from an HTML page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    /// HTML of the main content with chrome removed.
    pub content_html: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_date: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub language: Option<String>,
    /// Which selector won, for debugging extraction quality.
    pub content_selector: &'static str,
}

/// Isolate main content and read page metadata.
pub fn extract_page(html: &str) -> ExtractedPage {
    let doc = Html::parse_document(html);

    let (content_html, content_selector) = select_content(&doc);
    debug!(content_selector, content_len = content_html.len(), "content isolated");

    ExtractedPage {
        content_html,
        title: meta_content(&doc, "property", "og:title")
            .or_else(|| first_text(&doc, &TITLE_SEL))
            .or_else(|| first_text(&doc, &H1_SEL)),
        author: meta_content(&doc, "name", "author")
            .or_else(|| meta_content(&doc, "property", "article:author")),
        published_date: meta_content(&doc, "property", "article:published_time")
            .or_else(|| meta_content(&doc, "name", "date"))
            .or_else(|| {
                doc.select(&TIME_SEL)
                    .next()
                    .and_then(|t| t.value().attr("datetime"))
                    .map(|s| s.trim().to_string())
            }),
        description: meta_content(&doc, "name", "description")
            .or_else(|| meta_content(&doc, "property", "og:description")),
        site_name: meta_content(&doc, "property", "og:site_name"),
        language: doc
            .select(&HTML_SEL)
            .next()
            .and_then(|h| h.value().attr("lang"))
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
        content_selector,
    }
}

/// Look for subscriber-wall signatures in a page whose extracted text is thin.
///
/// Returns the matched signal.
pub fn detect_paywall(html: &str, extracted_words: usize) -> Option<String> {
    if extracted_words >= PAYWALL_MAX_WORDS {
        return None;
    }
    let doc = Html::parse_document(html);
    if doc.select(&PAYWALL_SEL).next().is_some() {
        return Some("paywall container in page".to_string());
    }

    let text = doc
        .root_element()
        .text()
        .collect::<String>()
        .to_lowercase();
    PAYWALL_MARKERS
        .iter()
        .find(|m| text.contains(*m))
        .map(|m| format!("body marker \"{m}\""))
}

fn select_content(doc: &Html) -> (String, &'static str) {
    let mut best: Option<(String, &'static str, usize)> = None;

    for sel_str in CONTENT_SELECTORS {
        let Ok(sel) = Selector::parse(sel_str) else {
            continue;
        };
        let Some(el) = doc.select(&sel).next() else {
            continue;
        };
        let html = strip_chrome(&el, &CHROME_SEL);
        let words = fragment_words(&html);
        if words >= MIN_CONTAINER_WORDS {
            return (html, sel_str);
        }
        if best.as_ref().is_none_or(|(_, _, w)| words > *w) {
            best = Some((html, sel_str, words));
        }
    }

    if let Some(body) = doc.select(&BODY_SEL).next() {
        let stripped = strip_chrome(&body, &CHROME_SEL);
        let stripped = strip_chrome_html(&stripped, &BODY_CHROME_SEL);
        let body_words = fragment_words(&stripped);
        if best.as_ref().is_none_or(|(_, _, w)| body_words > *w) {
            return (stripped, "body");
        }
    }

    match best {
        Some((html, sel, _)) => (html, sel),
        None => (doc.root_element().inner_html(), "document"),
    }
}

/// Remove every element matching `chrome` from `el`'s inner HTML.
fn strip_chrome(el: &ElementRef, chrome: &Selector) -> String {
    let mut html = el.inner_html();
    for node in el.select(chrome) {
        let outer = node.html();
        html = html.replacen(&outer, "", 1);
    }
    html
}

fn strip_chrome_html(fragment: &str, chrome: &Selector) -> String {
    let doc = Html::parse_fragment(fragment);
    let mut html = fragment.to_string();
    for node in doc.select(chrome) {
        html = html.replacen(&node.html(), "", 1);
    }
    html
}

fn fragment_words(fragment: &str) -> usize {
    let doc = Html::parse_fragment(fragment);
    count_words(&doc.root_element().text().collect::<Vec<_>>().join(" "))
}

fn meta_content(doc: &Html, attr: &str, value: &str) -> Option<String> {
    let sel = Selector::parse(&format!("meta[{attr}=\"{value}\"]")).ok()?;
    doc.select(&sel)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_text(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join(" "))
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|s| !s.is_empty())
}
