//! Post-conversion cleanup pipeline for extracted prose.
//!
//! Each pass is a function `&str -> String` applied in sequence. The output
//! feeds the quality filter and the model cleaner, so link targets, images
//! and menu residue are removed rather than resolved.

use std::sync::LazyLock;

use regex::Regex;

static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("valid regex"));

static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));

/// Run the full cleanup pipeline on raw Markdown text.
pub(crate) fn run_pipeline(md: &str) -> String {
    let mut result = md.replace('\u{a0}', " ");

    result = strip_images(&result);
    result = drop_link_runs(&result);
    result = unwrap_links(&result);
    result = normalize_headings(&result);
    result = strip_leftover_html(&result);
    result = drop_consecutive_duplicates(&result);
    result = normalize_whitespace(&result);
    result = clean_blank_lines(&result);
    result = ensure_trailing_newline(&result);

    result
}

// ---------------------------------------------------------------------------
// Pass 1: Images
// ---------------------------------------------------------------------------

fn strip_images(md: &str) -> String {
    IMAGE_RE.replace_all(md, "").to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Menu residue
// ---------------------------------------------------------------------------

/// Drop lines that are nothing but links: nav menus, breadcrumbs, tag clouds.
///
/// A line qualifies when it holds at least one link and no text outside its
/// links, and is either a short list item or carries two or more links.
fn drop_link_runs(md: &str) -> String {
    md.lines()
        .filter(|line| {
            let links = LINK_RE.find_iter(line).count();
            if links == 0 {
                return true;
            }
            let residue = LINK_RE.replace_all(line, "");
            let has_text = residue.chars().any(char::is_alphanumeric);
            if has_text {
                return true;
            }
            let trimmed = line.trim_start();
            let is_list_item = trimmed.starts_with("* ")
                || trimmed.starts_with("- ")
                || trimmed.starts_with("+ ");
            let anchor_words: usize = LINK_RE
                .captures_iter(line)
                .map(|c| c[1].split_whitespace().count())
                .sum();
            !(links >= 2 || (is_list_item && anchor_words <= 3))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Pass 3: Links → anchor text
// ---------------------------------------------------------------------------

fn unwrap_links(md: &str) -> String {
    LINK_RE.replace_all(md, "$1").to_string()
}

// ---------------------------------------------------------------------------
// Pass 4: Headings
// ---------------------------------------------------------------------------

/// Keep at most one H1 and drop headings with no text.
fn normalize_headings(md: &str) -> String {
    static H_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(#{1,6})(?:\s+(.*))?$").expect("valid regex"));

    let mut h1_count = 0;
    let mut lines: Vec<String> = Vec::new();

    for line in md.lines() {
        let Some(caps) = H_RE.captures(line) else {
            lines.push(line.to_string());
            continue;
        };
        let hashes = &caps[1];
        let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

        if text.is_empty() {
            continue;
        }
        if hashes == "#" {
            h1_count += 1;
            if h1_count > 1 {
                lines.push(format!("## {text}"));
                continue;
            }
        }
        lines.push(format!("{hashes} {text}"));
    }

    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Pass 5: Leftover HTML
// ---------------------------------------------------------------------------

/// Remove stray HTML tags outside fenced code, keeping their inner text.
fn strip_leftover_html(md: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"</?[a-zA-Z][a-zA-Z0-9-]*(?:\s[^<>]*)?/?>").expect("valid regex")
    });

    let mut out: Vec<String> = Vec::new();
    let mut in_code_block = false;

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
            out.push(line.to_string());
        } else if in_code_block {
            out.push(line.to_string());
        } else {
            out.push(HTML_TAG_RE.replace_all(line, "").to_string());
        }
    }

    out.join("\n")
}

// ---------------------------------------------------------------------------
// Pass 6: Repeated lines
// ---------------------------------------------------------------------------

/// Collapse identical adjacent non-blank lines (converter artifacts).
fn drop_consecutive_duplicates(md: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut last_text: Option<&str> = None;

    for line in md.lines() {
        let t = line.trim();
        if t.is_empty() {
            out.push(line);
            continue;
        }
        if last_text == Some(t) {
            continue;
        }
        last_text = Some(t);
        out.push(line);
    }

    out.join("\n")
}

// ---------------------------------------------------------------------------
// Pass 7: Whitespace
// ---------------------------------------------------------------------------

/// Trim trailing whitespace on every line.
fn normalize_whitespace(md: &str) -> String {
    md.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Collapse runs of blank lines to a single blank line.
fn clean_blank_lines(md: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    MULTI_BLANK_RE
        .replace_all(md.trim_start_matches('\n'), "\n\n")
        .to_string()
}

/// Ensure the text ends with exactly one newline.
fn ensure_trailing_newline(md: &str) -> String {
    let trimmed = md.trim_end_matches('\n');
    format!("{trimmed}\n")
}
