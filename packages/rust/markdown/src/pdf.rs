//! Normalization for text pulled out of PDFs.
//!
//! PDF extraction yields hard-wrapped lines, hyphenated word breaks,
//! form feeds between pages and bare page numbers. This pass rejoins
//! paragraphs so downstream chunking and cleaning see prose.

use std::sync::LazyLock;

use regex::Regex;

static PAGE_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:page\s+)?\d{1,4}(?:\s*(?:/|of)\s*\d{1,4})?$").expect("valid regex")
});

static HYPHEN_BREAK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([a-z])-\n([a-z])").expect("valid regex"));

static INNER_SPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

/// Rejoin wrapped lines into paragraphs and drop page furniture.
pub fn normalize_pdf_text(text: &str) -> String {
    let text = text
        .replace('\u{c}', "\n\n")
        .replace("\r\n", "\n")
        .replace('\u{ad}', "");

    let lines: Vec<String> = text
        .lines()
        .map(|l| INNER_SPACE_RE.replace_all(l.trim(), " ").to_string())
        .filter(|l| !PAGE_NUMBER_RE.is_match(&l.to_lowercase()))
        .collect();
    let text = lines.join("\n");

    let text = HYPHEN_BREAK_RE.replace_all(&text, "$1$2");

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    let mut out = paragraphs.join("\n\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_wrapped_lines_and_hyphenation() {
        let input = "Offshore wind capacity in-\ncreased sharply\nacross Europe.\n\nSecond para.";
        assert_eq!(
            normalize_pdf_text(input),
            "Offshore wind capacity increased sharply across Europe.\n\nSecond para.\n"
        );
    }

    #[test]
    fn drops_page_numbers_and_form_feeds() {
        let input = "End of page one.\n\n12\n\u{c}Page 3 of 10\nStart of   page two.";
        assert_eq!(
            normalize_pdf_text(input),
            "End of page one.\n\nStart of page two.\n"
        );
    }

    #[test]
    fn keeps_real_hyphenated_words() {
        let input = "A well-known result";
        assert_eq!(normalize_pdf_text(input), "A well-known result\n");
    }

    #[test]
    fn empty_input() {
        assert_eq!(normalize_pdf_text("  \n\u{c}\n"), "");
    }
}
