//! Helpers for pulling JSON out of free-form model output.
//!
//! Models wrap JSON in code fences or prose often enough that every
//! structured call goes through [`extract_json_block`] first.

use serde::de::DeserializeOwned;

use crate::ModelError;

/// Return the JSON payload embedded in `text`.
///
/// Prefers a fenced ```` ```json ```` block, then the outermost `{...}` or
/// `[...]` span. Returns `None` when nothing JSON-shaped is present.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            let inner = body[..end].trim();
            if !inner.is_empty() {
                return Some(inner);
            }
        }
    }

    let open = trimmed.find(['{', '['])?;
    let close_char = if trimmed[open..].starts_with('{') {
        '}'
    } else {
        ']'
    };
    let close = trimmed.rfind(close_char)?;
    (close > open).then(|| &trimmed[open..=close])
}

/// Extract and deserialize a JSON payload from model output.
pub fn parse_json_block<T: DeserializeOwned>(text: &str) -> Result<T, ModelError> {
    let block = extract_json_block(text)
        .ok_or_else(|| ModelError::Parse("no JSON found in model output".into()))?;
    serde_json::from_str(block).map_err(|e| ModelError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_array() {
        assert_eq!(extract_json_block(r#"["a", "b"]"#), Some(r#"["a", "b"]"#));
    }

    #[test]
    fn fenced_block() {
        let text = "Here you go:\n```json\n{\"results\": []}\n```\nThanks";
        assert_eq!(extract_json_block(text), Some("{\"results\": []}"));
    }

    #[test]
    fn prose_wrapped_object() {
        let text = "Sure! {\"a\": 1} hope this helps";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn nothing_json_shaped() {
        assert_eq!(extract_json_block("no structure here"), None);
        assert!(parse_json_block::<Vec<String>>("nope").is_err());
    }

    #[test]
    fn parse_typed() {
        let v: Vec<String> = parse_json_block("```\n[\"x\"]\n```").expect("parse");
        assert_eq!(v, vec!["x"]);
    }
}
