//! Fixed-size chunking of oversized documents.

use corpus_shared::ChunkSpan;

/// Split `text` into non-overlapping spans of `chunk_chars` characters when
/// it is longer than `threshold_chars`. Returns no spans for shorter text.
///
/// Spans cover the whole text in order and always fall on char boundaries.
pub fn chunk_spans(text: &str, threshold_chars: usize, chunk_chars: usize) -> Vec<ChunkSpan> {
    let chunk_chars = chunk_chars.max(1);
    if text.chars().count() <= threshold_chars {
        return Vec::new();
    }

    let mut spans = Vec::new();
    let mut start = 0;
    let mut count = 0;

    for (offset, _) in text.char_indices() {
        if count == chunk_chars {
            spans.push(ChunkSpan {
                index: spans.len(),
                start,
                end: offset,
            });
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        spans.push(ChunkSpan {
            index: spans.len(),
            start,
            end: text.len(),
        });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_not_chunked() {
        assert!(chunk_spans("short", 10, 3).is_empty());
        assert!(chunk_spans("exactly10!", 10, 3).is_empty());
    }

    #[test]
    fn spans_cover_text_in_order() {
        let text = "abcdefghij";
        let spans = chunk_spans(text, 5, 4);
        let pieces: Vec<&str> = spans.iter().map(|s| &text[s.start..s.end]).collect();
        assert_eq!(pieces, vec!["abcd", "efgh", "ij"]);
        assert_eq!(
            spans.iter().map(|s| s.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn multibyte_boundaries_are_respected() {
        let text = "ééééé";
        let spans = chunk_spans(text, 2, 2);
        let pieces: Vec<&str> = spans.iter().map(|s| &text[s.start..s.end]).collect();
        assert_eq!(pieces, vec!["éé", "éé", "é"]);
    }

    #[test]
    fn large_document_uses_fixed_size() {
        let text = "x".repeat(250_001);
        let spans = chunk_spans(&text, 250_000, 100_000);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].end - spans[0].start, 100_000);
        assert_eq!(spans[2].end, text.len());
    }
}
