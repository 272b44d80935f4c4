//! Document segmentation
//!
//! Turns a document into the indexed chunk list every later stage works on.
//! A cheap rule-based splitter handles most text; paragraphs whose fragments
//! look wrong are re-split by a pluggable fallback (LLM, embedding, or
//! statistical).

pub mod fallback;
pub mod paragraph;
pub mod segmenter;
pub mod sentence;
pub mod suspicion;

pub use fallback::{
    enforce_contract, parse_sentences, EmbeddingCoherenceFallback, FallbackError, LlmTokenizer,
    SegmentationFallback, StatisticalFallback, DEFAULT_TOKENIZER_TASK,
};
pub use paragraph::{split_paragraphs, Paragraph, ParagraphKind};
pub use segmenter::{
    FallbackRecord, SegmentError, Segmentation, Segmenter, DEFAULT_PARAGRAPH_CONCURRENCY,
};
pub use sentence::{split_sentence_spans, split_sentences};
pub use suspicion::{PolicyError, SuspicionPolicy, SuspicionReason, SuspicionReport};

use crate::chunk::Chunk;

/// Drop every whitespace character.
///
/// Segmentation preserves text up to whitespace: comparing normalized forms
/// is how reconstruction is checked.
pub fn normalize_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Join chunks back into document text.
///
/// Chunks in one paragraph are joined by a space, paragraphs by a newline.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    let mut last_paragraph: Option<usize> = None;
    for chunk in chunks {
        match last_paragraph {
            Some(p) if p == chunk.paragraph_index => out.push(' '),
            Some(_) => out.push('\n'),
            None => {}
        }
        out.push_str(&chunk.content);
        last_paragraph = Some(chunk.paragraph_index);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_removes_all_whitespace() {
        assert_eq!(normalize_whitespace(" a b\n\tc "), "abc");
    }

    #[test]
    fn reconstruct_joins_by_paragraph() {
        let chunks = vec![
            Chunk::new(0, 0, 0, "One."),
            Chunk::new(1, 0, 1, "Two."),
            Chunk::new(2, 1, 0, "Three."),
        ];
        assert_eq!(reconstruct(&chunks), "One. Two.\nThree.");
    }
}
