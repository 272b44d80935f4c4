//! Fallback tokenizers for paragraphs the fast splitter got wrong
//!
//! Three interchangeable strategies behind one trait:
//! - `LlmTokenizer`: asks an LLM to split the paragraph
//! - `EmbeddingCoherenceFallback`: merges adjacent fragments that read as one unit
//! - `StatisticalFallback`: merges anomalous fragments into their neighbours
//!
//! Whatever a strategy returns goes through [`enforce_contract`] before use.

use super::sentence::{citation_marker_len, split_sentence_spans};
use super::suspicion::{has_markup_prefix, is_standalone_marker, SuspicionPolicy};
use crate::embedding::{cosine_similarity, Embedder, EmbeddingError};
use crate::llm::{extract_json, LlmClient, LlmError};
use async_trait::async_trait;
use std::ops::Range;
use std::sync::Arc;

/// Default LLM task name for sentence tokenization.
pub const DEFAULT_TOKENIZER_TASK: &str = "sentence-tokenizer";

const TOKENIZER_INSTRUCTIONS: &str = "Split the paragraph into sentences. \
Return JSON of the form {\"sentences\": [\"...\"]}. Every character of the \
paragraph must appear in exactly one sentence, in order, unchanged. Keep \
citation markers such as [1] or (Smith, 2020) with the sentence they belong \
to. Never split inside a bibliographic reference entry.";

/// Errors from a fallback tokenizer.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("fallback unavailable: {0}")]
    Unavailable(String),

    #[error("llm call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("unparsable tokenizer output: {0}")]
    Unparsable(String),

    #[error("chunks do not reconstruct the paragraph (diverged at char {position})")]
    Reconstruction { position: usize },

    #[error("fallback task failed: {0}")]
    Task(String),
}

/// A strategy for re-splitting one suspicious paragraph.
#[async_trait]
pub trait SegmentationFallback: Send + Sync {
    fn name(&self) -> &str;

    /// Split `paragraph` into chunks. Output is validated by the caller.
    async fn tokenize(&self, paragraph: &str) -> Result<Vec<String>, FallbackError>;
}

/// Map `pieces` onto `paragraph` as exact byte spans.
///
/// Comparison ignores whitespace, so a piece may differ from the source only
/// in spacing. Fails if the pieces, in order, do not cover every
/// non-whitespace character of the paragraph.
fn align_pieces<S: AsRef<str>>(
    paragraph: &str,
    pieces: &[S],
) -> Result<Vec<Range<usize>>, FallbackError> {
    let source: Vec<(usize, char)> = paragraph.char_indices().collect();
    let mut cursor = 0usize;
    let mut matched = 0usize;
    let mut spans = Vec::new();

    let skip_ws = |mut i: usize| {
        while i < source.len() && source[i].1.is_whitespace() {
            i += 1;
        }
        i
    };

    for piece in pieces {
        let wanted: Vec<char> = piece
            .as_ref()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if wanted.is_empty() {
            continue;
        }
        cursor = skip_ws(cursor);
        let start = cursor;
        for c in wanted {
            cursor = skip_ws(cursor);
            match source.get(cursor) {
                Some((_, s)) if *s == c => {
                    cursor += 1;
                    matched += 1;
                }
                _ => return Err(FallbackError::Reconstruction { position: matched }),
            }
        }
        let byte_start = source[start].0;
        let byte_end = source.get(cursor).map(|(b, _)| *b).unwrap_or(paragraph.len());
        spans.push(byte_start..byte_end);
    }

    if skip_ws(cursor) < source.len() {
        return Err(FallbackError::Reconstruction { position: matched });
    }
    Ok(spans)
}

/// Validate and normalise fallback output against its paragraph.
///
/// Returns exact substrings of `paragraph`: empty pieces dropped, and a
/// standalone citation marker joined to the chunk before it (or after it,
/// when it leads).
pub fn enforce_contract<S: AsRef<str>>(
    paragraph: &str,
    pieces: &[S],
) -> Result<Vec<String>, FallbackError> {
    let spans = align_pieces(paragraph, pieces)?;

    let mut merged: Vec<Range<usize>> = Vec::with_capacity(spans.len());
    let mut pending_lead: Option<usize> = None;
    for span in spans {
        let text = &paragraph[span.clone()];
        if is_standalone_marker(text) {
            match merged.last_mut() {
                Some(prev) => prev.end = span.end,
                None => {
                    pending_lead.get_or_insert(span.start);
                }
            }
            continue;
        }
        let start = pending_lead.take().unwrap_or(span.start);
        merged.push(start..span.end);
    }
    if let Some(start) = pending_lead {
        // nothing but markers
        merged.push(start..paragraph.trim_end().len());
    }

    Ok(merged
        .into_iter()
        .map(|span| paragraph[span].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Fallback that asks an LLM to split the paragraph.
pub struct LlmTokenizer {
    client: Arc<dyn LlmClient>,
    task: String,
}

impl LlmTokenizer {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self {
            client,
            task: DEFAULT_TOKENIZER_TASK.to_string(),
        }
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }
}

/// Read the sentence list out of a tokenizer reply.
///
/// Accepts `{"sentences": [...]}` or a bare array of strings.
pub fn parse_sentences(reply: &str) -> Result<Vec<String>, FallbackError> {
    let value = extract_json(reply)
        .ok_or_else(|| FallbackError::Unparsable("no JSON found in reply".to_string()))?;
    let list = match &value {
        serde_json::Value::Array(_) => &value,
        serde_json::Value::Object(map) => map.get("sentences").ok_or_else(|| {
            FallbackError::Unparsable("reply has no 'sentences' field".to_string())
        })?,
        _ => return Err(FallbackError::Unparsable("reply is not a list".to_string())),
    };
    serde_json::from_value::<Vec<String>>(list.clone())
        .map_err(|e| FallbackError::Unparsable(e.to_string()))
}

#[async_trait]
impl SegmentationFallback for LlmTokenizer {
    fn name(&self) -> &str {
        "llm"
    }

    async fn tokenize(&self, paragraph: &str) -> Result<Vec<String>, FallbackError> {
        if !self.client.is_available().await {
            return Err(FallbackError::Unavailable(format!(
                "llm backend for task '{}' is not reachable",
                self.task
            )));
        }
        let payload = serde_json::json!({
            "instructions": TOKENIZER_INSTRUCTIONS,
            "paragraph": paragraph,
        })
        .to_string();

        let response = self.client.complete(&self.task, &payload).await?;
        parse_sentences(&response.text)
    }
}

/// Fallback that re-joins fast-split fragments which belong together.
///
/// Adjacent fragments merge when they are semantically close, or when
/// either side is too short to stand alone.
pub struct EmbeddingCoherenceFallback {
    embedder: Arc<dyn Embedder>,
    similarity_threshold: f32,
    min_len: usize,
}

impl EmbeddingCoherenceFallback {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            similarity_threshold: 0.85,
            min_len: 20,
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_min_len(mut self, min_len: usize) -> Self {
        self.min_len = min_len;
        self
    }
}

#[async_trait]
impl SegmentationFallback for EmbeddingCoherenceFallback {
    fn name(&self) -> &str {
        "embedding"
    }

    async fn tokenize(&self, paragraph: &str) -> Result<Vec<String>, FallbackError> {
        let spans = split_sentence_spans(paragraph);
        if spans.len() < 2 {
            return Ok(spans.into_iter().map(|s| paragraph[s].to_string()).collect());
        }

        let texts: Vec<String> = spans.iter().map(|s| paragraph[s.clone()].to_string()).collect();
        let embedder = Arc::clone(&self.embedder);
        let batch = texts.clone();
        let vectors = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = batch.iter().map(String::as_str).collect();
            embedder.embed_batch(&refs)
        })
        .await
        .map_err(|e| FallbackError::Task(e.to_string()))??;

        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                actual: vectors.len(),
            }
            .into());
        }

        let short = |text: &str| text.chars().count() < self.min_len;
        let mut groups: Vec<Range<usize>> = vec![spans[0].clone()];
        for i in 1..spans.len() {
            let Some(current) = groups.last_mut() else {
                break;
            };
            let similar = cosine_similarity(&vectors[i - 1], &vectors[i]) >= self.similarity_threshold;
            if similar || short(&texts[i]) || short(&paragraph[current.clone()]) {
                current.end = spans[i].end;
            } else {
                groups.push(spans[i].clone());
            }
        }

        Ok(groups.into_iter().map(|g| paragraph[g].to_string()).collect())
    }
}

/// Fallback that needs no model: merges anomalous fragments into neighbours.
///
/// A fragment is anomalous when it is very short, a short parenthetical, a
/// standalone marker, or opens with markup. It joins the fragment before it;
/// the first fragment joins the one after.
pub struct StatisticalFallback {
    policy: SuspicionPolicy,
}

impl StatisticalFallback {
    pub fn new(policy: SuspicionPolicy) -> Self {
        Self { policy }
    }

    fn is_anomalous(&self, fragment: &str) -> bool {
        self.policy.is_very_short(fragment)
            || self.policy.is_parenthetical(fragment)
            || is_standalone_marker(fragment)
            || has_markup_prefix(fragment)
            || citation_marker_len(fragment).is_some()
    }
}

impl Default for StatisticalFallback {
    fn default() -> Self {
        Self::new(SuspicionPolicy::default())
    }
}

#[async_trait]
impl SegmentationFallback for StatisticalFallback {
    fn name(&self) -> &str {
        "statistical"
    }

    async fn tokenize(&self, paragraph: &str) -> Result<Vec<String>, FallbackError> {
        let mut spans = split_sentence_spans(paragraph);
        while spans.len() > 1 {
            let Some(i) = spans
                .iter()
                .position(|s| self.is_anomalous(&paragraph[s.clone()]))
            else {
                break;
            };
            if i == 0 {
                let next = spans.remove(1);
                spans[0].end = next.end;
            } else {
                let this = spans.remove(i);
                spans[i - 1].end = this.end;
            }
        }
        Ok(spans.into_iter().map(|s| paragraph[s].to_string()).collect())
    }
}
