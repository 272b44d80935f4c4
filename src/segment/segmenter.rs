//! Hybrid segmentation: fast split, score, fall back where suspicious

use super::fallback::{enforce_contract, SegmentationFallback, StatisticalFallback};
use super::paragraph::{split_paragraphs, Paragraph};
use super::sentence::split_sentences;
use super::suspicion::{PolicyError, SuspicionPolicy, SuspicionReport};
use crate::chunk::Chunk;
use crate::executor::fan_out;
use serde::Serialize;
use std::sync::Arc;

/// Default number of paragraphs re-split concurrently.
pub const DEFAULT_PARAGRAPH_CONCURRENCY: usize = 4;

/// Errors that abort segmentation.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("invalid suspicion policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("{fallback} fallback failed on paragraph {paragraph_index}: {message}")]
    Fallback {
        fallback: String,
        paragraph_index: usize,
        message: String,
    },
}

/// A paragraph that was handed to the fallback.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackRecord {
    pub paragraph_index: usize,
    pub report: SuspicionReport,
    /// Fragments the fast splitter produced
    pub fast_fragments: usize,
    /// Chunks the fallback produced
    pub chunks: usize,
}

/// Output of one segmentation pass.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub chunks: Vec<Chunk>,
    pub paragraph_count: usize,
    pub fallbacks: Vec<FallbackRecord>,
}

/// Splits a document into indexed chunks.
pub struct Segmenter {
    policy: SuspicionPolicy,
    fallback: Arc<dyn SegmentationFallback>,
    paragraph_concurrency: usize,
}

impl Segmenter {
    pub fn new(
        policy: SuspicionPolicy,
        fallback: Arc<dyn SegmentationFallback>,
    ) -> Result<Self, SegmentError> {
        policy.validate()?;
        Ok(Self {
            policy,
            fallback,
            paragraph_concurrency: DEFAULT_PARAGRAPH_CONCURRENCY,
        })
    }

    /// Default policy with the model-free statistical fallback.
    pub fn statistical() -> Self {
        Self {
            policy: SuspicionPolicy::default(),
            fallback: Arc::new(StatisticalFallback::default()),
            paragraph_concurrency: DEFAULT_PARAGRAPH_CONCURRENCY,
        }
    }

    pub fn with_paragraph_concurrency(mut self, limit: usize) -> Self {
        self.paragraph_concurrency = limit.max(1);
        self
    }

    pub fn policy(&self) -> &SuspicionPolicy {
        &self.policy
    }

    pub fn fallback_name(&self) -> &str {
        self.fallback.name()
    }

    /// Fast-split one paragraph. Non-prose paragraphs come back whole.
    pub fn fast_split(&self, paragraph: &Paragraph) -> Vec<String> {
        if paragraph.kind.is_splittable() {
            split_sentences(&paragraph.text)
        } else {
            vec![paragraph.text.clone()]
        }
    }

    /// Segment `document` into chunks with dense indices.
    ///
    /// Any fallback failure aborts the whole pass: a partial chunk list would
    /// shift every later index.
    pub async fn segment(&self, document: &str) -> Result<Segmentation, SegmentError> {
        let paragraphs = split_paragraphs(document);
        let mut pieces: Vec<Vec<String>> = Vec::with_capacity(paragraphs.len());
        let mut suspicious: Vec<(usize, SuspicionReport, usize)> = Vec::new();

        for paragraph in &paragraphs {
            let fragments = self.fast_split(paragraph);
            if paragraph.kind.is_splittable() {
                let report = self.policy.score(&fragments);
                if report.triggered() {
                    tracing::debug!(
                        paragraph = paragraph.index,
                        score = report.score,
                        "Paragraph flagged for fallback segmentation"
                    );
                    suspicious.push((paragraph.index, report, fragments.len()));
                }
            }
            pieces.push(fragments);
        }

        let mut fallbacks = Vec::with_capacity(suspicious.len());
        if !suspicious.is_empty() {
            let items: Vec<String> = suspicious
                .iter()
                .map(|(index, _, _)| paragraphs[*index].text.clone())
                .collect();
            let fallback = Arc::clone(&self.fallback);
            let outcomes = fan_out(items, self.paragraph_concurrency, move |text: String| {
                let fallback = Arc::clone(&fallback);
                async move {
                    let raw = fallback.tokenize(&text).await?;
                    enforce_contract(&text, &raw)
                }
            })
            .await;

            for ((index, report, fast_fragments), outcome) in suspicious.into_iter().zip(outcomes) {
                let chunks = outcome.map_err(|e| SegmentError::Fallback {
                    fallback: self.fallback.name().to_string(),
                    paragraph_index: index,
                    message: e.message,
                })?;
                fallbacks.push(FallbackRecord {
                    paragraph_index: index,
                    report,
                    fast_fragments,
                    chunks: chunks.len(),
                });
                pieces[index] = chunks;
            }
        }

        let mut chunks = Vec::new();
        for (paragraph_index, paragraph_pieces) in pieces.into_iter().enumerate() {
            for (within, content) in paragraph_pieces.into_iter().enumerate() {
                chunks.push(Chunk::new(chunks.len(), paragraph_index, within, content));
            }
        }

        tracing::info!(
            paragraphs = paragraphs.len(),
            chunks = chunks.len(),
            fallbacks = fallbacks.len(),
            fallback = self.fallback.name(),
            "Segmented document"
        );

        Ok(Segmentation {
            chunks,
            paragraph_count: paragraphs.len(),
            fallbacks,
        })
    }
}
