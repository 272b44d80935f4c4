//! Shared stages and fixtures for the integration tests
//!
//! The stages are deliberately small: they exist to exercise the controller
//! (dependencies, eligibility, failures), not to analyze anything.

#![allow(dead_code)]

use async_trait::async_trait;
use chunkwise::chunk::InputError;
use chunkwise::checkpoint::CheckpointResult;
use chunkwise::{
    CheckpointError, CheckpointMeta, CheckpointStore, Chunk, ChunkStage, ChunkText, DocumentRef,
    DocumentStage, ExecutorConfig, InMemoryCheckpointStore, RunConfig, Segmenter, StageContext,
    StageController, StageError, StageInput, StageRegistry, StageStatus, WorkflowState,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Splits a chunk into "claims" (its words longer than three chars).
///
/// Fails for chunks whose content contains `FAIL`.
#[derive(Default)]
pub struct ClaimExtractor {
    pub seen: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl ChunkStage for ClaimExtractor {
    type Input = ChunkText;
    type Output = Vec<String>;

    fn id(&self) -> &str {
        "claims"
    }

    fn writes(&self) -> &str {
        "claims"
    }

    async fn process(&self, input: ChunkText, _ctx: &StageContext) -> Result<Vec<String>, StageError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(input.chunk_index);
        }
        if input.content.contains("FAIL") {
            return Err(StageError::failed(format!(
                "cannot extract claims from chunk {}",
                input.chunk_index
            )));
        }
        Ok(input
            .content
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
            .collect())
    }
}

/// Collects `[n]` citation markers of a chunk.
pub struct CitationFinder;

#[async_trait]
impl ChunkStage for CitationFinder {
    type Input = ChunkText;
    type Output = Vec<u32>;

    fn id(&self) -> &str {
        "citations"
    }

    fn writes(&self) -> &str {
        "citations"
    }

    async fn process(&self, input: ChunkText, _ctx: &StageContext) -> Result<Vec<u32>, StageError> {
        Ok(input
            .content
            .split('[')
            .skip(1)
            .filter_map(|rest| rest.split(']').next())
            .filter_map(|n| n.trim().parse().ok())
            .collect())
    }
}

pub struct ClaimsInput {
    pub claims: Vec<String>,
}

impl StageInput for ClaimsInput {
    fn reads() -> Vec<&'static str> {
        vec!["claims"]
    }

    fn extract(_state: &WorkflowState, chunk: &Chunk) -> Result<Self, InputError> {
        Ok(Self {
            claims: chunk.require("claims")?,
        })
    }
}

/// Verifies each claim through the shared sub-task pool.
#[derive(Default)]
pub struct ClaimVerifier {
    pub seen: Arc<Mutex<Vec<usize>>>,
}

#[async_trait]
impl ChunkStage for ClaimVerifier {
    type Input = ClaimsInput;
    type Output = Vec<bool>;

    fn id(&self) -> &str {
        "verify"
    }

    fn writes(&self) -> &str {
        "verdicts"
    }

    async fn process(&self, input: ClaimsInput, ctx: &StageContext) -> Result<Vec<bool>, StageError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(input.claims.len());
        }
        let verdicts = ctx
            .sub_tasks()
            .run(input.claims, |claim: String| async move {
                Ok::<bool, String>(claim.chars().next().is_some_and(|c| c.is_uppercase()))
            })
            .await;
        verdicts
            .into_iter()
            .map(|v| v.map_err(|e| StageError::Backend(e.message)))
            .collect()
    }
}

/// Document stage: sorted, deduplicated citation numbers across chunks.
pub struct ReferenceCollector;

#[async_trait]
impl DocumentStage for ReferenceCollector {
    fn id(&self) -> &str {
        "references"
    }

    fn reads(&self) -> Vec<&str> {
        vec!["citations"]
    }

    fn writes(&self) -> &str {
        "references"
    }

    async fn run(&self, state: &WorkflowState, _ctx: &StageContext) -> Result<Value, StageError> {
        let mut all: Vec<u32> = Vec::new();
        for chunk in &state.chunks {
            if let Some(found) = chunk
                .field::<Vec<u32>>("citations")
                .map_err(|e| StageError::failed(e.to_string()))?
            {
                all.extend(found);
            }
        }
        all.sort_unstable();
        all.dedup();
        Ok(json!(all))
    }
}

/// Document stage that always fails.
pub struct BrokenSummary;

#[async_trait]
impl DocumentStage for BrokenSummary {
    fn id(&self) -> &str {
        "summary"
    }

    fn writes(&self) -> &str {
        "summary"
    }

    async fn run(&self, _state: &WorkflowState, _ctx: &StageContext) -> Result<Value, StageError> {
        Err(StageError::Backend("summary backend unavailable".to_string()))
    }
}

pub fn chunks(contents: &[&str]) -> Vec<Chunk> {
    contents
        .iter()
        .enumerate()
        .map(|(i, content)| Chunk::new(i, 0, i, *content))
        .collect()
}

pub fn state_with(contents: &[&str], run_config: RunConfig) -> WorkflowState {
    WorkflowState::new(
        DocumentRef::new("doc.md", contents.join(" ")),
        chunks(contents),
        run_config,
    )
}

pub fn five_chunk_state(session: &str) -> WorkflowState {
    state_with(
        &[
            "Alpha claims widgets work [1].",
            "Beta disputes this [2].",
            "Gamma measures widgets [1].",
            "Delta repeats Gamma.",
            "Epsilon concludes nothing [3].",
        ],
        RunConfig::for_session(session),
    )
}

pub fn controller(registry: StageRegistry, store: Arc<dyn CheckpointStore>) -> StageController {
    StageController::new(
        registry,
        ExecutorConfig::default().with_max_concurrent(3),
        store,
        Segmenter::statistical(),
    )
}

/// claims → verify, citations → references
pub fn full_registry() -> StageRegistry {
    StageRegistry::new()
        .with_chunk_stage(ClaimExtractor::default())
        .and_then(|r| r.with_chunk_stage(CitationFinder))
        .and_then(|r| r.with_chunk_stage(ClaimVerifier::default()))
        .and_then(|r| r.with_document_stage(ReferenceCollector))
        .expect("test stages register cleanly")
}

/// In-memory store that records the stage statuses of every save and can be
/// told to fail once a number of saves went through.
#[derive(Default)]
pub struct RecordingStore {
    inner: InMemoryCheckpointStore,
    fail_after: Option<usize>,
    saved: Mutex<Vec<BTreeMap<String, StageStatus>>>,
}

impl RecordingStore {
    pub fn failing_after(saves: usize) -> Self {
        Self {
            fail_after: Some(saves),
            ..Self::default()
        }
    }

    pub fn saved_statuses(&self) -> Vec<BTreeMap<String, StageStatus>> {
        self.saved.lock().map(|saved| saved.clone()).unwrap_or_default()
    }
}

impl CheckpointStore for RecordingStore {
    fn save(&self, state: &WorkflowState) -> CheckpointResult<()> {
        let mut saved = self.saved.lock().map_err(|_| CheckpointError::LockPoisoned)?;
        if self.fail_after.is_some_and(|limit| saved.len() >= limit) {
            return Err(CheckpointError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        saved.push(state.stage_status.clone());
        self.inner.save(state)
    }

    fn load(&self, session_id: &str) -> CheckpointResult<Option<WorkflowState>> {
        self.inner.load(session_id)
    }

    fn delete_session(&self, session_id: &str) -> CheckpointResult<bool> {
        self.inner.delete_session(session_id)
    }

    fn list_sessions(&self) -> CheckpointResult<Vec<String>> {
        self.inner.list_sessions()
    }

    fn history(&self, session_id: &str) -> CheckpointResult<Vec<CheckpointMeta>> {
        self.inner.history(session_id)
    }
}
