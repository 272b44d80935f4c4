//! Session-scoped workflow state
//!
//! `WorkflowState` is the unit of persistence and of merge: the ordered chunk
//! list, document-level stage outputs, recovered errors, and the run
//! configuration that scoped the last pass.

use super::types::Chunk;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound on stored error message length, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// Truncate a message to [`MAX_ERROR_MESSAGE_CHARS`] characters.
///
/// Cuts on a char boundary and marks the cut with `...`.
pub fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_MESSAGE_CHARS {
        return message.to_string();
    }
    let mut truncated: String = message.chars().take(MAX_ERROR_MESSAGE_CHARS - 3).collect();
    truncated.push_str("...");
    truncated
}

/// A reference to a document taking part in the analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Display name or path
    pub name: String,
    /// Frozen text snapshot the chunks were cut from
    pub text: String,
}

impl DocumentRef {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }
}

/// A recovered failure, kept for observability without aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowError {
    pub task_name: String,
    pub error: String,
    /// `None` for document-level failures
    pub chunk_index: Option<usize>,
}

impl WorkflowError {
    pub fn for_chunk(task_name: impl Into<String>, chunk_index: usize, error: &str) -> Self {
        Self {
            task_name: task_name.into(),
            error: truncate_message(error),
            chunk_index: Some(chunk_index),
        }
    }

    pub fn for_document(task_name: impl Into<String>, error: &str) -> Self {
        Self {
            task_name: task_name.into(),
            error: truncate_message(error),
            chunk_index: None,
        }
    }

    pub fn is_document_level(&self) -> bool {
        self.chunk_index.is_none()
    }
}

/// Scope of one run: which chunks and which stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// `None` = every chunk
    #[serde(default)]
    pub target_chunk_indices: Option<Vec<usize>>,
    /// `None` = every stage
    #[serde(default)]
    pub agents_to_run: Option<Vec<String>>,
    pub session_id: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RunConfig {
    /// Full run under a fresh session id.
    pub fn new() -> Self {
        Self::for_session(uuid::Uuid::new_v4().to_string())
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            target_chunk_indices: None,
            agents_to_run: None,
            session_id: session_id.into(),
        }
    }

    pub fn with_targets(mut self, indices: Vec<usize>) -> Self {
        self.target_chunk_indices = Some(indices);
        self
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents_to_run = Some(agents.into_iter().map(Into::into).collect());
        self
    }

    /// Whether a stage with this id takes part in the run.
    pub fn should_run(&self, stage_id: &str) -> bool {
        match &self.agents_to_run {
            Some(agents) => agents.iter().any(|a| a == stage_id),
            None => true,
        }
    }

    pub fn is_selective(&self) -> bool {
        self.target_chunk_indices.is_some()
    }
}

/// Lifecycle of one stage invocation.
///
/// `Pending → (Skipped | Running) → (Completed | PartiallyFailed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Skipped,
    Running,
    Completed,
    PartiallyFailed,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Skipped | Self::Completed | Self::PartiallyFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Skipped => "skipped",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::PartiallyFailed => "partially_failed",
        }
    }
}

/// Violations of the chunk index invariant.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("chunk index {0} appears more than once")]
    IndexDuplicate(usize),

    #[error("chunk index {missing} is missing (have {len} chunks)")]
    IndexGap { missing: usize, len: usize },

    #[error("chunks are not sorted by index at position {0}")]
    Unsorted(usize),
}

/// The session envelope persisted by checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub document: DocumentRef,
    #[serde(default)]
    pub supporting_documents: Vec<DocumentRef>,
    pub chunks: Vec<Chunk>,
    /// Outputs of document-level stages (reference extraction, reports)
    #[serde(default)]
    pub document_fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub errors: Vec<WorkflowError>,
    pub run_config: RunConfig,
    #[serde(default)]
    pub stage_status: BTreeMap<String, StageStatus>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(document: DocumentRef, chunks: Vec<Chunk>, run_config: RunConfig) -> Self {
        Self {
            document,
            supporting_documents: Vec::new(),
            chunks,
            document_fields: BTreeMap::new(),
            errors: Vec::new(),
            run_config,
            stage_status: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_supporting(mut self, documents: Vec<DocumentRef>) -> Self {
        self.supporting_documents = documents;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.run_config.session_id
    }

    pub fn chunk(&self, chunk_index: usize) -> Option<&Chunk> {
        // Dense and sorted in the common case; fall back to a scan otherwise.
        match self.chunks.get(chunk_index) {
            Some(c) if c.chunk_index == chunk_index => Some(c),
            _ => self.chunks.iter().find(|c| c.chunk_index == chunk_index),
        }
    }

    /// Document-level field, deserialized.
    pub fn document_field<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        match self.document_fields.get(name).filter(|v| !v.is_null()) {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }

    pub fn record_error(&mut self, error: WorkflowError) {
        self.errors.push(error);
    }

    pub fn errors_for_chunk(&self, chunk_index: usize) -> impl Iterator<Item = &WorkflowError> {
        self.errors
            .iter()
            .filter(move |e| e.chunk_index == Some(chunk_index))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Check that chunk indices are exactly `0..n`, sorted, without duplicates.
    pub fn check_index_density(&self) -> Result<(), StateError> {
        let mut seen = BTreeSet::new();
        for (position, chunk) in self.chunks.iter().enumerate() {
            if !seen.insert(chunk.chunk_index) {
                return Err(StateError::IndexDuplicate(chunk.chunk_index));
            }
            if position > 0 && self.chunks[position - 1].chunk_index > chunk.chunk_index {
                return Err(StateError::Unsorted(position));
            }
        }
        let len = self.chunks.len();
        if let Some(missing) = (0..len).find(|i| !seen.contains(i)) {
            return Err(StateError::IndexGap { missing, len });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(indices: &[usize]) -> WorkflowState {
        let chunks = indices
            .iter()
            .map(|&i| Chunk::new(i, 0, i, format!("chunk {}", i)))
            .collect();
        WorkflowState::new(
            DocumentRef::new("doc", ""),
            chunks,
            RunConfig::for_session("s"),
        )
    }

    #[test]
    fn truncate_keeps_short_messages() {
        assert_eq!(truncate_message("boom"), "boom");
    }

    #[test]
    fn truncate_bounds_long_messages() {
        let long = "é".repeat(500);
        let cut = truncate_message(&long);
        assert_eq!(cut.chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn run_config_agents_filter() {
        let all = RunConfig::for_session("s");
        assert!(all.should_run("claims"));

        let some = RunConfig::for_session("s").with_agents(["claims"]);
        assert!(some.should_run("claims"));
        assert!(!some.should_run("citations"));

        let none = RunConfig::for_session("s").with_agents(Vec::<String>::new());
        assert!(!none.should_run("claims"));
    }

    #[test]
    fn fresh_run_configs_get_distinct_sessions() {
        assert_ne!(RunConfig::new().session_id, RunConfig::new().session_id);
    }

    #[test]
    fn index_density_accepts_dense() {
        assert!(state_with(&[0, 1, 2]).check_index_density().is_ok());
        assert!(state_with(&[]).check_index_density().is_ok());
    }

    #[test]
    fn index_density_rejects_gap_duplicate_unsorted() {
        assert_eq!(
            state_with(&[0, 2]).check_index_density(),
            Err(StateError::IndexGap { missing: 1, len: 2 })
        );
        assert_eq!(
            state_with(&[0, 0]).check_index_density(),
            Err(StateError::IndexDuplicate(0))
        );
        assert_eq!(
            state_with(&[1, 0]).check_index_density(),
            Err(StateError::Unsorted(1))
        );
    }

    #[test]
    fn chunk_lookup_by_index() {
        let state = state_with(&[0, 1, 2]);
        assert_eq!(state.chunk(1).unwrap().content, "chunk 1");
        assert!(state.chunk(7).is_none());
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = state_with(&[0, 1]);
        state.record_error(WorkflowError::for_chunk("claims", 1, "timeout"));
        state.stage_status.insert("claims".into(), StageStatus::PartiallyFailed);

        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert_eq!(back.errors_for_chunk(1).count(), 1);
    }
}
