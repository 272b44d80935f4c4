//! Checkpoint store trait definitions

use crate::chunk::{StageStatus, WorkflowState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Checkpoint store lock poisoned")]
    LockPoisoned,
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// One stored checkpoint, without its state payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointMeta {
    pub session_id: String,
    /// Monotonic per session, starting at 1
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub error_count: usize,
}

/// Summary of a session's latest checkpoint, for polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub session_id: String,
    pub updated_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub error_count: usize,
    pub stage_status: BTreeMap<String, StageStatus>,
}

impl Progress {
    pub fn from_state(state: &WorkflowState) -> Self {
        Self {
            session_id: state.session_id().to_string(),
            updated_at: state.updated_at,
            chunk_count: state.chunks.len(),
            error_count: state.errors.len(),
            stage_status: state.stage_status.clone(),
        }
    }

    /// True once every stage recorded in the checkpoint has finished.
    pub fn is_finished(&self) -> bool {
        !self.stage_status.is_empty() && self.stage_status.values().all(|s| s.is_terminal())
    }
}

/// Trait for checkpoint storage backends
///
/// Implementations must be thread-safe (Send + Sync): the controller writes
/// while pollers read.
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint for the state's session
    fn save(&self, state: &WorkflowState) -> CheckpointResult<()>;

    /// Latest checkpoint of a session
    fn load(&self, session_id: &str) -> CheckpointResult<Option<WorkflowState>>;

    /// Delete every checkpoint of a session
    fn delete_session(&self, session_id: &str) -> CheckpointResult<bool>;

    /// Session ids, most recently updated first
    fn list_sessions(&self) -> CheckpointResult<Vec<String>>;

    /// Stored checkpoints of a session, oldest first
    fn history(&self, session_id: &str) -> CheckpointResult<Vec<CheckpointMeta>>;
}

/// Trait for stores that can be opened from a path
pub trait OpenCheckpointStore: CheckpointStore + Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> CheckpointResult<Self>;

    /// Open an in-memory store (for testing)
    fn open_in_memory() -> CheckpointResult<Self>;
}
