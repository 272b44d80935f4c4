//! In-memory checkpoint backend

use super::traits::{CheckpointMeta, CheckpointResult, CheckpointStore};
use crate::chunk::WorkflowState;
use chrono::Utc;
use dashmap::DashMap;

struct Entry {
    meta: CheckpointMeta,
    state: WorkflowState,
}

/// Checkpoint store held in process memory.
///
/// Same history semantics as the SQLite store; lost on drop.
pub struct InMemoryCheckpointStore {
    sessions: DashMap<String, Vec<Entry>>,
    max_history: usize,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            max_history: super::DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn save(&self, state: &WorkflowState) -> CheckpointResult<()> {
        let mut entries = self
            .sessions
            .entry(state.session_id().to_string())
            .or_default();
        let seq = entries.last().map(|e| e.meta.seq + 1).unwrap_or(1);
        entries.push(Entry {
            meta: CheckpointMeta {
                session_id: state.session_id().to_string(),
                seq,
                created_at: Utc::now(),
                chunk_count: state.chunks.len(),
                error_count: state.errors.len(),
            },
            state: state.clone(),
        });
        let excess = entries.len().saturating_sub(self.max_history);
        entries.drain(..excess);
        Ok(())
    }

    fn load(&self, session_id: &str) -> CheckpointResult<Option<WorkflowState>> {
        Ok(self
            .sessions
            .get(session_id)
            .and_then(|entries| entries.last().map(|e| e.state.clone())))
    }

    fn delete_session(&self, session_id: &str) -> CheckpointResult<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    fn list_sessions(&self) -> CheckpointResult<Vec<String>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .filter_map(|item| {
                item.value()
                    .last()
                    .map(|e| (e.meta.created_at, item.key().clone()))
            })
            .collect();
        sessions.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        Ok(sessions.into_iter().map(|(_, id)| id).collect())
    }

    fn history(&self, session_id: &str) -> CheckpointResult<Vec<CheckpointMeta>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|entries| entries.iter().map(|e| e.meta.clone()).collect())
            .unwrap_or_default())
    }
}
