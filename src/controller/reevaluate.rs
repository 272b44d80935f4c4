//! Single-chunk re-evaluation

use super::pipeline::{StageController, StageReport};
use super::ControllerError;
use crate::chunk::{Chunk, RunConfig, WorkflowError, WorkflowState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

/// Re-run some or all stages for exactly one chunk of an analyzed state.
#[derive(Debug, Clone)]
pub struct ReevaluationRequest {
    pub chunk_index: usize,
    /// `None` runs every registered stage
    pub agents_to_run: Option<Vec<String>>,
    pub original_state: WorkflowState,
}

impl ReevaluationRequest {
    pub fn new(original_state: WorkflowState, chunk_index: usize) -> Self {
        Self {
            chunk_index,
            agents_to_run: None,
            original_state,
        }
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.agents_to_run = Some(agents.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReevaluationTiming {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ReevaluationResult {
    /// The re-evaluated chunk
    pub chunk: Chunk,
    /// Errors raised during this pass only
    pub errors: Vec<WorkflowError>,
    pub timing: ReevaluationTiming,
    pub stages: Vec<StageReport>,
    /// Full state after the pass; every other chunk is unchanged
    pub state: WorkflowState,
}

impl StageController {
    /// Re-run stages for one chunk of `request.original_state`.
    ///
    /// Unlike batch runs, an out-of-range index or an unknown stage id is an
    /// error rather than a warning.
    pub async fn reevaluate_chunk(
        &self,
        request: ReevaluationRequest,
    ) -> Result<ReevaluationResult, ControllerError> {
        let ReevaluationRequest {
            chunk_index,
            agents_to_run,
            original_state,
        } = request;

        let len = original_state.chunks.len();
        if chunk_index >= len {
            return Err(ControllerError::ChunkOutOfRange {
                index: chunk_index,
                len,
            });
        }
        if let Some(agents) = &agents_to_run {
            if let Some(unknown) = agents.iter().find(|id| self.registry().get(id).is_none()) {
                return Err(ControllerError::UnknownStage(unknown.clone()));
            }
        }

        let started_at = Utc::now();
        let started = Instant::now();
        tracing::info!(
            session = %original_state.session_id(),
            chunk = chunk_index,
            agents = ?agents_to_run,
            "Re-evaluating chunk"
        );

        let mut state = original_state.clone();
        state.run_config = RunConfig {
            session_id: original_state.run_config.session_id.clone(),
            target_chunk_indices: Some(vec![chunk_index]),
            agents_to_run,
        };
        let errors_before = state.errors.len();
        let report = self.run(state).await?;

        for original in &original_state.chunks {
            if original.chunk_index == chunk_index {
                continue;
            }
            if report.state.chunk(original.chunk_index) != Some(original) {
                return Err(ControllerError::ScopeViolation(original.chunk_index));
            }
        }
        if report.state.chunks.len() != len {
            return Err(ControllerError::ScopeViolation(chunk_index));
        }

        let chunk = report
            .state
            .chunk(chunk_index)
            .cloned()
            .ok_or(ControllerError::ChunkOutOfRange {
                index: chunk_index,
                len,
            })?;
        let errors = report.state.errors[errors_before.min(report.state.errors.len())..].to_vec();

        Ok(ReevaluationResult {
            chunk,
            errors,
            timing: ReevaluationTiming {
                started_at,
                finished_at: Utc::now(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            stages: report.stages,
            state: report.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::chunk::DocumentRef;
    use crate::controller::{ChunkStage, ChunkText, StageContext, StageError, StageRegistry};
    use crate::executor::ExecutorConfig;
    use crate::segment::Segmenter;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Length;

    #[async_trait]
    impl ChunkStage for Length {
        type Input = ChunkText;
        type Output = usize;

        fn id(&self) -> &str {
            "length"
        }

        fn writes(&self) -> &str {
            "length"
        }

        async fn process(&self, input: ChunkText, _ctx: &StageContext) -> Result<usize, StageError> {
            Ok(input.content.len())
        }
    }

    fn controller() -> StageController {
        StageController::new(
            StageRegistry::new().with_chunk_stage(Length).unwrap(),
            ExecutorConfig::default(),
            Arc::new(InMemoryCheckpointStore::new()),
            Segmenter::statistical(),
        )
    }

    fn state() -> WorkflowState {
        WorkflowState::new(
            DocumentRef::new("doc", "a bb ccc"),
            vec![
                Chunk::new(0, 0, 0, "a"),
                Chunk::new(1, 0, 1, "bb"),
                Chunk::new(2, 0, 2, "ccc"),
            ],
            RunConfig::for_session("s"),
        )
    }

    #[tokio::test]
    async fn only_the_requested_chunk_changes() {
        let original = state();
        let result = controller()
            .reevaluate_chunk(ReevaluationRequest::new(original.clone(), 1))
            .await
            .unwrap();

        assert_eq!(result.chunk.field::<usize>("length").unwrap(), Some(2));
        assert_eq!(result.state.chunks[0], original.chunks[0]);
        assert_eq!(result.state.chunks[2], original.chunks[2]);
        assert!(result.errors.is_empty());
        assert!(result.timing.finished_at >= result.timing.started_at);
    }

    #[tokio::test]
    async fn rejects_out_of_range_index() {
        let err = controller()
            .reevaluate_chunk(ReevaluationRequest::new(state(), 3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControllerError::ChunkOutOfRange { index: 3, len: 3 }
        ));
    }

    #[tokio::test]
    async fn rejects_unknown_stage() {
        let err = controller()
            .reevaluate_chunk(ReevaluationRequest::new(state(), 0).with_agents(["nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownStage(id) if id == "nope"));
    }
}
