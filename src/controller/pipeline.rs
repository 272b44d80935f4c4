//! Wave-by-wave pipeline execution
//!
//! A checkpoint is written when the run starts, when a wave's stages are
//! marked running, and when the wave finishes. A failed save ends the run.

use super::registry::{RegisteredStage, StageRegistry};
use super::stage::{DynChunkStage, Eligibility, StageContext, StageDelta, StageError, StageOutcome};
use super::ControllerError;
use crate::checkpoint::{CheckpointStore, Progress};
use crate::chunk::{DocumentRef, RunConfig, StageStatus, WorkflowError, WorkflowState};
use crate::conciliate::{conciliate_fields, Conciliator};
use crate::executor::{ConcurrentExecutor, ExecutorConfig};
use crate::segment::Segmenter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to one stage during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage_id: String,
    pub status: StageStatus,
    /// Chunks (or documents) the stage was invoked on
    pub processed: usize,
    pub failed: usize,
    /// Chunks left out for missing inputs
    pub excluded: usize,
    pub elapsed_ms: u64,
}

impl StageReport {
    fn skipped(stage_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Skipped,
            processed: 0,
            failed: 0,
            excluded: 0,
            elapsed_ms: 0,
        }
    }
}

/// Final state of a run plus one report per registered stage.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: WorkflowState,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    pub fn stage(&self, stage_id: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    /// True when no stage ended partially failed.
    pub fn is_clean(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.status != StageStatus::PartiallyFailed)
    }
}

/// Runs registered stages over a workflow state.
pub struct StageController {
    registry: StageRegistry,
    executor: ConcurrentExecutor,
    store: Arc<dyn CheckpointStore>,
    segmenter: Arc<Segmenter>,
}

impl StageController {
    pub fn new(
        registry: StageRegistry,
        executor: ExecutorConfig,
        store: Arc<dyn CheckpointStore>,
        segmenter: Segmenter,
    ) -> Self {
        Self {
            registry,
            executor: ConcurrentExecutor::new(executor),
            store,
            segmenter: Arc::new(segmenter),
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    /// Segment `document` and run the pipeline over the fresh chunk list.
    pub async fn analyze(
        &self,
        document: DocumentRef,
        supporting: Vec<DocumentRef>,
        run_config: RunConfig,
    ) -> Result<RunReport, ControllerError> {
        let segmentation = self.segmenter.segment(&document.text).await?;
        tracing::info!(
            document = %document.name,
            session = %run_config.session_id,
            chunks = segmentation.chunks.len(),
            fallbacks = segmentation.fallbacks.len(),
            "Document segmented"
        );
        let state = WorkflowState::new(document, segmentation.chunks, run_config)
            .with_supporting(supporting);
        self.run(state).await
    }

    /// Load a session's latest checkpoint and run it again under `run_config`.
    ///
    /// The run config's session id is replaced by `session_id`.
    pub async fn resume(
        &self,
        session_id: &str,
        run_config: RunConfig,
    ) -> Result<RunReport, ControllerError> {
        let mut state = self
            .store
            .load(session_id)?
            .ok_or_else(|| ControllerError::SessionNotFound(session_id.to_string()))?;
        state.run_config = RunConfig {
            session_id: session_id.to_string(),
            ..run_config
        };
        self.run(state).await
    }

    /// Latest checkpointed progress of a session. May lag a run in flight.
    pub fn poll(&self, session_id: &str) -> Result<Option<Progress>, ControllerError> {
        Ok(self
            .store
            .load(session_id)?
            .map(|state| Progress::from_state(&state)))
    }

    /// Run every registered stage, wave by wave, under `state.run_config`.
    pub async fn run(&self, mut state: WorkflowState) -> Result<RunReport, ControllerError> {
        state.check_index_density()?;
        let targets = resolve_targets(&state);
        let ctx = StageContext::new(state.session_id(), self.executor.sub_task_pool());

        tracing::info!(
            session = %state.session_id(),
            chunks = state.chunks.len(),
            stages = self.registry.len(),
            targets = ?targets,
            "Starting pipeline run"
        );

        for stage in self.registry.stages() {
            if state.run_config.should_run(stage.id()) {
                state
                    .stage_status
                    .insert(stage.id().to_string(), StageStatus::Pending);
            }
        }
        state.touch();
        self.store.save(&state)?;

        let mut reports = Vec::with_capacity(self.registry.len());
        for wave in self.registry.waves() {
            let mut wave_reports: Vec<(usize, StageReport)> = Vec::with_capacity(wave.len());
            let mut running: Vec<(usize, RegisteredStage)> = Vec::new();

            for position in wave {
                let stage = self.registry.stages()[position].clone();
                if !state.run_config.should_run(stage.id()) {
                    tracing::info!(stage = stage.id(), "Stage not selected, skipping");
                    state
                        .stage_status
                        .entry(stage.id().to_string())
                        .or_insert(StageStatus::Skipped);
                    wave_reports.push((position, StageReport::skipped(stage.id())));
                    continue;
                }
                state
                    .stage_status
                    .insert(stage.id().to_string(), StageStatus::Running);
                running.push((position, stage));
            }

            if !running.is_empty() {
                state.touch();
                self.store.save(&state)?;

                let snapshot = Arc::new(state.clone());
                let handles: Vec<_> = running
                    .iter()
                    .map(|(_, stage)| {
                        let stage = stage.clone();
                        let snapshot = Arc::clone(&snapshot);
                        let executor = self.executor.clone();
                        let targets = targets.clone();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let started = Instant::now();
                            let outcome =
                                invoke_stage(&stage, executor, snapshot, targets, &ctx).await;
                            (outcome, started.elapsed())
                        })
                    })
                    .collect();

                for ((position, stage), handle) in running.iter().zip(handles) {
                    let (outcome, elapsed) = match handle.await {
                        Ok(result) => result,
                        Err(e) => (
                            StageOutcome::Failed(StageError::failed(format!(
                                "stage task crashed: {}",
                                e
                            ))),
                            Duration::ZERO,
                        ),
                    };
                    let report = apply_outcome(&mut state, stage.id(), outcome, elapsed);
                    wave_reports.push((*position, report));
                }
            }

            state.touch();
            self.store.save(&state)?;
            tracing::debug!(session = %state.session_id(), "Checkpoint saved");

            wave_reports.sort_by_key(|(position, _)| *position);
            reports.extend(wave_reports.into_iter().map(|(_, report)| report));
        }

        tracing::info!(
            session = %state.session_id(),
            errors = state.errors.len(),
            "Pipeline run finished"
        );
        Ok(RunReport {
            state,
            stages: reports,
        })
    }
}

/// In-range, deduplicated target indices; `None` for a full run.
fn resolve_targets(state: &WorkflowState) -> Option<Vec<usize>> {
    let requested = state.run_config.target_chunk_indices.as_ref()?;
    let len = state.chunks.len();
    let mut seen = BTreeSet::new();
    let mut targets = Vec::with_capacity(requested.len());
    for &index in requested {
        if index >= len {
            tracing::warn!(
                index,
                chunks = len,
                "Ignoring out-of-range target chunk index"
            );
        } else if seen.insert(index) {
            targets.push(index);
        }
    }
    Some(targets)
}

async fn invoke_stage(
    stage: &RegisteredStage,
    executor: ConcurrentExecutor,
    snapshot: Arc<WorkflowState>,
    targets: Option<Vec<usize>>,
    ctx: &StageContext,
) -> StageOutcome {
    match stage {
        RegisteredStage::Chunk(stage) => {
            invoke_chunk_stage(Arc::clone(stage), executor, snapshot, targets, ctx.clone()).await
        }
        RegisteredStage::Document(stage) => match stage.run(&snapshot, ctx).await {
            Ok(value) => {
                let mut delta = StageDelta {
                    processed: 1,
                    ..Default::default()
                };
                delta
                    .document_fields
                    .insert(stage.writes().to_string(), value);
                StageOutcome::Ran(delta)
            }
            Err(e) => StageOutcome::Failed(e),
        },
    }
}

async fn invoke_chunk_stage(
    stage: Arc<dyn DynChunkStage>,
    executor: ConcurrentExecutor,
    snapshot: Arc<WorkflowState>,
    targets: Option<Vec<usize>>,
    ctx: StageContext,
) -> StageOutcome {
    let candidates: Vec<usize> =
        targets.unwrap_or_else(|| snapshot.chunks.iter().map(|c| c.chunk_index).collect());
    let reads = stage.input_fields();

    let mut eligible = Vec::with_capacity(candidates.len());
    let mut excluded = 0;
    for &index in &candidates {
        let Some(chunk) = snapshot.chunk(index) else {
            continue;
        };
        let missing: Vec<&str> = reads
            .iter()
            .copied()
            .filter(|field| !chunk.has_field(field))
            .collect();
        if missing.is_empty() || stage.eligibility_rule() == Eligibility::AttemptWithMissing {
            eligible.push(index);
        } else {
            excluded += 1;
            tracing::debug!(
                stage = stage.stage_id(),
                chunk = index,
                missing = ?missing,
                "Chunk lacks stage inputs, excluded"
            );
        }
    }

    let mut delta = StageDelta {
        excluded,
        ..Default::default()
    };
    if eligible.is_empty() {
        if !candidates.is_empty() {
            tracing::warn!(
                stage = stage.stage_id(),
                selected = candidates.len(),
                "No eligible chunks for stage"
            );
            delta.errors.push(WorkflowError::for_document(
                stage.stage_id(),
                &format!(
                    "no eligible chunks: all {} selected chunks lack inputs {:?}",
                    candidates.len(),
                    reads
                ),
            ));
        }
        return StageOutcome::Ran(delta);
    }

    let task_stage = Arc::clone(&stage);
    let report = executor
        .run(snapshot, &eligible, move |state, chunk| {
            let stage = Arc::clone(&task_stage);
            let ctx = ctx.clone();
            async move { stage.run_chunk(&state, &chunk, &ctx).await }
        })
        .await;

    delta.processed = report.len();
    delta.errors = report.workflow_errors(stage.stage_id());
    delta.patches = report.results;
    StageOutcome::Ran(delta)
}

/// Fold one stage outcome into the state and report on it.
fn apply_outcome(
    state: &mut WorkflowState,
    stage_id: &str,
    outcome: StageOutcome,
    elapsed: Duration,
) -> StageReport {
    let mut report = StageReport::skipped(stage_id);
    report.elapsed_ms = elapsed.as_millis() as u64;

    report.status = match outcome {
        StageOutcome::Skipped => StageStatus::Skipped,
        StageOutcome::Ran(delta) => {
            report.processed = delta.processed;
            report.failed = delta.failed();
            report.excluded = delta.excluded;

            let mut conciliator = Conciliator::new();
            conciliator.merge_into(&mut state.chunks, &delta.patches);
            conciliate_fields(&mut state.document_fields, &delta.document_fields);

            let status = if delta.errors.is_empty() {
                StageStatus::Completed
            } else {
                StageStatus::PartiallyFailed
            };
            conciliator.merge_errors(&mut state.errors, delta.errors);

            tracing::info!(
                stage = stage_id,
                processed = report.processed,
                applied = conciliator.applied(),
                failed = report.failed,
                excluded = report.excluded,
                elapsed_ms = report.elapsed_ms,
                status = status.as_str(),
                "Stage finished"
            );
            status
        }
        StageOutcome::Failed(error) => {
            tracing::error!(stage = stage_id, error = %error, "Stage failed");
            report.processed = 1;
            report.failed = 1;
            state.record_error(WorkflowError::for_document(stage_id, &error.to_string()));
            StageStatus::PartiallyFailed
        }
    };

    state
        .stage_status
        .insert(stage_id.to_string(), report.status);
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::chunk::Chunk;

    fn state_with(chunks: usize, run_config: RunConfig) -> WorkflowState {
        WorkflowState::new(
            DocumentRef::new("doc", ""),
            (0..chunks).map(|i| Chunk::new(i, 0, i, format!("c{}", i))).collect(),
            run_config,
        )
    }

    #[test]
    fn targets_are_filtered_and_deduplicated() {
        let state = state_with(3, RunConfig::for_session("s").with_targets(vec![2, 7, 2, 0]));
        assert_eq!(resolve_targets(&state), Some(vec![2, 0]));

        let full = state_with(3, RunConfig::for_session("s"));
        assert_eq!(resolve_targets(&full), None);
    }

    #[test]
    fn failed_outcome_records_document_error() {
        let mut state = state_with(1, RunConfig::for_session("s"));
        let report = apply_outcome(
            &mut state,
            "refs",
            StageOutcome::Failed(StageError::failed("no references section")),
            Duration::from_millis(3),
        );

        assert_eq!(report.status, StageStatus::PartiallyFailed);
        assert_eq!(state.errors.len(), 1);
        assert!(state.errors[0].is_document_level());
        assert_eq!(state.stage_status["refs"], StageStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn empty_registry_still_checkpoints() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let controller = StageController::new(
            StageRegistry::new(),
            ExecutorConfig::default(),
            store.clone(),
            Segmenter::statistical(),
        );

        let report = controller
            .run(state_with(2, RunConfig::for_session("s")))
            .await
            .unwrap();
        assert!(report.stages.is_empty());
        assert!(store.load("s").unwrap().is_some());
    }

    #[tokio::test]
    async fn rejects_sparse_chunk_list() {
        let controller = StageController::new(
            StageRegistry::new(),
            ExecutorConfig::default(),
            Arc::new(InMemoryCheckpointStore::new()),
            Segmenter::statistical(),
        );
        let mut state = state_with(2, RunConfig::for_session("s"));
        state.chunks[1].chunk_index = 5;

        let err = controller.run(state).await.unwrap_err();
        assert!(matches!(err, ControllerError::State(_)));
    }

    #[tokio::test]
    async fn resume_unknown_session() {
        let controller = StageController::new(
            StageRegistry::new(),
            ExecutorConfig::default(),
            Arc::new(InMemoryCheckpointStore::new()),
            Segmenter::statistical(),
        );
        let err = controller
            .resume("nope", RunConfig::for_session("ignored"))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::SessionNotFound(_)));
        assert!(controller.poll("nope").unwrap().is_none());
    }
}
