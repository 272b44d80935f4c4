//! Bounded concurrent fan-out over chunks
//!
//! One task per selected chunk, gated by a counting semaphore. Each task's
//! failure (error or panic) is caught on its own and never cancels siblings.
//! Results come back index-aligned with the caller's selection, not in
//! completion order.

use crate::chunk::{Chunk, ChunkPatch, WorkflowError, WorkflowState};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

/// Default in-flight limit for whole-chunk stage dispatch.
pub const DEFAULT_MAX_CONCURRENT: usize = 15;

/// Default in-flight limit for per-claim sub-tasks inside expensive stages.
pub const DEFAULT_SUB_TASK_CONCURRENCY: usize = 3;

/// Why a single task produced no result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// The task function returned an error
    Failed,
    /// The task panicked
    Panicked,
    /// The task was cancelled before completing
    Cancelled,
}

/// A caught per-task failure. The message is already truncated.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn failed(message: &str) -> Self {
        Self {
            kind: TaskErrorKind::Failed,
            message: crate::chunk::truncate_message(message),
        }
    }

    fn from_join(error: JoinError) -> Self {
        if error.is_panic() {
            let payload = error.into_panic();
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Self {
                kind: TaskErrorKind::Panicked,
                message: crate::chunk::truncate_message(&format!("task panicked: {}", detail)),
            }
        } else {
            Self {
                kind: TaskErrorKind::Cancelled,
                message: "task cancelled".to_string(),
            }
        }
    }
}

/// Concurrency limits for the two pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Chunk tasks in flight at once
    pub max_concurrent: usize,
    /// Sub-tasks in flight at once, shared across one stage pass
    pub sub_task_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            sub_task_concurrency: DEFAULT_SUB_TASK_CONCURRENCY,
        }
    }
}

impl ExecutorConfig {
    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit;
        self
    }

    pub fn with_sub_task_concurrency(mut self, limit: usize) -> Self {
        self.sub_task_concurrency = limit;
        self
    }
}

/// Run `task` over `items` with at most `limit` in flight.
///
/// The returned vector is aligned with `items`.
pub async fn fan_out<T, R, E, F, Fut>(items: Vec<T>, limit: usize, task: F) -> Vec<Result<R, TaskError>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    fan_out_with(semaphore, items, task).await
}

/// Like [`fan_out`], but gated by a caller-owned semaphore so several
/// fan-outs can share one pool.
pub async fn fan_out_with<T, R, E, F, Fut>(
    semaphore: Arc<Semaphore>,
    items: Vec<T>,
    task: F,
) -> Vec<Result<R, TaskError>>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Display + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let task = Arc::new(task);

    let handles: Vec<JoinHandle<Result<R, TaskError>>> = items
        .into_iter()
        .map(|item| {
            let semaphore = Arc::clone(&semaphore);
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| TaskError::failed(&format!("semaphore closed: {}", e)))?;
                (*task)(item)
                    .await
                    .map_err(|e| TaskError::failed(&e.to_string()))
            })
        })
        .collect();

    // Every task is already running; awaiting in order only fixes the
    // output order.
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(TaskError::from_join(join_error)),
        });
    }
    results
}

/// Shared sub-task pool handed to stages for per-claim work.
#[derive(Debug, Clone)]
pub struct SubTaskPool {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl SubTaskPool {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Fan `task` out over `items` through this pool.
    pub async fn run<T, R, E, F, Fut>(&self, items: Vec<T>, task: F) -> Vec<Result<R, TaskError>>
    where
        T: Send + 'static,
        R: Send + 'static,
        E: Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        fan_out_with(Arc::clone(&self.semaphore), items, task).await
    }
}

/// Output of one executor pass, aligned with `selected`.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub selected: Vec<usize>,
    /// `results[i]` is the patch for `selected[i]`, `None` if that task failed
    pub results: Vec<Option<ChunkPatch>>,
    /// `errors[i]` is the failure for `selected[i]`, `None` on success
    pub errors: Vec<Option<TaskError>>,
    pub elapsed_ms: u64,
}

impl ExecutionReport {
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.errors.iter().filter(|e| e.is_some()).count()
    }

    /// Positions (into `selected`) of failed tasks.
    pub fn error_positions(&self) -> Vec<usize> {
        self.errors
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|_| i))
            .collect()
    }

    /// Failures as workflow error records attributed to `task_name`.
    pub fn workflow_errors(&self, task_name: &str) -> Vec<WorkflowError> {
        self.selected
            .iter()
            .zip(&self.errors)
            .filter_map(|(&index, error)| {
                error
                    .as_ref()
                    .map(|e| WorkflowError::for_chunk(task_name, index, &e.message))
            })
            .collect()
    }
}

/// Fans a stage function out over a selection of chunks.
#[derive(Debug, Clone, Default)]
pub struct ConcurrentExecutor {
    config: ExecutorConfig,
}

impl ConcurrentExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// A fresh sub-task pool sized from the config, for one stage pass.
    pub fn sub_task_pool(&self) -> SubTaskPool {
        SubTaskPool::new(self.config.sub_task_concurrency)
    }

    /// Run `stage_fn` once per index in `selected`.
    ///
    /// Tasks read `state` as a shared snapshot and return a patch for their
    /// own chunk; nothing is written to the state here. A patch addressed at
    /// a different chunk than the one the task was given counts as a failure.
    pub async fn run<F, Fut, E>(
        &self,
        state: Arc<WorkflowState>,
        selected: &[usize],
        stage_fn: F,
    ) -> ExecutionReport
    where
        F: Fn(Arc<WorkflowState>, Chunk) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ChunkPatch, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let started = Instant::now();
        let stage_fn = Arc::new(stage_fn);

        let items: Vec<(usize, Option<Chunk>)> = selected
            .iter()
            .map(|&index| (index, state.chunk(index).cloned()))
            .collect();

        let outcomes = fan_out(items, self.config.max_concurrent, move |(index, chunk)| {
            let state = Arc::clone(&state);
            let stage_fn = Arc::clone(&stage_fn);
            async move {
                let chunk = chunk.ok_or_else(|| format!("chunk index {} not found", index))?;
                let patch = (*stage_fn)(state, chunk)
                    .await
                    .map_err(|e| e.to_string())?;
                if patch.chunk_index != index {
                    return Err(format!(
                        "task for chunk {} returned a patch for chunk {}",
                        index, patch.chunk_index
                    ));
                }
                Ok::<ChunkPatch, String>(patch)
            }
        })
        .await;

        let mut results = Vec::with_capacity(outcomes.len());
        let mut errors = Vec::with_capacity(outcomes.len());
        for (position, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(patch) => {
                    results.push(Some(patch));
                    errors.push(None);
                }
                Err(error) => {
                    tracing::debug!(
                        chunk_index = selected[position],
                        error = %error,
                        "chunk task failed"
                    );
                    results.push(None);
                    errors.push(Some(error));
                }
            }
        }

        ExecutionReport {
            selected: selected.to_vec(),
            results,
            errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{DocumentRef, RunConfig};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn state(n: usize) -> Arc<WorkflowState> {
        let chunks = (0..n).map(|i| Chunk::new(i, 0, i, format!("c{}", i))).collect();
        Arc::new(WorkflowState::new(
            DocumentRef::new("doc", ""),
            chunks,
            RunConfig::for_session("test"),
        ))
    }

    #[tokio::test]
    async fn results_aligned_with_selection_not_completion() {
        let executor = ConcurrentExecutor::new(ExecutorConfig::default());
        let selected = vec![3, 0, 2];

        let report = executor
            .run(state(4), &selected, |_state, chunk| async move {
                // later selections finish first
                tokio::time::sleep(Duration::from_millis(40 - 10 * chunk.chunk_index as u64)).await;
                Ok::<_, String>(
                    ChunkPatch::for_chunk(chunk.chunk_index)
                        .with_field("echo", json!(chunk.content)),
                )
            })
            .await;

        let echoed: Vec<_> = report
            .results
            .iter()
            .map(|r| r.as_ref().unwrap().fields["echo"].clone())
            .collect();
        assert_eq!(echoed, vec![json!("c3"), json!("c0"), json!("c2")]);
        assert_eq!(report.failed(), 0);
    }

    #[tokio::test]
    async fn one_failure_is_isolated() {
        let executor = ConcurrentExecutor::new(ExecutorConfig::default());
        let selected: Vec<usize> = (0..6).collect();

        let report = executor
            .run(state(6), &selected, |_state, chunk| async move {
                if chunk.chunk_index == 4 {
                    return Err("backend refused".to_string());
                }
                Ok(ChunkPatch::for_chunk(chunk.chunk_index).with_field("ok", json!(true)))
            })
            .await;

        assert_eq!(report.len(), 6);
        assert_eq!(report.succeeded(), 5);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.error_positions(), vec![4]);
        assert!(report.results[4].is_none());
        assert_eq!(report.errors[4].as_ref().unwrap().message, "backend refused");

        let errors = report.workflow_errors("claims");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].chunk_index, Some(4));
        assert_eq!(errors[0].task_name, "claims");
    }

    #[tokio::test]
    async fn panic_is_caught_per_task() {
        let executor = ConcurrentExecutor::new(ExecutorConfig::default());

        let report = executor
            .run(state(3), &[0, 1, 2], |_state, chunk| async move {
                if chunk.chunk_index == 1 {
                    panic!("stage bug");
                }
                Ok::<_, String>(ChunkPatch::for_chunk(chunk.chunk_index))
            })
            .await;

        assert_eq!(report.succeeded(), 2);
        let error = report.errors[1].as_ref().unwrap();
        assert_eq!(error.kind, TaskErrorKind::Panicked);
        assert!(error.message.contains("stage bug"));
    }

    #[tokio::test]
    async fn in_flight_never_exceeds_limit() {
        for limit in [1usize, 2, 5] {
            let executor = ConcurrentExecutor::new(ExecutorConfig::default().with_max_concurrent(limit));
            let in_flight = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            let selected: Vec<usize> = (0..20).collect();

            let (f, p) = (Arc::clone(&in_flight), Arc::clone(&peak));
            let report = executor
                .run(state(20), &selected, move |_state, chunk| {
                    let (f, p) = (Arc::clone(&f), Arc::clone(&p));
                    async move {
                        let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                        p.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        f.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(ChunkPatch::for_chunk(chunk.chunk_index))
                    }
                })
                .await;

            assert_eq!(report.len(), 20);
            assert!(peak.load(Ordering::SeqCst) <= limit);
            assert!(peak.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test]
    async fn missing_chunk_and_foreign_patch_are_task_errors() {
        let executor = ConcurrentExecutor::default();

        let report = executor
            .run(state(2), &[0, 9], |_state, _chunk| async move {
                // always answers for chunk 1
                Ok::<_, String>(ChunkPatch::for_chunk(1))
            })
            .await;

        assert_eq!(report.failed(), 2);
        assert!(report.errors[0].as_ref().unwrap().message.contains("chunk 1"));
        assert!(report.errors[1].as_ref().unwrap().message.contains("not found"));
    }

    #[tokio::test]
    async fn long_errors_are_truncated() {
        let executor = ConcurrentExecutor::default();
        let report = executor
            .run(state(1), &[0], |_state, _chunk| async move {
                Err::<ChunkPatch, _>("x".repeat(1000))
            })
            .await;
        let message = &report.errors[0].as_ref().unwrap().message;
        assert_eq!(message.chars().count(), crate::chunk::MAX_ERROR_MESSAGE_CHARS);
    }

    #[tokio::test]
    async fn sub_task_pool_is_shared() {
        let pool = SubTaskPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let make_task = |f: Arc<AtomicUsize>, p: Arc<AtomicUsize>| {
            move |n: usize| {
                let (f, p) = (Arc::clone(&f), Arc::clone(&p));
                async move {
                    let now = f.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    f.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(n * 2)
                }
            }
        };

        let (a, b) = tokio::join!(
            pool.run((0..5).collect(), make_task(Arc::clone(&in_flight), Arc::clone(&peak))),
            pool.run((5..10).collect(), make_task(Arc::clone(&in_flight), Arc::clone(&peak))),
        );

        assert_eq!(a.iter().filter(|r| r.is_ok()).count(), 5);
        assert_eq!(*b[0].as_ref().unwrap(), 10);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn empty_selection_is_empty_report() {
        let report = ConcurrentExecutor::default()
            .run(state(3), &[], |_state, chunk| async move {
                Ok::<_, String>(ChunkPatch::for_chunk(chunk.chunk_index))
            })
            .await;
        assert!(report.is_empty());
        assert_eq!(report.succeeded(), 0);
    }
}
