//! Stage traits
//!
//! A chunk stage declares a typed input (`StageInput`), the single field it
//! writes, and an async `process`. The controller only sees the object-safe
//! `DynChunkStage`, which every `ChunkStage` gets through a blanket impl.

use crate::chunk::{Chunk, ChunkPatch, InputError, WorkflowError, WorkflowState};
use crate::executor::SubTaskPool;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Error raised by a stage for one chunk (or for the whole document).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StageError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Typed input of a chunk stage, built from the chunk and the shared state.
///
/// `reads` names the chunk fields `extract` depends on; the controller uses
/// it for dependency ordering and eligibility.
pub trait StageInput: Sized + Send + 'static {
    fn reads() -> Vec<&'static str>;

    fn extract(state: &WorkflowState, chunk: &Chunk) -> Result<Self, InputError>;
}

/// Input for stages that only need the chunk text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkText {
    pub chunk_index: usize,
    pub content: String,
}

impl StageInput for ChunkText {
    fn reads() -> Vec<&'static str> {
        Vec::new()
    }

    fn extract(_state: &WorkflowState, chunk: &Chunk) -> Result<Self, InputError> {
        Ok(Self {
            chunk_index: chunk.chunk_index,
            content: chunk.content.clone(),
        })
    }
}

/// What to do with a chunk that lacks some of a stage's read fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eligibility {
    /// Exclude the chunk from the pass
    #[default]
    RequireInputs,
    /// Run anyway; `StageInput::extract` decides
    AttemptWithMissing,
}

/// Per-pass context handed to every stage call.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub session_id: String,
    sub_tasks: SubTaskPool,
}

impl StageContext {
    pub fn new(session_id: impl Into<String>, sub_tasks: SubTaskPool) -> Self {
        Self {
            session_id: session_id.into(),
            sub_tasks,
        }
    }

    /// Shared pool for per-claim work inside a stage.
    pub fn sub_tasks(&self) -> &SubTaskPool {
        &self.sub_tasks
    }
}

/// A stage that runs once per chunk.
///
/// # Example
///
/// ```ignore
/// struct WordCount;
///
/// #[async_trait]
/// impl ChunkStage for WordCount {
///     type Input = ChunkText;
///     type Output = usize;
///
///     fn id(&self) -> &str { "word_count" }
///     fn writes(&self) -> &str { "word_count" }
///
///     async fn process(&self, input: ChunkText, _ctx: &StageContext) -> Result<usize, StageError> {
///         Ok(input.content.split_whitespace().count())
///     }
/// }
/// ```
#[async_trait]
pub trait ChunkStage: Send + Sync + 'static {
    type Input: StageInput;
    type Output: Serialize + Send;

    /// Unique identifier, matched against `RunConfig::agents_to_run`
    fn id(&self) -> &str;

    /// The chunk field this stage owns
    fn writes(&self) -> &str;

    fn eligibility(&self) -> Eligibility {
        Eligibility::RequireInputs
    }

    async fn process(
        &self,
        input: Self::Input,
        ctx: &StageContext,
    ) -> Result<Self::Output, StageError>;
}

/// Object-safe view of a chunk stage.
#[async_trait]
pub trait DynChunkStage: Send + Sync {
    fn stage_id(&self) -> &str;

    fn input_fields(&self) -> Vec<&'static str>;

    fn output_field(&self) -> &str;

    fn eligibility_rule(&self) -> Eligibility;

    /// Run the stage for one chunk and wrap the output as a patch that
    /// writes only the stage's field.
    async fn run_chunk(
        &self,
        state: &WorkflowState,
        chunk: &Chunk,
        ctx: &StageContext,
    ) -> Result<ChunkPatch, StageError>;
}

#[async_trait]
impl<S: ChunkStage> DynChunkStage for S {
    fn stage_id(&self) -> &str {
        self.id()
    }

    fn input_fields(&self) -> Vec<&'static str> {
        S::Input::reads()
    }

    fn output_field(&self) -> &str {
        self.writes()
    }

    fn eligibility_rule(&self) -> Eligibility {
        self.eligibility()
    }

    async fn run_chunk(
        &self,
        state: &WorkflowState,
        chunk: &Chunk,
        ctx: &StageContext,
    ) -> Result<ChunkPatch, StageError> {
        let input = S::Input::extract(state, chunk)?;
        let output = self.process(input, ctx).await?;
        let value = serde_json::to_value(output)
            .map_err(|e| StageError::failed(format!("output not serializable: {}", e)))?;
        Ok(ChunkPatch::for_chunk(chunk.chunk_index).with_field(self.writes(), value))
    }
}

/// A stage that runs once per document (reference extraction, aggregation).
#[async_trait]
pub trait DocumentStage: Send + Sync {
    fn id(&self) -> &str;

    /// Chunk or document fields this stage depends on
    fn reads(&self) -> Vec<&str> {
        Vec::new()
    }

    /// The document field this stage owns
    fn writes(&self) -> &str;

    async fn run(&self, state: &WorkflowState, ctx: &StageContext) -> Result<Value, StageError>;
}

/// Everything one stage invocation wants folded into the state.
#[derive(Debug, Clone, Default)]
pub struct StageDelta {
    /// Index-aligned with the chunks that were processed
    pub patches: Vec<Option<ChunkPatch>>,
    pub document_fields: BTreeMap<String, Value>,
    pub errors: Vec<WorkflowError>,
    pub processed: usize,
    pub excluded: usize,
}

impl StageDelta {
    pub fn failed(&self) -> usize {
        self.patches.iter().filter(|p| p.is_none()).count()
    }
}

/// Result of invoking one stage.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// Not selected by `agents_to_run`; the state is unchanged
    Skipped,
    Ran(StageDelta),
    /// The stage as a whole failed (document stages, crashed passes)
    Failed(StageError),
}
