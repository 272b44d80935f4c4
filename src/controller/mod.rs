//! Stage Controller
//!
//! Runs registered stages over a `WorkflowState` in dependency waves:
//! - **Skip**: stages not named in `agents_to_run` are skipped untouched
//! - **Selective re-evaluation**: `target_chunk_indices` narrows every chunk pass
//! - **Eligibility**: chunks missing a stage's inputs are excluded
//! - **Recovery**: per-chunk and per-stage failures become `WorkflowError`s
//! - **Checkpointing**: the state is saved after every wave

mod pipeline;
mod reevaluate;
mod registry;
mod stage;

pub use pipeline::{RunReport, StageController, StageReport};
pub use reevaluate::{ReevaluationRequest, ReevaluationResult, ReevaluationTiming};
pub use registry::{RegisteredStage, StageRegistry};
pub use stage::{
    ChunkStage, ChunkText, DocumentStage, DynChunkStage, Eligibility, StageContext, StageDelta,
    StageError, StageInput, StageOutcome,
};

use crate::checkpoint::CheckpointError;
use crate::chunk::StateError;
use crate::segment::SegmentError;

/// Errors that stop a controller operation.
///
/// Per-chunk and per-stage failures never show up here; they are recorded
/// in the state's error log instead.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("stage id '{0}' is already registered")]
    DuplicateStage(String),

    #[error("field '{field}' is already written by stage '{owner}', cannot register '{stage}'")]
    FieldOwnership {
        field: String,
        owner: String,
        stage: String,
    },

    #[error("stage '{stage}' may not write core field '{field}'")]
    CoreFieldWrite { stage: String, field: String },

    #[error("unknown stage '{0}'")]
    UnknownStage(String),

    #[error("segmentation failed: {0}")]
    Segment(#[from] SegmentError),

    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("invalid chunk list: {0}")]
    State(#[from] StateError),

    #[error("no checkpoint for session '{0}'")]
    SessionNotFound(String),

    #[error("chunk index {index} out of range (document has {len} chunks)")]
    ChunkOutOfRange { index: usize, len: usize },

    #[error("re-evaluation changed chunk {0}, which was not targeted")]
    ScopeViolation(usize),
}
