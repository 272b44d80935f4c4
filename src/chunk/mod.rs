//! Chunk store data model
//!
//! - **Chunk**: indexed span of the source document plus stage-result fields
//! - **ChunkPatch**: the partial chunk an executor task hands back
//! - **WorkflowState**: the session envelope that gets checkpointed

mod state;
mod types;

pub use state::{
    truncate_message, DocumentRef, RunConfig, StageStatus, StateError, WorkflowError,
    WorkflowState, MAX_ERROR_MESSAGE_CHARS,
};
pub use types::{Chunk, ChunkPatch, InputError, CORE_FIELDS};
