//! Checkpoint stores
//!
//! The controller saves the whole `WorkflowState` after every wave, keyed by
//! session id. `SqliteCheckpointStore` is the persistent implementation;
//! `InMemoryCheckpointStore` serves tests and one-shot runs.

mod memory;
mod sqlite;
mod traits;

pub use memory::InMemoryCheckpointStore;
pub use sqlite::{SqliteCheckpointStore, DEFAULT_MAX_HISTORY};
pub use traits::{
    CheckpointError, CheckpointMeta, CheckpointResult, CheckpointStore, OpenCheckpointStore,
    Progress,
};
