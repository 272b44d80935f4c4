//! Chunkwise: chunk-oriented document analysis engine
//!
//! Splits long documents into indexed chunks, runs a pipeline of analysis
//! stages over them with bounded concurrency, and keeps every computed
//! result when some chunks fail.
//!
//! # Core Concepts
//!
//! - **Segmenter**: fast rule-based sentence split, suspicion scoring, and a
//!   pluggable fallback for paragraphs that split badly
//! - **Executor**: fans a stage out over selected chunks; failures stay local
//! - **Conciliator**: folds partial results back into the chunk list
//! - **Stage Controller**: dependency waves, stage skipping, selective
//!   re-evaluation, checkpointing
//!
//! # Example
//!
//! ```
//! use chunkwise::{DocumentRef, InMemoryCheckpointStore, RunConfig, Segmenter};
//! use chunkwise::{ExecutorConfig, StageController, StageRegistry};
//! use std::sync::Arc;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let controller = StageController::new(
//!     StageRegistry::new(),
//!     ExecutorConfig::default(),
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     Segmenter::statistical(),
//! );
//! let report = controller
//!     .analyze(
//!         DocumentRef::new("note.md", "This is sentence one. This is sentence two."),
//!         Vec::new(),
//!         RunConfig::new(),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(report.state.chunks.len(), 2);
//! # });
//! ```

pub mod checkpoint;
pub mod chunk;
pub mod conciliate;
pub mod config;
pub mod controller;
pub mod embedding;
pub mod executor;
pub mod llm;
pub mod segment;

pub use checkpoint::{
    CheckpointError, CheckpointMeta, CheckpointStore, InMemoryCheckpointStore,
    OpenCheckpointStore, Progress, SqliteCheckpointStore,
};
pub use chunk::{
    Chunk, ChunkPatch, DocumentRef, InputError, RunConfig, StageStatus, WorkflowError,
    WorkflowState,
};
pub use conciliate::{conciliate, Conciliator};
pub use config::{ConfigError, EngineConfig, FallbackKind};
pub use controller::{
    ChunkStage, ChunkText, ControllerError, DocumentStage, Eligibility, ReevaluationRequest,
    ReevaluationResult, RunReport, StageContext, StageController, StageError, StageInput,
    StageRegistry, StageReport,
};
pub use embedding::{Embedder, EmbeddingError};
pub use executor::{ConcurrentExecutor, ExecutionReport, ExecutorConfig, SubTaskPool, TaskError};
pub use llm::{CommandClient, LlmClient, LlmError, LlmResponse, MockClient};
pub use segment::{
    SegmentError, Segmentation, SegmentationFallback, Segmenter, SuspicionPolicy, SuspicionReport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
