//! Engine configuration
//!
//! Every section has serde defaults, so an empty YAML document is a valid
//! config:
//!
//! ```yaml
//! executor:
//!   max_concurrent: 15
//!   sub_task_concurrency: 3
//! segmentation:
//!   fallback: llm          # llm | embedding | statistical
//!   suspicion:
//!     threshold: 5
//! checkpoint:
//!   path: /var/lib/chunkwise/checkpoints.db
//!   max_history: 20
//! llm:
//!   command: llm-tokenize
//!   timeout_seconds: 60
//! ```

use crate::checkpoint::{
    CheckpointError, OpenCheckpointStore, SqliteCheckpointStore, DEFAULT_MAX_HISTORY,
};
use crate::embedding::Embedder;
use crate::executor::ExecutorConfig;
use crate::llm::CommandClient;
use crate::segment::{
    EmbeddingCoherenceFallback, LlmTokenizer, PolicyError, SegmentError, SegmentationFallback,
    Segmenter, StatisticalFallback, SuspicionPolicy, DEFAULT_PARAGRAPH_CONCURRENCY,
    DEFAULT_TOKENIZER_TASK,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid suspicion policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Which repair strategy handles suspicious paragraphs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackKind {
    Llm,
    Embedding,
    #[default]
    Statistical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    pub fallback: FallbackKind,
    pub suspicion: SuspicionPolicy,
    pub paragraph_concurrency: usize,
    /// Task name sent to the LLM client
    pub llm_task: String,
    /// Cosine similarity above which neighbouring fragments are re-joined
    pub embedding_threshold: f32,
    pub embedding_min_len: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            fallback: FallbackKind::default(),
            suspicion: SuspicionPolicy::default(),
            paragraph_concurrency: DEFAULT_PARAGRAPH_CONCURRENCY,
            llm_task: DEFAULT_TOKENIZER_TASK.to_string(),
            embedding_threshold: 0.85,
            embedding_min_len: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// `None` = [`default_db_path`]
    pub path: Option<PathBuf>,
    pub max_history: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub segmentation: SegmentationConfig,
    pub checkpoint: CheckpointConfig,
    pub llm: LlmConfig,
}

impl EngineConfig {
    /// Parse and validate a YAML config.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executor.max_concurrent == 0 || self.executor.sub_task_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "executor concurrency limits must be positive".to_string(),
            ));
        }
        if self.segmentation.paragraph_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "segmentation.paragraph_concurrency must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.segmentation.embedding_threshold) {
            return Err(ConfigError::Invalid(format!(
                "segmentation.embedding_threshold must be within [0, 1], got {}",
                self.segmentation.embedding_threshold
            )));
        }
        if self.checkpoint.max_history == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint.max_history must be positive".to_string(),
            ));
        }
        if self.llm.timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "llm.timeout_seconds must be positive".to_string(),
            ));
        }
        if self.segmentation.fallback == FallbackKind::Llm && self.llm.command.is_none() {
            return Err(ConfigError::Invalid(
                "the llm fallback needs llm.command".to_string(),
            ));
        }
        self.segmentation.suspicion.validate()?;
        Ok(())
    }

    /// Configured checkpoint database, or the platform default.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint.path.clone().unwrap_or_else(default_db_path)
    }

    pub fn open_store(&self) -> Result<SqliteCheckpointStore, ConfigError> {
        let store = SqliteCheckpointStore::open(self.checkpoint_path())?
            .with_max_history(self.checkpoint.max_history);
        Ok(store)
    }

    pub fn llm_client(&self) -> Option<CommandClient> {
        self.llm.command.as_ref().map(|command| {
            CommandClient::new(command.clone())
                .with_args(self.llm.args.clone())
                .with_timeout(self.llm.timeout_seconds)
        })
    }

    /// Build the segmenter for the configured fallback.
    ///
    /// `embedder` is only consulted for the embedding fallback, which fails
    /// without one.
    pub fn build_segmenter(
        &self,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Result<Segmenter, ConfigError> {
        let seg = &self.segmentation;
        let fallback: Arc<dyn SegmentationFallback> = match seg.fallback {
            FallbackKind::Statistical => {
                Arc::new(StatisticalFallback::new(seg.suspicion.clone()))
            }
            FallbackKind::Llm => {
                let client = self.llm_client().ok_or_else(|| {
                    ConfigError::Invalid("the llm fallback needs llm.command".to_string())
                })?;
                Arc::new(LlmTokenizer::new(Arc::new(client)).with_task(seg.llm_task.clone()))
            }
            FallbackKind::Embedding => {
                let embedder = embedder.ok_or_else(|| {
                    ConfigError::Invalid("the embedding fallback needs an embedder".to_string())
                })?;
                Arc::new(
                    EmbeddingCoherenceFallback::new(embedder)
                        .with_threshold(seg.embedding_threshold)
                        .with_min_len(seg.embedding_min_len),
                )
            }
        };
        Ok(Segmenter::new(seg.suspicion.clone(), fallback)?
            .with_paragraph_concurrency(seg.paragraph_concurrency))
    }
}

/// Default checkpoint database path (~/.local/share/chunkwise/checkpoints.db)
pub fn default_db_path() -> PathBuf {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"));
    data_dir.join("chunkwise").join("checkpoints.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_is_default() {
        let config = EngineConfig::from_yaml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.executor.max_concurrent, 15);
        assert_eq!(config.segmentation.fallback, FallbackKind::Statistical);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
executor:
  max_concurrent: 4
segmentation:
  suspicion:
    threshold: 7
checkpoint:
  max_history: 5
"#,
        )
        .unwrap();

        assert_eq!(config.executor.max_concurrent, 4);
        assert_eq!(config.executor.sub_task_concurrency, 3);
        assert_eq!(config.segmentation.suspicion.threshold, 7);
        assert_eq!(config.segmentation.suspicion.very_short_len, 20);
        assert_eq!(config.checkpoint.max_history, 5);
    }

    #[test]
    fn llm_fallback_requires_command() {
        let err = EngineConfig::from_yaml_str("segmentation:\n  fallback: llm\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = EngineConfig::from_yaml_str(
            "segmentation:\n  fallback: llm\nllm:\n  command: tokenize\n  args: [\"--json\"]\n",
        )
        .unwrap();
        let segmenter = config.build_segmenter(None).unwrap();
        assert_eq!(segmenter.fallback_name(), "llm");
    }

    #[test]
    fn rejects_bad_policy_and_limits() {
        assert!(matches!(
            EngineConfig::from_yaml_str("segmentation:\n  suspicion:\n    threshold: 0\n"),
            Err(ConfigError::Policy(PolicyError::ZeroThreshold))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("executor:\n  max_concurrent: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_yaml_str("executor: [1, 2]"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn embedding_fallback_needs_embedder() {
        let config =
            EngineConfig::from_yaml_str("segmentation:\n  fallback: embedding\n").unwrap();
        assert!(matches!(
            config.build_segmenter(None),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn loads_from_file_and_opens_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state").join("cp.db");
        let path = dir.path().join("chunkwise.yaml");
        std::fs::write(&path, format!("checkpoint:\n  path: {}\n", db.display())).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.checkpoint_path(), db);
        config.open_store().unwrap();
        assert!(db.exists());
    }

    #[test]
    fn default_db_path_is_under_chunkwise() {
        let path = default_db_path();
        assert!(path.ends_with("chunkwise/checkpoints.db"));
    }
}
