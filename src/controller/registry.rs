//! Stage registry and wave planning

use super::stage::{ChunkStage, DocumentStage, DynChunkStage};
use super::ControllerError;
use crate::chunk::CORE_FIELDS;
use std::sync::Arc;

/// A registered stage of either kind.
#[derive(Clone)]
pub enum RegisteredStage {
    Chunk(Arc<dyn DynChunkStage>),
    Document(Arc<dyn DocumentStage>),
}

impl RegisteredStage {
    pub fn id(&self) -> &str {
        match self {
            Self::Chunk(stage) => stage.stage_id(),
            Self::Document(stage) => stage.id(),
        }
    }

    pub fn reads(&self) -> Vec<String> {
        match self {
            Self::Chunk(stage) => stage.input_fields().into_iter().map(String::from).collect(),
            Self::Document(stage) => stage.reads().into_iter().map(String::from).collect(),
        }
    }

    pub fn writes(&self) -> &str {
        match self {
            Self::Chunk(stage) => stage.output_field(),
            Self::Document(stage) => stage.writes(),
        }
    }

    pub fn is_document_stage(&self) -> bool {
        matches!(self, Self::Document(_))
    }
}

impl std::fmt::Debug for RegisteredStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.is_document_stage() { "document" } else { "chunk" };
        f.debug_struct("RegisteredStage")
            .field("id", &self.id())
            .field("kind", &kind)
            .field("writes", &self.writes())
            .finish()
    }
}

/// Ordered set of stages with unique ids and unique output fields.
#[derive(Debug, Default, Clone)]
pub struct StageRegistry {
    stages: Vec<RegisteredStage>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed chunk stage.
    pub fn register_chunk<S: ChunkStage>(&mut self, stage: S) -> Result<(), ControllerError> {
        self.register(RegisteredStage::Chunk(Arc::new(stage)))
    }

    /// Register a document stage.
    pub fn register_document<S: DocumentStage + 'static>(
        &mut self,
        stage: S,
    ) -> Result<(), ControllerError> {
        self.register(RegisteredStage::Document(Arc::new(stage)))
    }

    /// Builder form of [`StageRegistry::register_chunk`].
    pub fn with_chunk_stage<S: ChunkStage>(mut self, stage: S) -> Result<Self, ControllerError> {
        self.register_chunk(stage)?;
        Ok(self)
    }

    /// Builder form of [`StageRegistry::register_document`].
    pub fn with_document_stage<S: DocumentStage + 'static>(
        mut self,
        stage: S,
    ) -> Result<Self, ControllerError> {
        self.register_document(stage)?;
        Ok(self)
    }

    pub fn register(&mut self, stage: RegisteredStage) -> Result<(), ControllerError> {
        let id = stage.id();
        let field = stage.writes();

        if self.stages.iter().any(|s| s.id() == id) {
            return Err(ControllerError::DuplicateStage(id.to_string()));
        }
        if CORE_FIELDS.contains(&field) {
            return Err(ControllerError::CoreFieldWrite {
                stage: id.to_string(),
                field: field.to_string(),
            });
        }
        if let Some(owner) = self.stages.iter().find(|s| s.writes() == field) {
            return Err(ControllerError::FieldOwnership {
                field: field.to_string(),
                owner: owner.id().to_string(),
                stage: id.to_string(),
            });
        }

        self.stages.push(stage);
        Ok(())
    }

    pub fn stages(&self) -> &[RegisteredStage] {
        &self.stages
    }

    pub fn get(&self, id: &str) -> Option<&RegisteredStage> {
        self.stages.iter().find(|s| s.id() == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Group stages into waves, as positions into [`StageRegistry::stages`].
    ///
    /// A stage lands in the first wave after every earlier-registered stage
    /// that writes a field it reads. Writers registered later are not
    /// dependencies: the stage sees whatever value the state already holds.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut wave_of: Vec<usize> = Vec::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            let reads = stage.reads();
            let wave = self.stages[..i]
                .iter()
                .enumerate()
                .filter(|(_, earlier)| reads.iter().any(|r| r == earlier.writes()))
                .map(|(j, _)| wave_of[j] + 1)
                .max()
                .unwrap_or(0);
            wave_of.push(wave);
        }

        let count = wave_of.iter().copied().max().map_or(0, |m| m + 1);
        let mut waves = vec![Vec::new(); count];
        for (i, wave) in wave_of.into_iter().enumerate() {
            waves[wave].push(i);
        }
        waves
    }
}
