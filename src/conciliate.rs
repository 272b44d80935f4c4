//! Conciliation: folding a partial stage result back into the chunk list
//!
//! Merges are keyed by `chunk_index` and resolved field by field with a
//! non-null-wins rule: a later non-null value replaces the stored one, a null
//! (or a missing update) never clears anything. Chunks no patch addresses
//! come back exactly as they went in. Every function here is pure.

use crate::chunk::{Chunk, ChunkPatch, WorkflowError};
use serde_json::Value;
use std::collections::BTreeMap;

/// Merge `updates` into `base` and return the new chunk list.
///
/// - `None` entries (failed tasks) are skipped
/// - a patch for an index with no base chunk is inserted as a new chunk
/// - otherwise only the patch's non-null values overwrite the base chunk
///
/// The result is sorted ascending by `chunk_index`.
pub fn conciliate(base: &[Chunk], updates: &[Option<ChunkPatch>]) -> Vec<Chunk> {
    let mut by_index: BTreeMap<usize, Chunk> = base
        .iter()
        .map(|chunk| (chunk.chunk_index, chunk.clone()))
        .collect();

    for patch in updates.iter().flatten() {
        match by_index.get_mut(&patch.chunk_index) {
            Some(existing) => apply_patch(existing, patch),
            None => {
                by_index.insert(patch.chunk_index, patch.clone().into_chunk());
            }
        }
    }

    by_index.into_values().collect()
}

/// Apply one patch to a chunk in place, non-null wins.
///
/// Explicit nulls already stored on the patched chunk are dropped.
pub fn apply_patch(chunk: &mut Chunk, patch: &ChunkPatch) {
    if let Some(content) = &patch.content {
        chunk.content = content.clone();
    }
    if let Some(paragraph_index) = patch.paragraph_index {
        chunk.paragraph_index = paragraph_index;
    }
    if let Some(within) = patch.chunk_index_within_paragraph {
        chunk.chunk_index_within_paragraph = within;
    }
    conciliate_fields(&mut chunk.fields, &patch.fields);
    chunk.strip_nulls();
}

/// Non-null-wins merge for a bare field map (chunk or document level).
pub fn conciliate_fields(base: &mut BTreeMap<String, Value>, update: &BTreeMap<String, Value>) {
    for (name, value) in update {
        if !value.is_null() {
            base.insert(name.clone(), value.clone());
        }
    }
}

/// Stateful wrapper used by the stage controller.
///
/// Tracks how many patches it applied so stage reports can say how much of
/// a pass actually landed.
#[derive(Debug, Default)]
pub struct Conciliator {
    applied: usize,
    skipped: usize,
}

impl Conciliator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge updates into `chunks`, replacing the list in place.
    pub fn merge_into(&mut self, chunks: &mut Vec<Chunk>, updates: &[Option<ChunkPatch>]) {
        for update in updates {
            match update {
                Some(_) => self.applied += 1,
                None => self.skipped += 1,
            }
        }
        *chunks = conciliate(chunks, updates);
    }

    /// Append recovered errors. Errors are a log, never deduplicated.
    pub fn merge_errors(&self, errors: &mut Vec<WorkflowError>, new: Vec<WorkflowError>) {
        errors.extend(new);
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }
}
