//! Chunk and chunk-patch types
//!
//! A chunk is the atomic unit of analysis: a span of the source document
//! plus the stage-result fields written into it by later pipeline stages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field names reserved for the chunk's own identity and content.
///
/// Stages may not claim these as output fields.
pub const CORE_FIELDS: [&str; 4] = [
    "content",
    "chunk_index",
    "paragraph_index",
    "chunk_index_within_paragraph",
];

/// Error raised when a stage input cannot be built from a chunk.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("required field '{0}' is missing")]
    MissingField(String),

    #[error("field '{field}' has an unexpected shape: {reason}")]
    InvalidField { field: String, reason: String },
}

/// One indexed span of the source document.
///
/// Stage-result fields live in `fields`, flattened next to the core fields
/// when serialized. A JSON `null` and an absent key mean the same thing:
/// the owning stage has not produced a value for this chunk yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: usize,
    pub paragraph_index: usize,
    pub chunk_index_within_paragraph: usize,
    pub content: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Chunk {
    pub fn new(
        chunk_index: usize,
        paragraph_index: usize,
        chunk_index_within_paragraph: usize,
        content: impl Into<String>,
    ) -> Self {
        Self {
            chunk_index,
            paragraph_index,
            chunk_index_within_paragraph,
            content: content.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Set a stage-result field. Setting `null` clears the field.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if value.is_null() {
            self.fields.remove(&name);
        } else {
            self.fields.insert(name, value);
        }
    }

    /// Builder form of [`Chunk::set_field`].
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_field(name, value);
        self
    }

    /// True if the field is present and non-null.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.get(name).map_or(false, |v| !v.is_null())
    }

    /// Raw access to a non-null field value.
    pub fn raw_field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    /// Deserialize a field into `T`. `Ok(None)` when the field is absent.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, serde_json::Error> {
        match self.raw_field(name) {
            Some(value) => serde_json::from_value(value.clone()).map(Some),
            None => Ok(None),
        }
    }

    /// Deserialize a field that a stage input cannot do without.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, InputError> {
        match self.field(name) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(InputError::MissingField(name.to_string())),
            Err(e) => Err(InputError::InvalidField {
                field: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Drop explicit nulls so that equality matches "absent == null".
    pub fn strip_nulls(&mut self) {
        self.fields.retain(|_, v| !v.is_null());
    }
}

/// A partial chunk produced by one executor task.
///
/// Only `chunk_index` is mandatory. Everything else is applied by the
/// conciliator with the non-null-wins rule.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChunkPatch {
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paragraph_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_index_within_paragraph: Option<usize>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl ChunkPatch {
    /// An empty patch addressed at one chunk.
    pub fn for_chunk(chunk_index: usize) -> Self {
        Self {
            chunk_index,
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// True if applying this patch could not change anything.
    pub fn is_noop(&self) -> bool {
        self.content.is_none()
            && self.paragraph_index.is_none()
            && self.chunk_index_within_paragraph.is_none()
            && self.fields.values().all(Value::is_null)
    }

    /// Materialize the patch as a chunk (used when no base chunk exists).
    pub fn into_chunk(self) -> Chunk {
        let mut chunk = Chunk {
            chunk_index: self.chunk_index,
            paragraph_index: self.paragraph_index.unwrap_or_default(),
            chunk_index_within_paragraph: self.chunk_index_within_paragraph.unwrap_or_default(),
            content: self.content.unwrap_or_default(),
            fields: self.fields,
        };
        chunk.strip_nulls();
        chunk
    }
}

impl From<Chunk> for ChunkPatch {
    fn from(chunk: Chunk) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            content: Some(chunk.content),
            paragraph_index: Some(chunk.paragraph_index),
            chunk_index_within_paragraph: Some(chunk.chunk_index_within_paragraph),
            fields: chunk.fields,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_field_null_clears() {
        let mut chunk = Chunk::new(0, 0, 0, "text").with_field("claims", json!(["a"]));
        assert!(chunk.has_field("claims"));

        chunk.set_field("claims", Value::Null);
        assert!(!chunk.has_field("claims"));
        assert!(chunk.fields.is_empty());
    }

    #[test]
    fn typed_field_access() {
        let chunk = Chunk::new(3, 1, 0, "text").with_field("claims", json!(["x", "y"]));

        let claims: Vec<String> = chunk.require("claims").unwrap();
        assert_eq!(claims, vec!["x", "y"]);

        let missing: Option<Vec<String>> = chunk.field("citations").unwrap();
        assert!(missing.is_none());

        let err = chunk.require::<Vec<String>>("citations").unwrap_err();
        assert_eq!(err, InputError::MissingField("citations".into()));

        let err = chunk.require::<u32>("claims").unwrap_err();
        assert!(matches!(err, InputError::InvalidField { .. }));
    }

    #[test]
    fn serializes_fields_flat() {
        let chunk = Chunk::new(2, 1, 1, "Sentence.").with_field("claims", json!([]));
        let value = serde_json::to_value(&chunk).unwrap();

        assert_eq!(value["chunk_index"], 2);
        assert_eq!(value["claims"], json!([]));

        let back: Chunk = serde_json::from_value(value).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn patch_from_chunk_keeps_everything() {
        let chunk = Chunk::new(4, 2, 0, "Body.").with_field("citations", json!({"n": 1}));
        let patch = ChunkPatch::from(chunk.clone());

        assert_eq!(patch.content.as_deref(), Some("Body."));
        assert_eq!(patch.into_chunk(), chunk);
    }

    #[test]
    fn patch_noop_detection() {
        assert!(ChunkPatch::for_chunk(1).is_noop());
        assert!(ChunkPatch::for_chunk(1).with_field("x", Value::Null).is_noop());
        assert!(!ChunkPatch::for_chunk(1).with_field("x", json!(1)).is_noop());
    }
}
