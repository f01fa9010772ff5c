use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IngestionRequest {
    Text {
        content: String,
        metadata: HashMap<String, String>,
        idempotency_key: Option<String>,
    },
    File {
        filename: String,
        content: Vec<u8>,
        mime_type: String,
        metadata: HashMap<String, String>,
        idempotency_key: Option<String>,
    },
}

impl IngestionRequest {
    pub fn text(content: String, metadata: HashMap<String, String>) -> Self {
        Self::Text {
            content,
            metadata,
            idempotency_key: None,
        }
    }

    pub fn file(
        filename: String,
        content: Vec<u8>,
        mime_type: String,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self::File {
            filename,
            content,
            mime_type,
            metadata,
            idempotency_key: None,
        }
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        match self {
            IngestionRequest::Text { idempotency_key, .. } => idempotency_key.as_deref(),
            IngestionRequest::File { idempotency_key, .. } => idempotency_key.as_deref(),
        }
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        match self {
            IngestionRequest::Text { metadata, .. } => metadata,
            IngestionRequest::File { metadata, .. } => metadata,
        }
    }
}

/// The output of a chunker: bounded text plus a free-form metadata map.
/// Metadata fields set by chunkers are normative because retrievers read
/// them (see the Chunker Registry contract).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkPiece {
    pub text: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ChunkPiece {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

pub trait ContentHash {
    fn content_hash(&self) -> String;
}

impl ContentHash for IngestionRequest {
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        match self {
            IngestionRequest::Text { content, .. } => {
                hasher.update(b"text");
                hasher.update(content.as_bytes());
            }
            IngestionRequest::File { content, mime_type, filename, .. } => {
                hasher.update(b"file");
                hasher.update(mime_type.as_bytes());
                hasher.update(filename.as_bytes());
                hasher.update(content);
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

impl ContentHash for ChunkPiece {
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_for_same_text() {
        let a = IngestionRequest::text("hello world".into(), HashMap::new());
        let b = IngestionRequest::text("hello world".into(), HashMap::new());
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_differs_for_different_text() {
        let a = IngestionRequest::text("hello".into(), HashMap::new());
        let b = IngestionRequest::text("world".into(), HashMap::new());
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
