//! Documents exchanged with the vector store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One email as stored in the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailDocument {
    pub id: String,
    pub embedding: Vec<f32>,
    /// Text that was embedded
    pub document: String,
    /// Email fields plus the `analysis` object
    pub metadata: Map<String, Value>,
}

impl EmailDocument {
    /// Reason the document cannot be stored, if any.
    pub fn validation_error(&self) -> Option<&'static str> {
        if self.id.trim().is_empty() {
            Some("missing id")
        } else if self.embedding.is_empty() {
            Some("empty embedding")
        } else if self.document.trim().is_empty() {
            Some("empty document")
        } else {
            None
        }
    }
}

/// One attachment chunk as stored in the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub id: String,
    pub attachment_id: String,
    pub email_id: String,
    pub embedding: Vec<f32>,
    pub text: String,
    pub metadata: Map<String, Value>,
}

/// A chunk returned from similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHit {
    pub id: String,
    pub attachment_id: String,
    pub email_id: String,
    pub text: String,
    pub score: f32,
}

/// Similarity of one email to a query vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankHit {
    pub email_id: String,
    pub similarity: f32,
}
