//! Document store for email embeddings and attachment chunks.
//!
//! The [`DocumentStore`] trait is what ingestion and retrieval depend on;
//! [`QdrantDocumentStore`] backs it with two Qdrant collections.

use std::collections::HashMap;

use async_trait::async_trait;
use mailrag_qdrant::{QdrantService, SearchFilter, VectorPoint, VectorSearchResult};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ChunkDocument, ChunkHit, EmailDocument, RerankHit};

pub const EMAILS_COLLECTION: &str = "emails";
pub const CHUNKS_COLLECTION: &str = "chunks";

/// Storage for embedded emails and chunks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the collections for vectors of `dimension`.
    async fn ensure_collections(&self, dimension: usize) -> Result<()>;

    /// Store documents whose id is not present yet. Invalid documents are
    /// skipped. Returns how many were written.
    async fn add_documents(&self, docs: Vec<EmailDocument>) -> Result<usize>;

    async fn email_exists(&self, email_id: &str) -> Result<bool>;

    /// Number of stored email documents.
    async fn count(&self) -> Result<u64>;

    /// Metadata stored with an email, including its `analysis`.
    async fn get_metadata(&self, email_id: &str) -> Result<Option<Map<String, Value>>>;

    async fn add_chunks(&self, chunks: Vec<ChunkDocument>) -> Result<usize>;

    async fn search_chunks(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ChunkHit>>;

    /// Similarity of the given emails to `vector`, best first.
    async fn rerank(
        &self,
        email_ids: &[String],
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<RerankHit>>;
}

/// Point id of a document: a name-based UUID of its id.
pub fn point_id(document_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, document_id.as_bytes()).to_string()
}

/// [`DocumentStore`] on Qdrant.
#[derive(Clone)]
pub struct QdrantDocumentStore {
    qdrant: QdrantService,
}

impl QdrantDocumentStore {
    pub fn new(qdrant: QdrantService) -> Self {
        Self { qdrant }
    }

    fn payload_str(result: &VectorSearchResult, key: &str) -> String {
        result
            .payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl DocumentStore for QdrantDocumentStore {
    async fn ensure_collections(&self, dimension: usize) -> Result<()> {
        self.qdrant.create_collection(EMAILS_COLLECTION, dimension).await?;
        self.qdrant.create_collection(CHUNKS_COLLECTION, dimension).await?;
        Ok(())
    }

    async fn add_documents(&self, docs: Vec<EmailDocument>) -> Result<usize> {
        let valid: Vec<EmailDocument> = docs
            .into_iter()
            .filter(|doc| match doc.validation_error() {
                Some(reason) => {
                    warn!(id = %doc.id, reason, "Skipping invalid document");
                    false
                }
                None => true,
            })
            .collect();

        if valid.is_empty() {
            return Ok(0);
        }

        let ids: Vec<String> = valid.iter().map(|d| point_id(&d.id)).collect();
        let existing: Vec<String> = self
            .qdrant
            .get_points(EMAILS_COLLECTION, ids)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let points: Vec<VectorPoint> = valid
            .into_iter()
            .filter(|doc| {
                let exists = existing.contains(&point_id(&doc.id));
                if exists {
                    debug!(id = %doc.id, "Document already stored, skipping");
                }
                !exists
            })
            .map(|doc| {
                let mut payload = HashMap::new();
                payload.insert("email_id".to_string(), json!(doc.id));
                payload.insert("document".to_string(), json!(doc.document));
                payload.insert("metadata".to_string(), Value::Object(doc.metadata));
                VectorPoint {
                    id: point_id(&doc.id),
                    vector: doc.embedding,
                    payload,
                }
            })
            .collect();

        let written = points.len();
        if written > 0 {
            self.qdrant.upsert_batch(EMAILS_COLLECTION, points).await?;
        }

        info!(written, skipped_existing = existing.len(), "Stored email documents");
        Ok(written)
    }

    async fn email_exists(&self, email_id: &str) -> Result<bool> {
        let found = self
            .qdrant
            .get_points(EMAILS_COLLECTION, vec![point_id(email_id)])
            .await?;
        Ok(!found.is_empty())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.qdrant.count(EMAILS_COLLECTION).await?)
    }

    async fn get_metadata(&self, email_id: &str) -> Result<Option<Map<String, Value>>> {
        let found = self
            .qdrant
            .get_points(EMAILS_COLLECTION, vec![point_id(email_id)])
            .await?;

        Ok(found.into_iter().next().and_then(|mut p| {
            match p.payload.remove("metadata") {
                Some(Value::Object(map)) => Some(map),
                _ => None,
            }
        }))
    }

    async fn add_chunks(&self, chunks: Vec<ChunkDocument>) -> Result<usize> {
        let points: Vec<VectorPoint> = chunks
            .into_iter()
            .filter(|c| !c.embedding.is_empty() && !c.text.trim().is_empty())
            .map(|chunk| {
                let mut payload = HashMap::new();
                payload.insert("chunk_id".to_string(), json!(chunk.id));
                payload.insert("attachment_id".to_string(), json!(chunk.attachment_id));
                payload.insert("email_id".to_string(), json!(chunk.email_id));
                payload.insert("text".to_string(), json!(chunk.text));
                payload.insert("metadata".to_string(), Value::Object(chunk.metadata));
                VectorPoint {
                    id: point_id(&chunk.id),
                    vector: chunk.embedding,
                    payload,
                }
            })
            .collect();

        let written = points.len();
        if written > 0 {
            self.qdrant.upsert_batch(CHUNKS_COLLECTION, points).await?;
        }
        Ok(written)
    }

    async fn search_chunks(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ChunkHit>> {
        let results = self.qdrant.search(CHUNKS_COLLECTION, vector, top_k, None).await?;

        Ok(results
            .iter()
            .map(|r| ChunkHit {
                id: Self::payload_str(r, "chunk_id"),
                attachment_id: Self::payload_str(r, "attachment_id"),
                email_id: Self::payload_str(r, "email_id"),
                text: Self::payload_str(r, "text"),
                score: r.score,
            })
            .collect())
    }

    async fn rerank(
        &self,
        email_ids: &[String],
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<RerankHit>> {
        if email_ids.is_empty() {
            return Ok(Vec::new());
        }

        let filter = SearchFilter::new().with_any("email_id", email_ids.to_vec());
        let results = self
            .qdrant
            .search(EMAILS_COLLECTION, vector, top_k, Some(filter))
            .await?;

        Ok(results
            .iter()
            .map(|r| RerankHit {
                email_id: Self::payload_str(r, "email_id"),
                similarity: r.score,
            })
            .collect())
    }
}
