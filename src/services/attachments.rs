//! Attachment processing: chunk, embed and store extracted text.

use std::sync::Arc;

use mailrag_chunker::{ChunkMetadata, DocumentChunker, TextChunk};
use mailrag_embeddings::EmbeddingService;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info};

use crate::db::{insert_attachment, insert_chunk, DbPool};
use crate::error::Result;
use crate::models::{
    chunk_id, new_id, now, Attachment, ChunkDocument, ChunkRecord, ParsedAttachment,
};

use super::mime::is_text_mime_type;
use super::vectors::DocumentStore;

/// Embedding requests per call when embedding chunks.
const CHUNK_EMBED_BATCH: usize = 16;

/// Why an attachment was not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge,
    Unsupported,
}

/// Chunks, embeds and records the attachments of stored emails.
#[derive(Clone)]
pub struct AttachmentProcessor {
    db: DbPool,
    embeddings: EmbeddingService,
    store: Arc<dyn DocumentStore>,
    chunker: DocumentChunker,
    max_bytes: usize,
}

impl AttachmentProcessor {
    pub fn new(
        db: DbPool,
        embeddings: EmbeddingService,
        store: Arc<dyn DocumentStore>,
        chunker: DocumentChunker,
        max_bytes: usize,
    ) -> Self {
        Self {
            db,
            embeddings,
            store,
            chunker,
            max_bytes,
        }
    }

    /// Reason to leave an attachment alone, if any.
    pub fn skip_reason(&self, attachment: &ParsedAttachment) -> Option<SkipReason> {
        if attachment.size > self.max_bytes {
            Some(SkipReason::TooLarge)
        } else if !is_text_mime_type(&attachment.mime_type) {
            Some(SkipReason::Unsupported)
        } else {
            None
        }
    }

    /// Process every attachment of an email. Returns how many were stored.
    pub async fn process_email_attachments(
        &self,
        email_id: &str,
        attachments: &[ParsedAttachment],
    ) -> usize {
        let mut stored = 0;

        for attachment in attachments {
            if let Some(reason) = self.skip_reason(attachment) {
                info!(
                    email_id,
                    filename = %attachment.filename,
                    mime_type = %attachment.mime_type,
                    reason = ?reason,
                    "Skipping attachment"
                );
                continue;
            }

            match self.process_single(email_id, attachment).await {
                Ok(()) => stored += 1,
                Err(e) => error!(
                    email_id,
                    filename = %attachment.filename,
                    error = %e,
                    "Error processing attachment"
                ),
            }
        }

        stored
    }

    async fn process_single(&self, email_id: &str, attachment: &ParsedAttachment) -> Result<()> {
        let attachment_id = new_id();
        let text = attachment.text.as_deref().unwrap_or_default();

        info!(
            filename = %attachment.filename,
            mime_type = %attachment.mime_type,
            chars = text.chars().count(),
            "Processing attachment"
        );

        let mut metadata = ChunkMetadata::new();
        metadata.insert("email_id".to_string(), email_id.to_string());
        metadata.insert("filename".to_string(), attachment.filename.clone());
        metadata.insert("mime_type".to_string(), attachment.mime_type.clone());

        let chunks = if text.trim().is_empty() {
            Vec::new()
        } else if self.chunker.should_chunk(text) {
            self.chunker.chunk_document(text, &metadata)
        } else {
            vec![self.chunker.single_chunk(text, &metadata)]
        };

        if !chunks.is_empty() {
            self.store_chunks(&attachment_id, email_id, &chunks)
                .await?;
            debug!(count = chunks.len(), filename = %attachment.filename, "Stored chunks");
        }

        insert_attachment(
            &self.db,
            &Attachment {
                id: attachment_id,
                email_id: email_id.to_string(),
                filename: attachment.filename.clone(),
                mime_type: Some(attachment.mime_type.clone()),
                file_size: attachment.size as i64,
                extracted_text: attachment.text.clone(),
                text_length: text.chars().count() as i64,
                chunk_count: chunks.len() as i64,
                is_processed: true,
                created_at: now(),
            },
        )
        .await?;

        info!(filename = %attachment.filename, "Successfully processed attachment");
        Ok(())
    }

    async fn store_chunks(
        &self,
        attachment_id: &str,
        email_id: &str,
        chunks: &[TextChunk],
    ) -> Result<()> {
        let texts: Vec<String> = chunks.iter().map(|c| c.chunk_text.clone()).collect();
        let embeddings = self.embeddings.embed_batch(texts, CHUNK_EMBED_BATCH).await?;

        let documents: Vec<ChunkDocument> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut metadata: Map<String, Value> = chunk
                    .metadata
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect();
                metadata.insert("chunk_number".into(), json!(chunk.chunk_number));
                metadata.insert("total_chunks".into(), json!(chunk.total_chunks));
                ChunkDocument {
                    id: chunk_id(attachment_id, chunk.chunk_number),
                    attachment_id: attachment_id.to_string(),
                    email_id: email_id.to_string(),
                    embedding,
                    text: chunk.chunk_text.clone(),
                    metadata,
                }
            })
            .collect();

        self.store.add_chunks(documents).await?;

        for chunk in chunks {
            insert_chunk(
                &self.db,
                &ChunkRecord {
                    id: chunk_id(attachment_id, chunk.chunk_number),
                    parent_id: attachment_id.to_string(),
                    parent_type: "attachment".to_string(),
                    chunk_number: chunk.chunk_number as i64,
                    total_chunks: chunk.total_chunks as i64,
                    chunk_text: chunk.chunk_text.clone(),
                    token_count: chunk.token_count as i64,
                    has_embedding: true,
                },
            )
            .await?;
        }

        Ok(())
    }
}
