//! Attachment and chunk models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Longest extracted text kept on an attachment row.
pub const MAX_ATTACHMENT_TEXT: usize = 5000;

/// Longest chunk text kept on a chunk row.
pub const MAX_CHUNK_TEXT: usize = 1000;

/// A stored attachment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub email_id: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub file_size: i64,
    /// Extracted text, truncated to [`MAX_ATTACHMENT_TEXT`] characters
    pub extracted_text: Option<String>,
    /// Length of the full extracted text
    pub text_length: i64,
    pub chunk_count: i64,
    pub is_processed: bool,
    pub created_at: DateTime<Utc>,
}

/// Filename and text of an attachment, for answer context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentText {
    pub filename: String,
    pub text: String,
}

/// A stored chunk row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub parent_id: String,
    pub parent_type: String,
    pub chunk_number: i64,
    pub total_chunks: i64,
    /// Truncated to [`MAX_CHUNK_TEXT`] characters
    pub chunk_text: String,
    pub token_count: i64,
    pub has_embedding: bool,
}

/// Chunk id derived from its attachment.
pub fn chunk_id(attachment_id: &str, chunk_number: usize) -> String {
    format!("{}_chunk_{}", attachment_id, chunk_number)
}

/// Truncate to at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
