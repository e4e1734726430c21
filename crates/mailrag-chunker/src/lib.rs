//! Boundary-aware chunking for long documents.
//!
//! Splits extracted attachment text into overlapping chunks, preferring
//! paragraph ends, then sentence ends, then word gaps as split points.
//!
//! # Example
//!
//! ```rust
//! use mailrag_chunker::{ChunkMetadata, DocumentChunker};
//!
//! let mut metadata = ChunkMetadata::new();
//! metadata.insert("filename".into(), "note.txt".into());
//!
//! let chunker = DocumentChunker::default();
//! let chunks = chunker.chunk_document("A short note.", &metadata);
//! assert_eq!(chunks.len(), 1);
//! assert!(chunks[0].is_single_chunk);
//! assert_eq!(chunks[0].metadata["filename"], "note.txt");
//! ```

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default target chunk size in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 800;

/// Default overlap between consecutive chunks in characters.
pub const DEFAULT_OVERLAP: usize = 75;

/// Distance between fallback word-gap boundaries.
const WORD_BOUNDARY_STRIDE: usize = 100;

static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n").expect("paragraph pattern is valid"));

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+\s+").expect("sentence pattern is valid"));

/// Errors raised by the chunker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid chunker configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for chunker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Caller-supplied key/value pairs copied onto every chunk.
pub type ChunkMetadata = BTreeMap<String, String>;

/// A chunk of a larger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Sequence number, starting at 0
    pub chunk_number: usize,
    /// Number of chunks the document was split into
    pub total_chunks: usize,
    /// Trimmed chunk content
    pub chunk_text: String,
    /// Byte offset of the chunk start in the source text
    pub start_position: usize,
    /// Byte offset of the chunk end in the source text
    pub end_position: usize,
    /// Rough token estimate
    pub token_count: usize,
    /// Characters shared with the previous chunk
    pub overlap_chars: usize,
    /// True when the whole document fit in one chunk
    pub is_single_chunk: bool,
    /// Metadata of the source document
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

/// Splits documents on semantic boundaries with overlap.
#[derive(Debug, Clone)]
pub struct DocumentChunker {
    chunk_size: usize,
    overlap: usize,
}

impl Default for DocumentChunker {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl DocumentChunker {
    /// Create a chunker. The overlap must be smaller than the chunk size.
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be positive".into()));
        }
        if overlap >= chunk_size {
            return Err(Error::InvalidConfig(format!(
                "overlap {} must be smaller than chunk size {}",
                overlap, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Whether a text is long enough to be worth chunking (1.5x chunk size).
    pub fn should_chunk(&self, text: &str) -> bool {
        let threshold = self.chunk_size * 3 / 2;
        text.len() > threshold
    }

    /// The whole text as one chunk.
    pub fn single_chunk(&self, text: &str, metadata: &ChunkMetadata) -> TextChunk {
        TextChunk {
            chunk_number: 0,
            total_chunks: 1,
            chunk_text: text.to_string(),
            start_position: 0,
            end_position: text.len(),
            token_count: estimate_tokens(text),
            overlap_chars: 0,
            is_single_chunk: true,
            metadata: metadata.clone(),
        }
    }

    /// Split a document into chunks, each carrying `metadata`.
    pub fn chunk_document(&self, text: &str, metadata: &ChunkMetadata) -> Vec<TextChunk> {
        if text.is_empty() {
            return Vec::new();
        }

        if text.len() <= self.chunk_size {
            return vec![self.single_chunk(text, metadata)];
        }

        let boundaries = detect_boundaries(text);
        let mut chunks = self.split_on_boundaries(text, &boundaries, metadata);

        let total = chunks.len();
        for chunk in &mut chunks {
            chunk.total_chunks = total;
        }

        debug!(
            chunks = total,
            avg_size = chunks.iter().map(|c| c.chunk_text.len()).sum::<usize>() / total.max(1),
            "Chunked document"
        );

        chunks
    }

    fn split_on_boundaries(
        &self,
        text: &str,
        boundaries: &[usize],
        metadata: &ChunkMetadata,
    ) -> Vec<TextChunk> {
        let len = text.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < len {
            let target = start + self.chunk_size;

            let end = if target >= len {
                len
            } else {
                let end = match nearest_boundary(boundaries, target) {
                    Some(b) if b <= target + self.chunk_size / 2 => b,
                    _ => target,
                };
                ceil_char_boundary(text, end)
            };

            let raw = &text[start..end];
            let chunk_number = chunks.len();

            chunks.push(TextChunk {
                chunk_number,
                total_chunks: 0,
                chunk_text: raw.trim().to_string(),
                start_position: start,
                end_position: end,
                token_count: estimate_tokens(raw),
                overlap_chars: if chunk_number > 0 { self.overlap } else { 0 },
                is_single_chunk: false,
                metadata: metadata.clone(),
            });

            if end >= len {
                break;
            }

            let next = ceil_char_boundary(text, end.saturating_sub(self.overlap));
            start = if next > start { next } else { end };
        }

        chunks
    }
}

/// Candidate split points: paragraph ends, sentence ends, and the next
/// space after every hundredth character.
fn detect_boundaries(text: &str) -> Vec<usize> {
    let mut boundaries: Vec<usize> = PARAGRAPH_BREAK
        .find_iter(text)
        .map(|m| m.end())
        .chain(SENTENCE_END.find_iter(text).map(|m| m.end()))
        .collect();

    let mut i = 0;
    while i < text.len() {
        let from = ceil_char_boundary(text, i);
        if let Some(offset) = text[from..].find(' ') {
            boundaries.push(from + offset);
        }
        i += WORD_BOUNDARY_STRIDE;
    }

    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries
}

/// First boundary at or after `position`.
fn nearest_boundary(boundaries: &[usize], position: usize) -> Option<usize> {
    let idx = boundaries.partition_point(|&b| b < position);
    boundaries.get(idx).copied()
}

fn ceil_char_boundary(text: &str, mut pos: usize) -> usize {
    if pos >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

/// Roughly 0.75 tokens per character.
pub fn estimate_tokens(text: &str) -> usize {
    text.len() * 3 / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraphs(count: usize) -> String {
        (0..count)
            .map(|i| {
                format!(
                    "Paragraph {} talks about the quarterly budget review. \
                     It has several sentences! Does it ask questions? It does.",
                    i
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    #[test]
    fn test_empty_text_has_no_chunks() {
        assert!(DocumentChunker::default().chunk_document("", &ChunkMetadata::new()).is_empty());
    }

    #[test]
    fn test_short_text_is_single_chunk() {
        let chunks = DocumentChunker::default().chunk_document("Hello there.", &ChunkMetadata::new());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_single_chunk);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].chunk_text, "Hello there.");
        assert_eq!(chunks[0].end_position, 12);
    }

    #[test]
    fn test_long_text_is_split_with_overlap() {
        let text = paragraphs(40);
        let chunker = DocumentChunker::default();
        let chunks = chunker.chunk_document(&text, &ChunkMetadata::new());

        assert!(chunks.len() > 1);
        let total = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_number, i);
            assert_eq!(chunk.total_chunks, total);
            assert!(!chunk.is_single_chunk);
            assert!(chunk.end_position - chunk.start_position <= 800 + 400);
        }

        assert_eq!(chunks[0].overlap_chars, 0);
        assert_eq!(chunks[1].overlap_chars, 75);
        assert_eq!(chunks[1].start_position, chunks[0].end_position - 75);
        assert_eq!(chunks.last().map(|c| c.end_position), Some(text.len()));
    }

    #[test]
    fn test_chunks_end_on_boundaries_when_available() {
        let text = paragraphs(40);
        let chunks = DocumentChunker::default().chunk_document(&text, &ChunkMetadata::new());
        let first = &chunks[0];
        let tail = &text[..first.end_position];
        assert!(
            tail.ends_with(' ') || tail.ends_with('\n') || text[first.end_position..].starts_with(' '),
            "chunk should end near whitespace"
        );
    }

    #[test]
    fn test_text_without_spaces_falls_back_to_target() {
        let text = "x".repeat(2000);
        let chunks = DocumentChunker::default().chunk_document(&text, &ChunkMetadata::new());
        assert_eq!(chunks[0].end_position, 800);
        assert_eq!(chunks[1].start_position, 725);
    }

    #[test]
    fn test_multibyte_text_does_not_panic() {
        let text = "é".repeat(1500);
        let chunks = DocumentChunker::default().chunk_document(&text, &ChunkMetadata::new());
        assert!(chunks.len() > 1);
        for chunk in chunks {
            assert!(chunk.chunk_text.chars().all(|c| c == 'é'));
        }
    }

    #[test]
    fn test_single_chunk_covers_text() {
        let chunk = DocumentChunker::default().single_chunk("short note", &ChunkMetadata::new());
        assert_eq!(chunk.total_chunks, 1);
        assert_eq!(chunk.end_position, 10);
        assert_eq!(chunk.token_count, 7);
        assert!(chunk.is_single_chunk);
    }

    #[test]
    fn test_metadata_is_carried_into_every_chunk() {
        let mut metadata = ChunkMetadata::new();
        metadata.insert("filename".to_string(), "report.txt".to_string());
        metadata.insert("email_id".to_string(), "<m1@example.com>".to_string());

        let chunks = DocumentChunker::default().chunk_document(&paragraphs(40), &metadata);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.metadata == metadata));
    }

    #[test]
    fn test_should_chunk_threshold() {
        let chunker = DocumentChunker::default();
        assert!(!chunker.should_chunk(&"a".repeat(1200)));
        assert!(chunker.should_chunk(&"a".repeat(1201)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(DocumentChunker::new(100, 100).is_err());
        assert!(DocumentChunker::new(0, 0).is_err());
        assert!(DocumentChunker::new(100, 10).is_ok());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("abcd"), 3);
        assert_eq!(estimate_tokens(""), 0);
    }
}
