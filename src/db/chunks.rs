//! Database operations for attachment chunks.

use sqlx::FromRow;

use crate::error::Result;
use crate::models::{truncate_chars, ChunkRecord, MAX_CHUNK_TEXT};

use super::DbPool;

#[derive(Debug, FromRow)]
struct ChunkRow {
    id: String,
    parent_id: String,
    parent_type: String,
    chunk_number: i64,
    total_chunks: i64,
    chunk_text: String,
    token_count: i64,
    has_embedding: bool,
}

impl From<ChunkRow> for ChunkRecord {
    fn from(row: ChunkRow) -> Self {
        Self {
            id: row.id,
            parent_id: row.parent_id,
            parent_type: row.parent_type,
            chunk_number: row.chunk_number,
            total_chunks: row.total_chunks,
            chunk_text: row.chunk_text,
            token_count: row.token_count,
            has_embedding: row.has_embedding,
        }
    }
}

/// Insert or replace a chunk row. Chunk text is truncated on the way in.
pub async fn insert_chunk(pool: &DbPool, chunk: &ChunkRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT OR REPLACE INTO chunks (
            id, parent_id, parent_type, chunk_number, total_chunks,
            chunk_text, token_count, has_embedding
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.parent_id)
    .bind(&chunk.parent_type)
    .bind(chunk.chunk_number)
    .bind(chunk.total_chunks)
    .bind(truncate_chars(&chunk.chunk_text, MAX_CHUNK_TEXT))
    .bind(chunk.token_count)
    .bind(chunk.has_embedding)
    .execute(pool)
    .await?;

    Ok(())
}

/// Chunks of a parent in order.
pub async fn list_chunks(pool: &DbPool, parent_id: &str) -> Result<Vec<ChunkRecord>> {
    let rows: Vec<ChunkRow> = sqlx::query_as(
        r#"
        SELECT id, parent_id, parent_type, chunk_number, total_chunks,
               chunk_text, token_count, has_embedding
        FROM chunks WHERE parent_id = ? ORDER BY chunk_number
        "#,
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}
