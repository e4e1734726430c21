//! Key/value sync state.

use crate::error::Result;
use crate::models::{format_timestamp, now};

use super::DbPool;

pub const LAST_SYNC_START: &str = "last_sync_start";
pub const LAST_SYNC_END: &str = "last_sync_end";
pub const LAST_SYNC_AT: &str = "last_sync_at";

pub async fn get_metadata_value(pool: &DbPool, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|(value,)| value))
}

/// Insert or replace a metadata value.
pub async fn set_metadata_value(pool: &DbPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metadata (key, value, updated_at) VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(format_timestamp(&now()))
    .execute(pool)
    .await?;

    Ok(())
}
