//! Database layer for mailrag.
//!
//! Provides SQLite connection pooling and query modules for emails,
//! sync metadata, attachments and chunks.

mod attachments;
mod chunks;
mod emails;
mod metadata;

pub use attachments::*;
pub use chunks::*;
pub use emails::*;
pub use metadata::*;

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Type alias for the SQLite connection pool.
pub type DbPool = sqlx::SqlitePool;

/// Initialize the database connection pool.
///
/// Creates parent directories if needed. An in-memory database is held on
/// a single connection so every query sees the same data.
pub async fn init_pool(path: &str) -> Result<DbPool> {
    let in_memory = path == ":memory:" || path.contains("mode=memory");

    if !in_memory {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
    }

    let options = SqliteConnectOptions::from_str(path)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30))
        .foreign_keys(true)
        // Increase cache size (negative = KB)
        .pragma("cache_size", "-64000")
        .pragma("temp_store", "memory");

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .min_connections(1)
        .acquire_timeout(std::time::Duration::from_secs(30))
        // An idle in-memory connection must never be dropped
        .idle_timeout(if in_memory {
            None
        } else {
            Some(std::time::Duration::from_secs(600))
        })
        .max_lifetime(if in_memory {
            None
        } else {
            Some(std::time::Duration::from_secs(1800))
        })
        .connect_with(options)
        .await?;

    info!("Database pool initialized: {}", path);

    Ok(pool)
}

/// Initialize the database schema.
///
/// Applies the complete schema from schema.sql. Uses IF NOT EXISTS
/// clauses so it's safe to run multiple times.
pub async fn initialize_schema(pool: &DbPool) -> Result<()> {
    let schema = include_str!("../../schema.sql");

    info!("Initializing database schema");

    for statement in split_statements(schema) {
        sqlx::query(&statement).execute(pool).await?;
    }

    info!("Database schema initialized successfully");

    Ok(())
}

/// Split the schema into statements. Trigger bodies contain semicolons
/// and run until their closing `END;`.
fn split_statements(schema: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = Vec::new();
    let mut in_trigger = false;

    for line in schema.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        if trimmed.to_uppercase().starts_with("CREATE TRIGGER") {
            in_trigger = true;
        }

        current.push(line);

        let ends_statement = if in_trigger {
            trimmed.eq_ignore_ascii_case("END;")
        } else {
            trimmed.ends_with(';')
        };

        if ends_statement {
            let statement = current.join("\n");
            let statement = statement.trim().trim_end_matches(';').trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
            in_trigger = false;
        }
    }

    let rest = current.join("\n");
    if !rest.trim().is_empty() {
        statements.push(rest.trim().to_string());
    }

    statements
}
