//! Data models for mailrag.
//!
//! Defines the email types produced by the mail source, the rows kept in
//! SQLite, and the documents written to the vector store.

mod attachment;
mod document;
mod email;

pub use attachment::*;
pub use document::*;
pub use email::*;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

/// Generate a new UUID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Canonical text form for stored timestamps (sorts chronologically).
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// Parse a stored timestamp: RFC 3339, or SQLite's `YYYY-MM-DD HH:MM:SS`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}
