//! Ingestion: fetch a date range, store, embed and analyse.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::db::{
    add_or_update_email, get_unprocessed_emails, mark_as_processed, set_metadata_value, DbPool,
    LAST_SYNC_AT, LAST_SYNC_END, LAST_SYNC_START,
};
use crate::error::{Error, Result};
use crate::models::{format_timestamp, now, StoreOutcome};

use super::attachments::AttachmentProcessor;
use super::embedding_processor::EmbeddingProcessor;
use super::imap::MailSource;

/// Unprocessed emails picked up per run.
const UNPROCESSED_LIMIT: i64 = 100;

/// Receives progress updates, 0 to 100.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: u8, message: &str);
}

/// Reports progress as log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn report(&self, progress: u8, message: &str) {
        info!(progress, "{}", message);
    }
}

/// Result of one ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestOutcome {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            processed_count: None,
            message: None,
            error: Some(error.into()),
        }
    }

    fn completed(processed_count: usize, message: impl Into<String>) -> Self {
        Self {
            success: true,
            processed_count: Some(processed_count),
            message: Some(message.into()),
            error: None,
        }
    }
}

/// Parse `YYYY-MM-DD` or a full ISO-8601 timestamp to a date.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    let value = value.trim();
    match NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        Ok(date) => Ok(date),
        Err(date_err) => DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.date_naive())
            .or_else(|_| {
                chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
                    .map(|dt| dt.date())
            })
            .map_err(|_| Error::from(date_err)),
    }
}

/// Runs ingestion against a mail source.
#[derive(Clone)]
pub struct IngestService {
    db: DbPool,
    source: Arc<dyn MailSource>,
    processor: EmbeddingProcessor,
    attachments: AttachmentProcessor,
    max_range_days: i64,
}

impl IngestService {
    pub fn new(
        db: DbPool,
        source: Arc<dyn MailSource>,
        processor: EmbeddingProcessor,
        attachments: AttachmentProcessor,
        max_range_days: i64,
    ) -> Self {
        Self {
            db,
            source,
            processor,
            attachments,
            max_range_days,
        }
    }

    /// Validate a date range.
    pub fn parse_range(&self, start: &str, end: &str) -> Result<(NaiveDate, NaiveDate)> {
        let start = parse_date(start)?;
        let end = parse_date(end)?;

        if end < start {
            return Err(Error::Validation(
                "End date must not be before start date".to_string(),
            ));
        }
        if (end - start).num_days() > self.max_range_days {
            return Err(Error::Validation(format!(
                "Date range cannot exceed {} days",
                self.max_range_days
            )));
        }

        Ok((start, end))
    }

    /// Ingest every email received between `start` and `end`.
    ///
    /// An invalid range is an error; failures after that are reported in
    /// the outcome.
    pub async fn process_emails(
        &self,
        start: &str,
        end: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome> {
        let (start, end) = self.parse_range(start, end)?;

        match self.run(start, end, progress).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(error = %e, "Ingestion failed");
                Ok(IngestOutcome::failure(e.to_string()))
            }
        }
    }

    async fn run(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome> {
        progress.report(0, "Initializing email processing");

        progress.report(10, "Fetching emails from mailbox");
        let emails = self.source.fetch_range(start, end).await?;
        let retrieved = emails.len();
        progress.report(40, &format!("Retrieved {} emails from inbox", retrieved));

        if emails.is_empty() {
            return Ok(IngestOutcome::failure("No emails found"));
        }

        progress.report(50, "Storing emails in SQLite");
        let mut stored = 0;
        for (i, email) in emails.iter().enumerate() {
            match add_or_update_email(&self.db, email).await {
                Ok(outcome) => {
                    if outcome.is_stored() {
                        stored += 1;
                    }
                    if outcome == StoreOutcome::Inserted && !email.attachments.is_empty() {
                        let count = self
                            .attachments
                            .process_email_attachments(&email.id, &email.attachments)
                            .await;
                        info!(email_id = %email.id, count, "Processed attachments");
                    }
                }
                Err(e) => warn!(id = %email.id, error = %e, "Error storing email"),
            }

            let pct = 50 + (20 * (i + 1) / retrieved) as u8;
            progress.report(pct, &format!("Stored email {}/{}", i + 1, retrieved));
        }

        if stored == 0 {
            return Ok(IngestOutcome::failure("Failed to store any emails in SQLite"));
        }

        progress.report(70, "Processing embeddings");
        let unprocessed = get_unprocessed_emails(&self.db, UNPROCESSED_LIMIT).await?;

        if unprocessed.is_empty() {
            self.record_sync(start, end).await?;
            return Ok(IngestOutcome::completed(0, "No new emails to process"));
        }

        let batch = self.processor.process_batch(&unprocessed).await;

        progress.report(90, "Marking emails as processed");
        for id in &batch.processed_ids {
            mark_as_processed(&self.db, id).await?;
        }

        self.record_sync(start, end).await?;
        progress.report(100, "Processing complete");

        let processed = batch.processed();
        Ok(IngestOutcome::completed(
            processed,
            format!(
                "Successfully processed {} emails (retrieved: {}, stored: {}, failed: {})",
                processed, retrieved, stored, batch.failed
            ),
        ))
    }

    async fn record_sync(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        set_metadata_value(&self.db, LAST_SYNC_START, &start.to_string()).await?;
        set_metadata_value(&self.db, LAST_SYNC_END, &end.to_string()).await?;
        set_metadata_value(&self.db, LAST_SYNC_AT, &format_timestamp(&now())).await?;
        Ok(())
    }
}
