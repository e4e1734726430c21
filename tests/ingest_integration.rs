//! Ingestion pipeline tests with a scripted mailbox and in-memory stores.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use mailrag::db;
use mailrag::services::{
    AttachmentProcessor, DocumentStore, EmbeddingProcessor, IngestService, LogProgress,
    ProgressReporter,
};
use mailrag::Error;
use mailrag_chunker::DocumentChunker;
use serde_json::json;

/// Records every progress update.
#[derive(Default)]
struct RecordingProgress {
    updates: Mutex<Vec<(u8, String)>>,
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, progress: u8, message: &str) {
        self.updates
            .lock()
            .unwrap()
            .push((progress, message.to_string()));
    }
}

fn mailbox() -> Vec<mailrag::models::ParsedEmail> {
    let mut with_attachment =
        parsed_email("<b@x>", "Budget numbers", "Numbers attached", at(2024, 1, 3, 9));
    with_attachment.attachments = vec![text_attachment("budget.csv", "team,amount\nops,1200\n")];

    vec![
        parsed_email("<a@x>", "Launch plan", "We launch on Monday", at(2024, 1, 2, 9)),
        with_attachment,
        parsed_email("<old@x>", "Old news", "Out of range", at(2023, 11, 1, 9)),
    ]
}

#[tokio::test]
async fn test_ingest_stores_embeds_and_marks_processed() {
    let pool = memory_db().await;
    let store = Arc::new(InMemoryDocumentStore::new());
    let state = build_state(
        pool.clone(),
        store.clone(),
        Arc::new(FakeMailSource::new(mailbox())),
        hash_embeddings(),
        no_llm(),
    )
    .await;

    let progress = RecordingProgress::default();
    let outcome = state
        .ingest
        .process_emails("2024-01-01", "2024-01-05", &progress)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.processed_count, Some(2));
    assert_eq!(
        outcome.message.as_deref(),
        Some("Successfully processed 2 emails (retrieved: 2, stored: 2, failed: 0)")
    );

    assert_eq!(store.email_ids(), vec!["<a@x>", "<b@x>"]);
    let metadata = store.get_metadata("<b@x>").await.unwrap().unwrap();
    assert_eq!(metadata["Subject"], json!("Budget numbers"));
    assert_eq!(metadata["analysis"]["sentiment"], json!("neutral"));

    assert!(db::get_unprocessed_emails(&pool, 100).await.unwrap().is_empty());

    let attachments = db::list_attachments(&pool, "<b@x>").await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].filename, "budget.csv");
    assert_eq!(attachments[0].chunk_count, 1);
    assert_eq!(db::list_chunks(&pool, &attachments[0].id).await.unwrap().len(), 1);
    {
        let chunks = store.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["filename"], json!("budget.csv"));
        assert_eq!(chunks[0].metadata["email_id"], json!("<b@x>"));
        assert_eq!(chunks[0].metadata["mime_type"], json!("text/plain"));
    }

    assert_eq!(
        db::get_metadata_value(&pool, db::LAST_SYNC_START).await.unwrap().as_deref(),
        Some("2024-01-01")
    );
    assert_eq!(
        db::get_metadata_value(&pool, db::LAST_SYNC_END).await.unwrap().as_deref(),
        Some("2024-01-05")
    );

    let updates = progress.updates.lock().unwrap();
    let steps: Vec<u8> = updates.iter().map(|(p, _)| *p).collect();
    assert_eq!(steps, vec![0, 10, 40, 50, 60, 70, 70, 90, 100]);
    assert_eq!(updates[7].1, "Marking emails as processed");
    assert!(updates.contains(&(70, "Stored email 2/2".to_string())));
    assert!(updates.contains(&(40, "Retrieved 2 emails from inbox".to_string())));
}

#[tokio::test]
async fn test_second_run_has_nothing_new() {
    let pool = memory_db().await;
    let store = Arc::new(InMemoryDocumentStore::new());
    let state = build_state(
        pool.clone(),
        store.clone(),
        Arc::new(FakeMailSource::new(mailbox())),
        hash_embeddings(),
        no_llm(),
    )
    .await;

    state
        .ingest
        .process_emails("2024-01-01", "2024-01-05", &LogProgress)
        .await
        .unwrap();
    let outcome = state
        .ingest
        .process_emails("2024-01-01", "2024-01-05", &LogProgress)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.processed_count, Some(0));
    assert_eq!(outcome.message.as_deref(), Some("No new emails to process"));
    assert_eq!(db::get_email_count(&pool).await.unwrap(), 2);
    assert_eq!(db::list_attachments(&pool, "<b@x>").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_empty_mailbox() {
    let (_, state, _) = test_app().await;

    let outcome = state
        .ingest
        .process_emails("2024-01-01", "2024-01-05", &LogProgress)
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("No emails found"));
}

#[tokio::test]
async fn test_nothing_stored_is_reported() {
    let pool = memory_db().await;
    let store = Arc::new(InMemoryDocumentStore::new());
    let state = build_state(
        pool.clone(),
        store.clone(),
        Arc::new(FakeMailSource::new(vec![
            parsed_email("<a@x>", "Launch plan", "", at(2024, 1, 2, 9)),
            parsed_email("<b@x>", "", "No subject", at(2024, 1, 3, 9)),
        ])),
        hash_embeddings(),
        no_llm(),
    )
    .await;

    let progress = RecordingProgress::default();
    let outcome = state
        .ingest
        .process_emails("2024-01-01", "2024-01-05", &progress)
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Failed to store any emails in SQLite")
    );
    assert_eq!(db::get_email_count(&pool).await.unwrap(), 0);
    assert!(store.email_ids().is_empty());

    let steps: Vec<u8> = progress.updates.lock().unwrap().iter().map(|(p, _)| *p).collect();
    assert_eq!(steps, vec![0, 10, 40, 50, 60, 70]);
}

#[tokio::test]
async fn test_invalid_ranges_are_rejected() {
    let (_, state, _) = test_app().await;

    let err = state
        .ingest
        .process_emails("2024-01-01", "2024-03-01", &LogProgress)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Date range cannot exceed 30 days");

    let err = state
        .ingest
        .process_emails("2024-01-05", "2024-01-01", &LogProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = state
        .ingest
        .process_emails("soon", "2024-01-01", &LogProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidInput(_)));
}

#[tokio::test]
async fn test_mailbox_failure_is_reported() {
    let state = build_state(
        memory_db().await,
        Arc::new(InMemoryDocumentStore::new()),
        Arc::new(FakeMailSource::failing("login refused")),
        hash_embeddings(),
        no_llm(),
    )
    .await;

    let outcome = state
        .ingest
        .process_emails("2024-01-01", "2024-01-05", &LogProgress)
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("IMAP error: login refused"));
}

#[tokio::test]
async fn test_store_outage_leaves_emails_unprocessed() {
    let pool = memory_db().await;
    let store: Arc<InMemoryDocumentStore> = Arc::new(InMemoryDocumentStore::failing_adds(3));
    let embeddings = hash_embeddings();
    let llm = no_llm();

    let processor = EmbeddingProcessor::new(
        embeddings.clone(),
        llm,
        store.clone(),
        Duration::ZERO,
    )
    .with_retry_delay(Duration::from_millis(1));
    let attachments = AttachmentProcessor::new(
        pool.clone(),
        embeddings,
        store.clone(),
        DocumentChunker::new(800, 75).unwrap(),
        1024 * 1024,
    );
    let ingest = IngestService::new(
        pool.clone(),
        Arc::new(FakeMailSource::new(mailbox())),
        processor,
        attachments,
        30,
    );

    let outcome = ingest
        .process_emails("2024-01-01", "2024-01-05", &LogProgress)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.processed_count, Some(0));
    assert_eq!(
        outcome.message.as_deref(),
        Some("Successfully processed 0 emails (retrieved: 2, stored: 2, failed: 2)")
    );
    assert_eq!(db::get_unprocessed_emails(&pool, 100).await.unwrap().len(), 2);
    assert!(store.email_ids().is_empty());
}

#[tokio::test]
async fn test_store_recovers_within_retries() {
    let pool = memory_db().await;
    let store = Arc::new(InMemoryDocumentStore::failing_adds(2));
    let processor = EmbeddingProcessor::new(hash_embeddings(), no_llm(), store.clone(), Duration::ZERO)
        .with_retry_delay(Duration::from_millis(1));

    seed(&pool, &mailbox()[..2]).await;
    let emails = db::get_unprocessed_emails(&pool, 100).await.unwrap();

    let batch = processor.process_batch(&emails).await;
    assert_eq!(batch.processed(), 2);
    assert_eq!(batch.failed, 0);
    assert_eq!(store.email_ids().len(), 2);
}
