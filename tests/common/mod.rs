//! Shared helpers for integration tests.
//!
//! Provides an in-memory SQLite database, a scripted mail source, an
//! in-memory document store and request helpers for the router.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};
use tower::ServiceExt;

use mailrag::config::Config;
use mailrag::db::{self, DbPool};
use mailrag::models::{ChunkDocument, ChunkHit, EmailDocument, ParsedAttachment, ParsedEmail, RerankHit};
use mailrag::services::{DocumentStore, EmbeddingService, LlmService, MailSource};
use mailrag::{AppState, Error, Result};
use mailrag_embeddings::{EmbeddingConfig, EmbeddingProviderConfig};
use mailrag_llm::{LlmConfig, LlmProviderConfig, RetryPolicy};

pub const ACCOUNT: &str = "me@example.com";
pub const DIMENSION: usize = 16;

// ============================================================================
// Backends
// ============================================================================

/// Fresh in-memory database with the schema applied.
pub async fn memory_db() -> DbPool {
    let pool = db::init_pool(":memory:").await.expect("in-memory pool");
    db::initialize_schema(&pool).await.expect("schema");
    pool
}

/// Configuration for tests: no analysis delay, defaults elsewhere.
pub fn test_config() -> Config {
    let mut config = Config::from_env();
    config.database.path = ":memory:".to_string();
    config.rag.enable_vector_rerank = true;
    config.rag.top_k = 8;
    config.ingest.max_range_days = 30;
    config.ingest.chunk_size = 800;
    config.ingest.chunk_overlap = 75;
    config.ingest.max_attachment_bytes = 25 * 1024 * 1024;
    config.ingest.analysis_delay = Duration::ZERO;
    config
}

/// Embeddings without providers: deterministic hash placeholders.
pub fn hash_embeddings() -> EmbeddingService {
    EmbeddingService::from_config(&EmbeddingConfig {
        providers: Vec::new(),
        dimension: DIMENSION,
    })
    .expect("embedding service")
}

/// Embeddings served by a mocked Ollama at `base_url`.
pub fn ollama_embeddings(base_url: &str) -> EmbeddingService {
    EmbeddingService::from_config(&EmbeddingConfig {
        providers: vec![EmbeddingProviderConfig {
            name: "ollama".to_string(),
            base_url: base_url.to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: String::new(),
            priority: 1,
        }],
        dimension: 3,
    })
    .expect("embedding service")
}

pub fn no_llm() -> LlmService {
    LlmService::new(&LlmConfig::default()).expect("llm service")
}

/// LLM served by a mocked OpenAI-compatible endpoint at `base_url`.
pub fn mock_llm(base_url: &str) -> LlmService {
    LlmService::new(&LlmConfig {
        providers: vec![LlmProviderConfig {
            name: "sarvam".to_string(),
            base_url: base_url.to_string(),
            model: "sarvam-m".to_string(),
            api_key: "test-key".to_string(),
            priority: 1,
        }],
        retry: RetryPolicy {
            max_retries: 1,
            retry_delay: Duration::from_millis(1),
            rate_limit_delay: Duration::from_millis(1),
        },
    })
    .expect("llm service")
}

/// Chat completion body returning `content`.
pub fn chat_reply(content: &str) -> Value {
    serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

// ============================================================================
// Mail source
// ============================================================================

/// Mail source that hands out a fixed set of emails.
#[derive(Default)]
pub struct FakeMailSource {
    emails: Mutex<Vec<ParsedEmail>>,
    error: Option<String>,
}

impl FakeMailSource {
    pub fn new(emails: Vec<ParsedEmail>) -> Self {
        Self {
            emails: Mutex::new(emails),
            error: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            emails: Mutex::new(Vec::new()),
            error: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl MailSource for FakeMailSource {
    fn account(&self) -> &str {
        ACCOUNT
    }

    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ParsedEmail>> {
        if let Some(message) = &self.error {
            return Err(Error::Imap(message.clone()));
        }

        let emails = self.emails.lock().unwrap();
        Ok(emails
            .iter()
            .filter(|e| {
                let day = e.received_time.date_naive();
                day >= start && day <= end
            })
            .cloned()
            .collect())
    }
}

// ============================================================================
// Document store
// ============================================================================

/// Document store kept in memory, ranking by cosine similarity.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    pub emails: Mutex<HashMap<String, EmailDocument>>,
    pub chunks: Mutex<Vec<ChunkDocument>>,
    failures_left: AtomicU32,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls to `add_documents`.
    pub fn failing_adds(n: u32) -> Self {
        let store = Self::default();
        store.failures_left.store(n, Ordering::SeqCst);
        store
    }

    pub fn email_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.emails.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn insert_document(&self, id: &str, embedding: Vec<f32>, metadata: Map<String, Value>) {
        self.emails.lock().unwrap().insert(
            id.to_string(),
            EmailDocument {
                id: id.to_string(),
                embedding,
                document: format!("Subject: {}", id),
                metadata,
            },
        );
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn ensure_collections(&self, _dimension: usize) -> Result<()> {
        Ok(())
    }

    async fn add_documents(&self, docs: Vec<EmailDocument>) -> Result<usize> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::VectorStore("store unavailable".to_string()));
        }

        let mut emails = self.emails.lock().unwrap();
        let mut written = 0;
        for doc in docs {
            if doc.validation_error().is_some() || emails.contains_key(&doc.id) {
                continue;
            }
            emails.insert(doc.id.clone(), doc);
            written += 1;
        }
        Ok(written)
    }

    async fn email_exists(&self, email_id: &str) -> Result<bool> {
        Ok(self.emails.lock().unwrap().contains_key(email_id))
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.emails.lock().unwrap().len() as u64)
    }

    async fn get_metadata(&self, email_id: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self
            .emails
            .lock()
            .unwrap()
            .get(email_id)
            .map(|d| d.metadata.clone()))
    }

    async fn add_chunks(&self, chunks: Vec<ChunkDocument>) -> Result<usize> {
        let written = chunks.len();
        self.chunks.lock().unwrap().extend(chunks);
        Ok(written)
    }

    async fn search_chunks(&self, vector: Vec<f32>, top_k: usize) -> Result<Vec<ChunkHit>> {
        let chunks = self.chunks.lock().unwrap();
        let mut hits: Vec<ChunkHit> = chunks
            .iter()
            .map(|c| ChunkHit {
                id: c.id.clone(),
                attachment_id: c.attachment_id.clone(),
                email_id: c.email_id.clone(),
                text: c.text.clone(),
                score: cosine(&c.embedding, &vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn rerank(
        &self,
        email_ids: &[String],
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<RerankHit>> {
        let emails = self.emails.lock().unwrap();
        let mut hits: Vec<RerankHit> = email_ids
            .iter()
            .filter_map(|id| emails.get(id))
            .map(|d| RerankHit {
                email_id: d.id.clone(),
                similarity: cosine(&d.embedding, &vector),
            })
            .collect();
        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(top_k);
        Ok(hits)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

/// A fetched email with sensible defaults.
pub fn parsed_email(id: &str, subject: &str, body: &str, received: DateTime<Utc>) -> ParsedEmail {
    ParsedEmail {
        id: id.to_string(),
        account: ACCOUNT.to_string(),
        folder: "INBOX".to_string(),
        subject: subject.to_string(),
        sender_name: "Ann Lee".to_string(),
        sender_email: "ann@example.com".to_string(),
        received_time: received,
        sent_time: Some(received),
        recipients: "team@example.com".to_string(),
        body: body.to_string(),
        attachments: Vec::new(),
        conversation_id: None,
        conversation_index: None,
        internet_message_id: Some(id.to_string()),
        is_task: false,
        unread: false,
        categories: Vec::new(),
    }
}

/// A fetched email belonging to `conversation_id`.
pub fn thread_email(
    id: &str,
    conversation_id: &str,
    subject: &str,
    body: &str,
    received: DateTime<Utc>,
) -> ParsedEmail {
    ParsedEmail {
        conversation_id: Some(conversation_id.to_string()),
        ..parsed_email(id, subject, body, received)
    }
}

pub fn text_attachment(filename: &str, text: &str) -> ParsedAttachment {
    ParsedAttachment {
        filename: filename.to_string(),
        mime_type: "text/plain".to_string(),
        size: text.len(),
        text: Some(text.to_string()),
    }
}

/// Store `emails` directly in the relational store.
pub async fn seed(pool: &DbPool, emails: &[ParsedEmail]) {
    for email in emails {
        db::add_or_update_email(pool, email).await.expect("seed email");
    }
}

// ============================================================================
// Application
// ============================================================================

pub async fn build_state(
    db: DbPool,
    store: Arc<dyn DocumentStore>,
    source: Arc<dyn MailSource>,
    embeddings: EmbeddingService,
    llm: LlmService,
) -> AppState {
    AppState::from_parts(&test_config(), db, store, source, embeddings, llm)
        .await
        .expect("app state")
}

/// Router over an in-memory database, an empty mailbox and no LLM.
pub async fn test_app() -> (Router, AppState, Arc<InMemoryDocumentStore>) {
    let store = Arc::new(InMemoryDocumentStore::new());
    let state = build_state(
        memory_db().await,
        store.clone(),
        Arc::new(FakeMailSource::default()),
        hash_embeddings(),
        no_llm(),
    )
    .await;
    (mailrag::api::router(state.clone()), state, store)
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

pub async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

pub async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}
