//! Application state for mailrag.
//!
//! Contains the shared state that is passed to all handlers.

use std::sync::Arc;

use mailrag_chunker::DocumentChunker;

use crate::config::Config;
use crate::db::DbPool;
use crate::services::{
    AttachmentProcessor, DocumentStore, EmbeddingProcessor, EmbeddingService, ImapMailSource,
    IngestService, LlmService, MailSource, QdrantDocumentStore, QdrantService, QueryService,
};
use crate::Result;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub db: DbPool,
    /// Vector store for email documents and attachment chunks.
    pub store: Arc<dyn DocumentStore>,
    /// Embedding generation service.
    pub embeddings: EmbeddingService,
    /// LLM completion service.
    pub llm: LlmService,
    /// Question answering pipeline.
    pub query: QueryService,
    /// Date-range ingestion.
    pub ingest: IngestService,
    /// `top_k` used when a query does not set one.
    pub default_top_k: usize,
}

impl AppState {
    /// Create the application state from configuration, initializing all
    /// services.
    pub async fn new(config: &Config) -> Result<Self> {
        let db = crate::db::init_pool(&config.database.path).await?;
        crate::db::initialize_schema(&db).await?;

        let qdrant = QdrantService::new(&config.qdrant).await?;
        let store: Arc<dyn DocumentStore> = Arc::new(QdrantDocumentStore::new(qdrant));
        let embeddings = EmbeddingService::from_config(&config.embedding)?;
        let llm = LlmService::new(&config.llm)?;
        let source: Arc<dyn MailSource> = Arc::new(ImapMailSource::new(config.imap.clone()));

        Self::from_parts(config, db, store, source, embeddings, llm).await
    }

    /// Wire the services around already constructed backends.
    ///
    /// Creates the vector collections for the embedding dimension.
    pub async fn from_parts(
        config: &Config,
        db: DbPool,
        store: Arc<dyn DocumentStore>,
        source: Arc<dyn MailSource>,
        embeddings: EmbeddingService,
        llm: LlmService,
    ) -> Result<Self> {
        store.ensure_collections(embeddings.dimension()).await?;

        let chunker =
            DocumentChunker::new(config.ingest.chunk_size, config.ingest.chunk_overlap)?;

        let processor = EmbeddingProcessor::new(
            embeddings.clone(),
            llm.clone(),
            store.clone(),
            config.ingest.analysis_delay,
        );

        let attachments = AttachmentProcessor::new(
            db.clone(),
            embeddings.clone(),
            store.clone(),
            chunker,
            config.ingest.max_attachment_bytes,
        );

        let ingest = IngestService::new(
            db.clone(),
            source,
            processor,
            attachments,
            config.ingest.max_range_days,
        );

        let query = QueryService::new(
            db.clone(),
            store.clone(),
            embeddings.clone(),
            llm.clone(),
            config.rag.enable_vector_rerank,
        );

        Ok(Self {
            db,
            store,
            embeddings,
            llm,
            query,
            ingest,
            default_top_k: config.rag.top_k,
        })
    }
}
