//! Service layer for mailrag.
//!
//! Contains business logic and external service integrations:
//! - Mime (message parsing and text cleanup)
//! - Imap (mailbox access behind the `MailSource` trait)
//! - Vectors (document store behind the `DocumentStore` trait, on Qdrant)
//! - EmbeddingProcessor (embed, analyse and store emails)
//! - Attachments (chunk and embed attachment text)
//! - Ingest (date-range ingestion with progress reporting)
//! - Query (thread-aware retrieval-augmented answers)

pub mod attachments;
pub mod embedding_processor;
pub mod imap;
pub mod ingest;
pub mod mime;
pub mod query;
pub mod vectors;

pub use attachments::{AttachmentProcessor, SkipReason};
pub use embedding_processor::{BatchOutcome, EmbeddingProcessor};
pub use imap::{ImapMailSource, MailSource};
pub use ingest::{IngestOutcome, IngestService, LogProgress, ProgressReporter};
pub use query::{Citation, QueryResponse, QueryService};
pub use vectors::{DocumentStore, QdrantDocumentStore};

pub use mailrag_embeddings::EmbeddingService;
pub use mailrag_llm::LlmService;
pub use mailrag_qdrant::QdrantService;
