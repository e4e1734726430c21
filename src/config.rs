//! Configuration management for mailrag.
//!
//! Loads configuration from environment variables (and `.env`) with support for:
//! - IMAP mailbox credentials
//! - Multiple LLM providers with fallback priority
//! - Embedding providers, the SQLite path and the Qdrant connection

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

use mailrag_embeddings::{EmbeddingConfig, EmbeddingProviderConfig, PLACEHOLDER_DIMENSION};
use mailrag_llm::{LlmConfig, LlmProviderConfig, RetryPolicy};
use mailrag_qdrant::QdrantConfig;
use tracing::info;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Initialize configuration (call once at startup)
pub fn init() -> &'static Config {
    config()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub qdrant: QdrantConfig,
    pub imap: ImapConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub rag: RagConfig,
    pub ingest: IngestConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub server: String,
    pub port: u16,
    pub email: Option<String>,
    pub password: Option<String>,
    pub folder: String,
}

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub enable_vector_rerank: bool,
    pub top_k: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enable_vector_rerank: true,
            top_k: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Longest accepted date range, in days
    pub max_range_days: i64,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Attachments above this size are skipped
    pub max_attachment_bytes: usize,
    /// Pause between analysis requests
    pub analysis_delay: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_range_days: 30,
            chunk_size: mailrag_chunker::DEFAULT_CHUNK_SIZE,
            chunk_overlap: mailrag_chunker::DEFAULT_OVERLAP,
            max_attachment_bytes: 25 * 1024 * 1024,
            analysis_delay: Duration::from_millis(500),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            server: ServerConfig {
                host: env_or("API_HOST", "0.0.0.0"),
                port: env_parse("API_PORT", 8000),
            },
            database: DatabaseConfig {
                path: env_or("SQLITE_DB_PATH", "./data/emails.db"),
            },
            qdrant: QdrantConfig::new(
                env_or("QDRANT_URL", "http://localhost:6334"),
                env_or("QDRANT_COLLECTION_PREFIX", "mailrag_"),
            ),
            imap: ImapConfig {
                server: env_or("IMAP_SERVER", "outlook.office365.com"),
                port: env_parse("IMAP_PORT", 993),
                email: non_empty_var("EMAIL_ADDRESS"),
                password: non_empty_var("EMAIL_PASSWORD"),
                folder: env_or("IMAP_FOLDER", "INBOX"),
            },
            llm: LlmConfig {
                providers: Self::parse_llm_providers(),
                retry: RetryPolicy::default(),
            },
            embedding: Self::parse_embedding_config(),
            rag: RagConfig {
                enable_vector_rerank: env_or("ENABLE_VECTOR_RERANK", "true").to_lowercase()
                    != "false",
                top_k: env_parse("RAG_TOP_K", 8),
            },
            ingest: IngestConfig {
                max_range_days: env_parse("MAX_RANGE_DAYS", 30),
                chunk_size: env_parse("ATTACHMENT_CHUNK_SIZE", mailrag_chunker::DEFAULT_CHUNK_SIZE),
                chunk_overlap: env_parse(
                    "ATTACHMENT_CHUNK_OVERLAP",
                    mailrag_chunker::DEFAULT_OVERLAP,
                ),
                max_attachment_bytes: env_parse::<usize>("ATTACHMENT_MAX_SIZE_MB", 25) * 1024 * 1024,
                analysis_delay: Duration::from_millis(env_parse("ANALYSIS_DELAY_MS", 500)),
            },
        }
    }

    /// Parse LLM providers from environment.
    /// Sarvam first, then Gemini, Anthropic, OpenRouter and OpenAI.
    fn parse_llm_providers() -> Vec<LlmProviderConfig> {
        let mut providers = Vec::new();

        if let Some(api_key) = non_empty_var("SARVAM_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "sarvam".to_string(),
                base_url: env_or("SARVAM_BASE_URL", "https://api.sarvam.ai/v1"),
                model: env_or("SARVAM_MODEL", "sarvam-m"),
                api_key,
                priority: 1,
            });
        }

        if let Some(api_key) = non_empty_var("GOOGLE_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "gemini".to_string(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: env_or("GEMINI_MODEL", "gemini-1.5-flash"),
                api_key,
                priority: 2,
            });
        }

        if let Some(api_key) = non_empty_var("ANTHROPIC_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "anthropic".to_string(),
                base_url: "https://api.anthropic.com/v1".to_string(),
                model: env_or("ANTHROPIC_MODEL", "claude-3-5-haiku-20241022"),
                api_key,
                priority: 3,
            });
        }

        if let Some(api_key) = non_empty_var("OPENROUTER_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "openrouter".to_string(),
                base_url: "https://openrouter.ai/api/v1".to_string(),
                model: env_or("OPENROUTER_MODEL", "meta-llama/llama-3-8b-instruct:free"),
                api_key,
                priority: 4,
            });
        }

        if let Some(api_key) = non_empty_var("OPENAI_API_KEY") {
            providers.push(LlmProviderConfig {
                name: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: env_or("OPENAI_MODEL", "gpt-4o-mini"),
                api_key,
                priority: 5,
            });
        }

        providers.sort_by_key(|p| p.priority);
        providers
    }

    /// Parse embedding providers from environment.
    fn parse_embedding_config() -> EmbeddingConfig {
        let mut providers = Vec::new();

        // Local Ollama is preferred when present
        if let Some(ollama_url) = non_empty_var("OLLAMA_URL") {
            providers.push(EmbeddingProviderConfig {
                name: "ollama".to_string(),
                base_url: ollama_url,
                model: env_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
                api_key: String::new(),
                priority: env_parse("OLLAMA_PRIORITY", 1),
            });
        }

        if let Some(api_key) = non_empty_var("GOOGLE_API_KEY") {
            providers.push(EmbeddingProviderConfig {
                name: "gemini".to_string(),
                base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                model: env_or("GEMINI_EMBEDDING_MODEL", "text-embedding-004"),
                api_key,
                priority: 2,
            });
        }

        if let Some(api_key) = non_empty_var("OPENAI_API_KEY") {
            providers.push(EmbeddingProviderConfig {
                name: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: env_or("OPENAI_EMBEDDING_MODEL", "text-embedding-3-small"),
                api_key,
                priority: 3,
            });
        }

        providers.sort_by_key(|p| p.priority);

        let default_dim = providers
            .first()
            .map(|p| mailrag_embeddings::default_dimension(&p.model))
            .unwrap_or(PLACEHOLDER_DIMENSION);

        EmbeddingConfig {
            providers,
            dimension: env_parse("EMBEDDING_DIMENSION", default_dim),
        }
    }

    /// Log the effective configuration with secrets redacted.
    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  API: {}:{}", self.server.host, self.server.port);
        info!("  SQLite: {}", self.database.path);
        info!(
            "  Qdrant: {} (prefix {})",
            self.qdrant.url, self.qdrant.collection_prefix
        );
        info!(
            "  IMAP: {}:{} folder {}",
            self.imap.server, self.imap.port, self.imap.folder
        );
        info!(
            "  Email: {}",
            self.imap.email.as_deref().unwrap_or("Not set")
        );
        info!(
            "  Password: {}",
            redact_password(self.imap.password.as_deref())
        );
        for provider in &self.llm.providers {
            info!(
                "  LLM {} ({}): {}",
                provider.name,
                provider.model,
                redact_key(Some(&provider.api_key))
            );
        }
        if self.llm.providers.is_empty() {
            info!("  LLM: Not set");
        }
        for provider in &self.embedding.providers {
            let key = (!provider.api_key.is_empty()).then_some(provider.api_key.as_str());
            info!(
                "  Embeddings {} ({}): {}",
                provider.name,
                provider.model,
                if provider.name == "ollama" {
                    provider.base_url.clone()
                } else {
                    redact_key(key)
                }
            );
        }
        info!("  Embedding dimension: {}", self.embedding.dimension);
        info!(
            "  RAG: top_k {} rerank {}",
            self.rag.top_k, self.rag.enable_vector_rerank
        );
    }
}

/// `***` plus the last four characters, or `Not set`.
pub fn redact_key(key: Option<&str>) -> String {
    match key {
        Some(k) if !k.is_empty() => {
            let chars: Vec<char> = k.chars().collect();
            let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
            format!("***{}", tail)
        }
        _ => "Not set".to_string(),
    }
}

pub fn redact_password(password: Option<&str>) -> String {
    match password {
        Some(p) if !p.is_empty() => "***".to_string(),
        _ => "Not set".to_string(),
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(env::var(key).ok().as_deref(), default)
}

/// Parse a trimmed raw value, keeping `default` when absent or malformed.
fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
