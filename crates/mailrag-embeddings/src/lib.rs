//! Embeddings for stored emails, attachment chunks and questions.
//!
//! Vectors come from the first configured provider that answers: Ollama,
//! Gemini or OpenAI, tried by priority. Without any provider a SHA-256
//! placeholder keeps ingestion running. Placeholders carry no meaning, so
//! callers check [`EmbeddingService::has_providers`] before trusting
//! similarity scores.
//!
//! # Example
//!
//! ```no_run
//! use mailrag_embeddings::{EmbeddingConfig, EmbeddingProviderConfig, EmbeddingService};
//!
//! # async fn example() -> Result<(), mailrag_embeddings::Error> {
//! let service = EmbeddingService::from_config(&EmbeddingConfig {
//!     providers: vec![EmbeddingProviderConfig {
//!         name: "ollama".to_string(),
//!         base_url: "http://localhost:11434".to_string(),
//!         model: "nomic-embed-text".to_string(),
//!         api_key: String::new(),
//!         priority: 1,
//!     }],
//!     dimension: 768,
//! })?;
//!
//! let question = service.embed_single("when is the launch?").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Attempts per provider before moving to the next one.
const MAX_ATTEMPTS: u32 = 2;

/// Wait before the first retry; doubles after each failure.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Largest batch sent in one request.
const MAX_BATCH_SIZE: usize = 100;

/// Email bodies are cut to this many characters before embedding.
pub const MAX_INPUT_CHARS: usize = 8000;

/// Placeholder dimension when no model decides it.
pub const PLACEHOLDER_DIMENSION: usize = 384;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),

    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("{provider} returned {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} sent an unreadable response: {message}")]
    Decode { provider: String, message: String },

    #[error("{provider} returned {got} embeddings for {expected} texts")]
    CountMismatch {
        provider: String,
        expected: usize,
        got: usize,
    },

    #[error("All embedding providers failed")]
    AllProvidersFailed,
}

impl Error {
    /// Transport failures, rate limits and server errors are worth a retry.
    fn is_retryable(&self) -> bool {
        match self {
            Error::Request { .. } => true,
            Error::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Providers; sorted by priority when the service is built
    pub providers: Vec<EmbeddingProviderConfig>,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            dimension: PLACEHOLDER_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    /// `ollama`, `gemini` or `openai`
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Empty for Ollama
    pub api_key: String,
    /// Lower goes first
    pub priority: u8,
}

/// Vector size produced by a known model.
pub fn default_dimension(model: &str) -> usize {
    const KNOWN: &[(&str, usize)] = &[
        ("text-embedding-004", 768),
        ("embedding-001", 768),
        ("text-embedding-3-small", 1536),
        ("text-embedding-3-large", 3072),
        ("text-embedding-ada-002", 1536),
        ("nomic-embed-text", 768),
        ("mxbai-embed-large", 1024),
        ("bge-large", 1024),
        ("all-minilm", 384),
        ("MiniLM-L6", 384),
    ];

    KNOWN
        .iter()
        .find(|(name, _)| model.contains(name))
        .map(|(_, dimension)| *dimension)
        .unwrap_or(PLACEHOLDER_DIMENSION)
}

// ============================================================================
// Providers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Ollama,
    Gemini,
    OpenAi,
}

impl ProviderKind {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "ollama" => Ok(Self::Ollama),
            "gemini" => Ok(Self::Gemini),
            "openai" => Ok(Self::OpenAi),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct Provider {
    kind: ProviderKind,
    config: EmbeddingProviderConfig,
}

impl Provider {
    fn name(&self) -> &str {
        &self.config.name
    }

    /// Ollama runs locally without a key; hosted APIs need one.
    fn is_usable(&self) -> bool {
        self.kind == ProviderKind::Ollama || !self.config.api_key.is_empty()
    }
}

#[derive(Deserialize)]
struct OllamaReply {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct GeminiReply {
    embeddings: Vec<GeminiValues>,
}

#[derive(Deserialize)]
struct GeminiValues {
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct OpenAiReply {
    data: Vec<OpenAiItem>,
}

#[derive(Deserialize)]
struct OpenAiItem {
    embedding: Vec<f32>,
    index: usize,
}

// ============================================================================
// Service
// ============================================================================

/// Turns email text into vectors.
#[derive(Clone)]
pub struct EmbeddingService {
    inner: Arc<Inner>,
}

struct Inner {
    providers: Vec<Provider>,
    dimension: usize,
    client: Client,
}

impl EmbeddingService {
    /// Build the service. Unknown provider names are rejected.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;

        let mut providers = config
            .providers
            .iter()
            .map(|c| {
                Ok(Provider {
                    kind: ProviderKind::from_name(&c.name)?,
                    config: c.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        providers.sort_by_key(|p| p.config.priority);

        if providers.is_empty() {
            warn!(
                dimension = config.dimension,
                "No embedding provider configured, vector search will not be meaningful"
            );
        } else {
            info!(
                providers = ?providers.iter().map(Provider::name).collect::<Vec<_>>(),
                dimension = config.dimension,
                "Embedding service ready"
            );
        }

        Ok(Self {
            inner: Arc::new(Inner {
                providers,
                dimension: config.dimension,
                client,
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    /// Provider names in the order they are tried.
    pub fn providers(&self) -> Vec<String> {
        self.inner.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Whether vectors come from a real model.
    pub fn has_providers(&self) -> bool {
        !self.inner.providers.is_empty()
    }

    /// One vector per text, in input order.
    ///
    /// When providers are configured and none of them answers with exactly
    /// one vector per text, the last failure is returned.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let inputs: Vec<String> = texts.iter().map(|t| prepare_input(t)).collect();

        if !self.has_providers() {
            debug!(count = inputs.len(), "Generating placeholder embeddings");
            return Ok(inputs
                .iter()
                .map(|t| placeholder_embedding(t, self.inner.dimension))
                .collect());
        }

        let mut last_error = None;
        for provider in self.inner.providers.iter().filter(|p| p.is_usable()) {
            let outcome = self.embed_with_retries(provider, &inputs).await.and_then(|vectors| {
                if vectors.len() == inputs.len() {
                    Ok(vectors)
                } else {
                    Err(Error::CountMismatch {
                        provider: provider.name().to_string(),
                        expected: inputs.len(),
                        got: vectors.len(),
                    })
                }
            });

            match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "Embedding provider failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or(Error::AllProvidersFailed))
    }

    /// Vector for a single text, typically a question.
    pub async fn embed_single(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or(Error::AllProvidersFailed)
    }

    /// Embed in groups of `batch_size` (at most 100 per request).
    pub async fn embed_batch(&self, texts: Vec<String>, batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        let mut vectors = Vec::with_capacity(texts.len());

        for group in texts.chunks(batch_size) {
            vectors.extend(self.embed(group.to_vec()).await?);
        }

        Ok(vectors)
    }

    async fn embed_with_retries(
        &self,
        provider: &Provider,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 1;

        loop {
            match self.request(provider, texts).await {
                Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => {
                    debug!(
                        provider = provider.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying embedding request"
                    );
                    sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn request(&self, provider: &Provider, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let config = &provider.config;
        let client = &self.inner.client;

        match provider.kind {
            // The classic endpoint takes one prompt per call
            ProviderKind::Ollama => {
                let mut vectors = Vec::with_capacity(texts.len());
                for text in texts {
                    let request = client
                        .post(format!("{}/api/embeddings", config.base_url))
                        .json(&json!({ "model": config.model, "prompt": text }));
                    let reply: OllamaReply = send(provider, request).await?;
                    vectors.push(reply.embedding);
                }
                Ok(vectors)
            }
            ProviderKind::Gemini => {
                let model = format!("models/{}", config.model);
                let requests: Vec<_> = texts
                    .iter()
                    .map(|text| json!({ "model": model, "content": { "parts": [{ "text": text }] } }))
                    .collect();
                let request = client
                    .post(format!(
                        "{}/{}:batchEmbedContents?key={}",
                        config.base_url, model, config.api_key
                    ))
                    .json(&json!({ "requests": requests }));
                let reply: GeminiReply = send(provider, request).await?;
                Ok(reply.embeddings.into_iter().map(|e| e.values).collect())
            }
            ProviderKind::OpenAi => {
                let request = client
                    .post(format!("{}/embeddings", config.base_url))
                    .bearer_auth(&config.api_key)
                    .json(&json!({
                        "model": config.model,
                        "input": texts,
                        "dimensions": self.inner.dimension,
                    }));
                let mut reply: OpenAiReply = send(provider, request).await?;
                reply.data.sort_by_key(|item| item.index);
                Ok(reply.data.into_iter().map(|item| item.embedding).collect())
            }
        }
    }
}

/// Send a request and decode a successful JSON reply.
async fn send<T: DeserializeOwned>(provider: &Provider, request: RequestBuilder) -> Result<T> {
    let response = request.send().await.map_err(|e| Error::Request {
        provider: provider.name().to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| Error::Request {
        provider: provider.name().to_string(),
        message: e.to_string(),
    })?;

    if !status.is_success() {
        return Err(Error::Status {
            provider: provider.name().to_string(),
            status: status.as_u16(),
            body,
        });
    }

    serde_json::from_str(&body).map_err(|e| Error::Decode {
        provider: provider.name().to_string(),
        message: e.to_string(),
    })
}

/// Trim email text and cut it to [`MAX_INPUT_CHARS`] characters.
pub fn prepare_input(text: &str) -> String {
    let text = text.trim();
    match text.char_indices().nth(MAX_INPUT_CHARS) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

/// Deterministic stand-in vector derived from SHA-256 digests of the text.
///
/// Each 32 values come from one digest of the text and a block counter,
/// scaled to [-1, 1]; the vector is then unit-normalised.
pub fn placeholder_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dimension);
    let mut block: u32 = 0;

    while values.len() < dimension {
        let digest = Sha256::new()
            .chain_update(text.as_bytes())
            .chain_update(block.to_le_bytes())
            .finalize();
        let wanted = dimension - values.len();
        values.extend(
            digest
                .iter()
                .take(wanted)
                .map(|b| f32::from(*b) / 255.0 * 2.0 - 1.0),
        );
        block += 1;
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
    values
}
