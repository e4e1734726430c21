//! LLM service with multi-provider fallback.
//!
//! Supports Sarvam, Gemini, Anthropic (Claude), OpenRouter and OpenAI with
//! automatic fallback when rate limits are hit or providers fail. The
//! [`analysis`] module builds structured email analyses on top of it.

pub mod analysis;

pub use analysis::{EmailAnalysis, ANALYSIS_BATCH_SIZE};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Minimum interval between health checks (to avoid costs)
const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Number of consecutive errors before marking unavailable
const ERROR_THRESHOLD: u32 = 3;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

/// Error types for the LLM service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("No providers configured")]
    NoProviders,

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimitExceeded | Error::Request(_) => true,
            Error::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub priority: u8,
}

/// How a single provider is retried before falling back to the next one.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per provider
    pub max_retries: u32,
    /// Wait after a failed attempt
    pub retry_delay: Duration,
    /// Wait after HTTP 429
    pub rate_limit_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

/// Configuration for the LLM service.
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub providers: Vec<LlmProviderConfig>,
    pub retry: RetryPolicy,
}

/// Sampling options for a completion.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionOptions {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            temperature: DEFAULT_TEMPERATURE,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Get default endpoint for a provider
pub fn default_endpoint(name: &str) -> String {
    match name {
        "sarvam" => "https://api.sarvam.ai/v1".to_string(),
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "anthropic" => "https://api.anthropic.com/v1".to_string(),
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        "openai" => "https://api.openai.com/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider
pub fn default_model(name: &str) -> String {
    match name {
        "sarvam" => "sarvam-m".to_string(),
        "gemini" => "gemini-1.5-flash".to_string(),
        "anthropic" => "claude-3-5-haiku-20241022".to_string(),
        "openrouter" => "meta-llama/llama-3-8b-instruct:free".to_string(),
        "openai" => "gpt-4o-mini".to_string(),
        _ => "gpt-4o-mini".to_string(),
    }
}

/// Service for LLM operations with multi-provider fallback.
///
/// Tries providers in priority order, automatically falling back
/// on rate limits or failures.
#[derive(Clone)]
pub struct LlmService {
    inner: Arc<LlmServiceInner>,
}

struct LlmServiceInner {
    providers: Vec<LlmProviderConfig>,
    retry: RetryPolicy,
    client: Client,
    /// Last error message from LLM call
    last_error: RwLock<Option<String>>,
    /// Consecutive error count
    error_count: AtomicU32,
    /// When we last recorded a failure
    last_failure: RwLock<Option<Instant>>,
}

/// Response from LLM API
#[derive(Debug, Deserialize)]
struct LlmResponse {
    choices: Option<Vec<Choice>>,
    candidates: Option<Vec<Candidate>>,     // Gemini format
    content: Option<Vec<AnthropicContent>>, // Anthropic format
    error: Option<LlmError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<Message>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct LlmError {
    message: String,
}

impl LlmService {
    /// Create LLM service from config. Providers are ordered by priority.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Request(format!("Failed to create HTTP client: {}", e)))?;

        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        if providers.is_empty() {
            warn!("No LLM providers configured");
        } else {
            info!(
                providers = ?providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
                "LLM service initialized"
            );
        }

        Ok(Self {
            inner: Arc::new(LlmServiceInner {
                providers,
                retry: config.retry.clone(),
                client,
                last_error: RwLock::new(None),
                error_count: AtomicU32::new(0),
                last_failure: RwLock::new(None),
            }),
        })
    }

    /// Get provider names in priority order
    pub fn providers(&self) -> Vec<String> {
        self.inner.providers.iter().map(|p| p.name.clone()).collect()
    }

    pub fn has_providers(&self) -> bool {
        !self.inner.providers.is_empty()
    }

    /// Check if LLM service is available.
    /// Returns false if no providers are configured, or after repeated
    /// failures until the health check interval has passed.
    pub async fn is_available(&self) -> bool {
        if self.inner.providers.is_empty() {
            return false;
        }

        let error_count = self.inner.error_count.load(Ordering::Relaxed);
        if error_count >= ERROR_THRESHOLD {
            let last_failure = self.inner.last_failure.read().await;
            if let Some(last) = *last_failure {
                if last.elapsed().as_secs() < HEALTH_CHECK_INTERVAL_SECS {
                    return false;
                }
            }
        }

        true
    }

    /// Get error info for status endpoint
    pub async fn get_error_info(&self) -> Option<(String, u32)> {
        let error = self.inner.last_error.read().await;
        error.as_ref().map(|msg| {
            let count = self.inner.error_count.load(Ordering::Relaxed);
            (msg.clone(), count)
        })
    }

    async fn record_error(&self, error: &str) {
        *self.inner.last_error.write().await = Some(error.to_string());
        *self.inner.last_failure.write().await = Some(Instant::now());
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
    }

    async fn clear_error(&self) {
        *self.inner.last_error.write().await = None;
        self.inner.error_count.store(0, Ordering::Relaxed);
    }

    /// Complete a prompt with the default temperature.
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        self.complete_with(prompt, CompletionOptions::new(max_tokens))
            .await
    }

    /// Complete a prompt with automatic provider fallback.
    pub async fn complete_with(&self, prompt: &str, options: CompletionOptions) -> Result<String> {
        if self.inner.providers.is_empty() {
            return Err(Error::NoProviders);
        }

        let mut last_error = None;

        for provider in &self.inner.providers {
            if provider.api_key.is_empty() {
                debug!(provider = %provider.name, "Skipping provider without credentials");
                continue;
            }

            match self.try_provider(provider, prompt, options).await {
                Ok(response) => {
                    self.clear_error().await;
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error_msg = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "All providers failed".to_string());
        self.record_error(&error_msg).await;

        Err(last_error.unwrap_or(Error::Llm("All providers failed".to_string())))
    }

    /// Send a minimal completion to the primary provider.
    ///
    /// Any HTTP answer in 200, 400 or 401 counts as reachable: the latter two
    /// mean the API is up but rejected the request or the key.
    pub async fn check_connection(&self) -> bool {
        let Some(provider) = self.inner.providers.first() else {
            return false;
        };

        let options = CompletionOptions::new(10);
        match self.send(provider, "Hello", options).await {
            Ok((status, _)) => {
                let reachable = matches!(
                    status,
                    StatusCode::OK | StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
                );
                if reachable {
                    info!(provider = %provider.name, "LLM connection test successful");
                } else {
                    error!(provider = %provider.name, status = %status, "LLM connection test failed");
                }
                reachable
            }
            Err(e) => {
                error!(provider = %provider.name, error = %e, "Error testing LLM connection");
                false
            }
        }
    }

    async fn try_provider(
        &self,
        provider: &LlmProviderConfig,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<String> {
        let policy = &self.inner.retry;
        let attempts = policy.max_retries.max(1);

        for attempt in 1..=attempts {
            match self.call_provider(provider, prompt, options).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = if matches!(e, Error::RateLimitExceeded) {
                        policy.rate_limit_delay
                    } else {
                        policy.retry_delay
                    };
                    warn!(
                        provider = %provider.name,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after error"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Llm(format!(
            "Provider {} failed after {} attempts",
            provider.name, attempts
        )))
    }

    async fn call_provider(
        &self,
        provider: &LlmProviderConfig,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<String> {
        debug!(
            provider = %provider.name,
            model = %provider.model,
            max_tokens = options.max_tokens,
            "Calling LLM provider"
        );

        let (status, text) = self.send(provider, prompt, options).await?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimitExceeded);
        }

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        parse_response(&provider.name, &text)
    }

    /// Issue one HTTP request and return the raw status and body.
    async fn send(
        &self,
        provider: &LlmProviderConfig,
        prompt: &str,
        options: CompletionOptions,
    ) -> Result<(StatusCode, String)> {
        let (url, body) = match provider.name.as_str() {
            "gemini" => build_gemini_request(provider, prompt, options),
            "anthropic" => build_anthropic_request(provider, prompt, options),
            _ => build_openai_request(provider, prompt, options),
        };

        let request = self
            .inner
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        let request = match provider.name.as_str() {
            "sarvam" => request.header("api-subscription-key", &provider.api_key),
            "anthropic" => request
                .header("x-api-key", &provider.api_key)
                .header("anthropic-version", "2023-06-01"),
            "gemini" => request,
            _ => request.header("Authorization", format!("Bearer {}", provider.api_key)),
        };

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Request(format!("Failed to read response: {}", e)))?;

        Ok((status, text))
    }
}

/// Build request for Gemini API
fn build_gemini_request(
    provider: &LlmProviderConfig,
    prompt: &str,
    options: CompletionOptions,
) -> (String, Value) {
    let url = format!(
        "{}/models/{}:generateContent?key={}",
        provider.base_url, provider.model, provider.api_key
    );

    let body = json!({
        "contents": [{
            "parts": [{"text": prompt}]
        }],
        "generationConfig": {
            "maxOutputTokens": options.max_tokens,
            "temperature": options.temperature
        }
    });

    (url, body)
}

/// Build request for OpenAI-compatible APIs (Sarvam, OpenAI, OpenRouter)
fn build_openai_request(
    provider: &LlmProviderConfig,
    prompt: &str,
    options: CompletionOptions,
) -> (String, Value) {
    let url = format!("{}/chat/completions", provider.base_url);

    let body = json!({
        "model": provider.model,
        "messages": [
            {"role": "user", "content": prompt}
        ],
        "max_tokens": options.max_tokens,
        "temperature": options.temperature
    });

    (url, body)
}

/// Build request for Anthropic Claude API
fn build_anthropic_request(
    provider: &LlmProviderConfig,
    prompt: &str,
    options: CompletionOptions,
) -> (String, Value) {
    let url = format!("{}/messages", provider.base_url);

    let body = json!({
        "model": provider.model,
        "messages": [
            {"role": "user", "content": prompt}
        ],
        "max_tokens": options.max_tokens,
        "temperature": options.temperature
    });

    (url, body)
}

/// Parse response from different API formats
fn parse_response(provider: &str, text: &str) -> Result<String> {
    let response: LlmResponse = serde_json::from_str(text)
        .map_err(|e| Error::Llm(format!("Failed to parse response: {}", e)))?;

    if let Some(error) = response.error {
        return Err(Error::Llm(error.message));
    }

    if let Some(block) = response.content.as_ref().and_then(|c| c.first()) {
        return Ok(block.text.clone());
    }

    if let Some(part) = response
        .candidates
        .as_ref()
        .and_then(|c| c.first())
        .and_then(|c| c.content.parts.first())
    {
        return Ok(part.text.clone());
    }

    if let Some(choice) = response.choices.as_ref().and_then(|c| c.first()) {
        if let Some(content) = choice.message.as_ref().and_then(|m| m.content.clone()) {
            return Ok(content);
        }
        if let Some(text) = &choice.text {
            return Ok(text.clone());
        }
    }

    Err(Error::Llm(format!("No content in {} response", provider)))
}

/// Extract JSON from LLM response text
pub fn extract_json(text: &str) -> Option<Value> {
    // Fenced json block
    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            if let Ok(json) = serde_json::from_str(&text[start..start + end]) {
                return Some(json);
            }
        }
    }

    // Any fenced block, skipping the language identifier
    if let Some(start) = text.find("```") {
        let start = start + 3;
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            if let Ok(json) = serde_json::from_str(&text[start..start + end]) {
                return Some(json);
            }
        }
    }

    // First balanced object
    if let Some(start) = text.find('{') {
        let mut depth = 0;
        let mut end = start;
        for (i, c) in text[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = start + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end > start {
            if let Ok(json) = serde_json::from_str(&text[start..end]) {
                return Some(json);
            }
        }
    }

    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            rate_limit_delay: Duration::from_millis(1),
        }
    }

    pub(crate) fn sarvam_service(base_url: &str) -> LlmService {
        LlmService::new(&LlmConfig {
            providers: vec![LlmProviderConfig {
                name: "sarvam".to_string(),
                base_url: base_url.to_string(),
                model: "sarvam-m".to_string(),
                api_key: "test-key".to_string(),
                priority: 1,
            }],
            retry: fast_retry(),
        })
        .unwrap()
    }

    pub(crate) fn chat_reply(content: &str) -> Value {
        json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[test]
    fn test_extract_json() {
        let text = r#"Here's the result:
```json
{"title": "Test", "value": 42}
```"#;
        let json = extract_json(text);
        assert_eq!(json.unwrap()["title"], "Test");

        let text = r#"The result is {"title": "Raw", "count": 5} and more text"#;
        let json = extract_json(text);
        assert_eq!(json.unwrap()["title"], "Raw");

        let text = "```\n{\"nested\": {\"a\": 1}}\n```";
        assert_eq!(extract_json(text).unwrap()["nested"]["a"], 1);

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_parse_response_formats() {
        let openai = r#"{"choices":[{"message":{"content":"hi"}}]}"#;
        assert_eq!(parse_response("openai", openai).unwrap(), "hi");

        let gemini = r#"{"candidates":[{"content":{"parts":[{"text":"g"}]}}]}"#;
        assert_eq!(parse_response("gemini", gemini).unwrap(), "g");

        let anthropic = r#"{"content":[{"type":"text","text":"a"}]}"#;
        assert_eq!(parse_response("anthropic", anthropic).unwrap(), "a");

        assert!(parse_response("openai", r#"{"choices":[]}"#).is_err());
    }

    #[tokio::test]
    async fn test_sarvam_request_uses_subscription_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("api-subscription-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("Paris")))
            .expect(1)
            .mount(&server)
            .await;

        let service = sarvam_service(&server.uri());
        let answer = service
            .complete_with("Capital of France?", CompletionOptions::new(50).temperature(0.2))
            .await
            .unwrap();

        assert_eq!(answer, "Paris");
        assert!(service.get_error_info().await.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_reply("ok")))
            .mount(&server)
            .await;

        let service = sarvam_service(&server.uri());
        assert_eq!(service.complete("hi", 10).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried_and_recorded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .expect(1)
            .mount(&server)
            .await;

        let service = sarvam_service(&server.uri());
        let err = service.complete("hi", 10).await.unwrap_err();

        assert!(matches!(err, Error::Status { status: 400, .. }));
        let (message, count) = service.get_error_info().await.unwrap();
        assert!(message.contains("400"));
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let service = LlmService::new(&LlmConfig::default()).unwrap();
        assert!(matches!(
            service.complete("hi", 10).await,
            Err(Error::NoProviders)
        ));
        assert!(!service.is_available().await);
        assert!(!service.check_connection().await);
    }

    #[tokio::test]
    async fn test_check_connection_accepts_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        assert!(sarvam_service(&server.uri()).check_connection().await);
    }

    #[tokio::test]
    async fn test_check_connection_rejects_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(!sarvam_service(&server.uri()).check_connection().await);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_endpoint("sarvam"), "https://api.sarvam.ai/v1");
        assert_eq!(default_model("sarvam"), "sarvam-m");
        assert_eq!(default_endpoint("anthropic"), "https://api.anthropic.com/v1");
        assert_eq!(default_model("openai"), "gpt-4o-mini");
    }
}
