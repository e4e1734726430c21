//! Structured email analysis on top of [`LlmService`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{extract_json, CompletionOptions, LlmService};

/// Emails analysed per group in [`LlmService::analyze_batch`].
pub const ANALYSIS_BATCH_SIZE: usize = 5;

const MAX_CONTENT_CHARS: usize = 2000;
const MAX_SUMMARY_CHARS: usize = 200;
const ANALYSIS_MAX_TOKENS: u32 = 500;

/// Summary, key points, sentiment, category and action items for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAnalysis {
    pub summary: String,
    pub key_points: Vec<String>,
    pub sentiment: String,
    pub category: String,
    pub action_items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EmailAnalysis {
    /// Placeholder returned when the LLM could not be reached.
    pub fn unavailable() -> Self {
        Self {
            summary: "Email analysis not available".to_string(),
            key_points: Vec::new(),
            sentiment: "neutral".to_string(),
            category: "uncategorized".to_string(),
            action_items: Vec::new(),
            error: Some("Failed to analyze email".to_string()),
        }
    }

    /// Build an analysis from a model reply.
    ///
    /// JSON replies are read leniently. Anything else becomes the summary.
    pub fn from_reply(reply: &str) -> Self {
        match extract_json(reply) {
            Some(Value::Object(map)) => Self {
                summary: map
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                key_points: string_list(map.get("key_points")),
                sentiment: map
                    .get("sentiment")
                    .and_then(Value::as_str)
                    .unwrap_or("neutral")
                    .to_string(),
                category: map
                    .get("category")
                    .and_then(Value::as_str)
                    .unwrap_or("uncategorized")
                    .to_string(),
                action_items: string_list(map.get("action_items")),
                error: None,
            },
            _ => Self {
                summary: reply.chars().take(MAX_SUMMARY_CHARS).collect(),
                key_points: Vec::new(),
                sentiment: "neutral".to_string(),
                category: "uncategorized".to_string(),
                action_items: Vec::new(),
                error: None,
            },
        }
    }
}

/// A list field may come back as an array of strings or as one string.
fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn analysis_prompt(content: &str) -> String {
    let truncated: String = content.chars().take(MAX_CONTENT_CHARS).collect();
    format!(
        r#"Analyze the following email and provide:
1. A brief summary (2-3 sentences)
2. Key points (bullet points)
3. Sentiment (positive/negative/neutral)
4. Category (work/personal/spam/marketing/etc)
5. Action items (if any)

Email:
{truncated}

Provide the response in JSON format with keys: summary, key_points, sentiment, category, action_items"#
    )
}

impl LlmService {
    /// Analyse one email. Never fails: LLM errors yield [`EmailAnalysis::unavailable`].
    pub async fn analyze_email(&self, content: &str) -> EmailAnalysis {
        let options = CompletionOptions::new(ANALYSIS_MAX_TOKENS);

        match self.complete_with(&analysis_prompt(content), options).await {
            Ok(reply) => {
                debug!(reply_len = reply.len(), "Successfully analyzed email");
                EmailAnalysis::from_reply(&reply)
            }
            Err(e) => {
                warn!(error = %e, "Email analysis failed, using default analysis");
                EmailAnalysis::unavailable()
            }
        }
    }

    /// Analyse emails sequentially in groups, pausing `delay` after each request.
    pub async fn analyze_batch(&self, contents: &[String], delay: Duration) -> Vec<EmailAnalysis> {
        let mut results = Vec::with_capacity(contents.len());

        for (group, batch) in contents.chunks(ANALYSIS_BATCH_SIZE).enumerate() {
            debug!(group, size = batch.len(), "Analyzing email group");
            for content in batch {
                results.push(self.analyze_email(content).await);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }

        info!(count = results.len(), "Analyzed email batch");
        results
    }
}
