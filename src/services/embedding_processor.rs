//! Turns stored emails into embedded, analysed documents.

use std::sync::Arc;
use std::time::Duration;

use mailrag_embeddings::EmbeddingService;
use mailrag_llm::LlmService;
use serde_json::{json, Map, Value};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::models::{format_timestamp, Email, EmailDocument};

use super::vectors::DocumentStore;

/// Attempts at writing a batch to the document store.
const STORE_ATTEMPTS: u32 = 3;

/// Result of [`EmbeddingProcessor::process_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Ids now present in the document store
    pub processed_ids: Vec<String>,
    pub failed: usize,
}

impl BatchOutcome {
    pub fn processed(&self) -> usize {
        self.processed_ids.len()
    }
}

/// Text that is embedded for an email.
pub fn create_email_content(email: &Email) -> String {
    format!(
        "\nSubject: {}\nFrom: {} <{}>\nTo: {}\nDate: {}\n\n{}\n",
        email.subject.as_deref().unwrap_or_default(),
        email.sender_name.as_deref().unwrap_or_default(),
        email.sender_email.as_deref().unwrap_or_default(),
        email.recipients.as_deref().unwrap_or_default(),
        email
            .received_time
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_default(),
        email.body.as_deref().unwrap_or_default(),
    )
}

/// Whether an email carries every field a document needs.
pub fn validate_email(email: &Email) -> bool {
    email.subject.is_some()
        && email.sender_name.is_some()
        && email.sender_email.is_some()
        && email.recipients.is_some()
        && email.received_time.is_some()
        && !email.folder.is_empty()
        && !email.account.is_empty()
        && email.body.is_some()
}

/// Metadata stored next to the embedding.
pub fn document_metadata(email: &Email) -> Map<String, Value> {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(|v| json!(v))
            .unwrap_or(Value::Null)
    };

    let mut metadata = Map::new();
    metadata.insert("Subject".into(), json!(email.subject.as_deref().unwrap_or_default()));
    metadata.insert(
        "SenderName".into(),
        json!(email.sender_name.as_deref().unwrap_or_default()),
    );
    metadata.insert(
        "SenderEmailAddress".into(),
        json!(email.sender_email.as_deref().unwrap_or_default()),
    );
    metadata.insert("To".into(), json!(email.recipients.as_deref().unwrap_or_default()));
    metadata.insert(
        "ReceivedTime".into(),
        json!(email
            .received_time
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_default()),
    );
    metadata.insert("Folder".into(), json!(email.folder));
    metadata.insert("AccountName".into(), json!(email.account));
    metadata.insert("ConversationId".into(), non_empty(&email.conversation_id));
    metadata.insert(
        "ConversationIndex".into(),
        email.conversation_index.map(|i| json!(i)).unwrap_or(Value::Null),
    );
    metadata.insert("InternetMessageId".into(), non_empty(&email.internet_message_id));
    metadata
}

/// Embeds, analyses and stores batches of emails.
#[derive(Clone)]
pub struct EmbeddingProcessor {
    embeddings: EmbeddingService,
    llm: LlmService,
    store: Arc<dyn DocumentStore>,
    analysis_delay: Duration,
    retry_delay: Duration,
}

impl EmbeddingProcessor {
    pub fn new(
        embeddings: EmbeddingService,
        llm: LlmService,
        store: Arc<dyn DocumentStore>,
        analysis_delay: Duration,
    ) -> Self {
        Self {
            embeddings,
            llm,
            store,
            analysis_delay,
            retry_delay: Duration::from_secs(1),
        }
    }

    /// Pause between document store attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Embed, analyse and store `emails`.
    ///
    /// Invalid emails count as failed. An embedding or storage failure
    /// fails every email of the batch.
    pub async fn process_batch(&self, emails: &[Email]) -> BatchOutcome {
        let mut failed = 0;
        let mut ids = Vec::new();
        let mut contents = Vec::new();
        let mut metadatas = Vec::new();

        for email in emails {
            if !validate_email(email) {
                warn!(id = %email.id, "Skipping email with missing fields");
                failed += 1;
                continue;
            }
            ids.push(email.id.clone());
            contents.push(create_email_content(email));
            metadatas.push(document_metadata(email));
        }

        if contents.is_empty() {
            return BatchOutcome {
                processed_ids: Vec::new(),
                failed,
            };
        }

        if !self.embeddings.has_providers() {
            warn!("Using hash-based placeholder embeddings, vector search will not be meaningful");
        }

        let embeddings = match self.embeddings.embed(contents.clone()).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                error!(error = %e, count = contents.len(), "Error generating embeddings");
                return BatchOutcome {
                    processed_ids: Vec::new(),
                    failed: failed + contents.len(),
                };
            }
        };

        info!(count = contents.len(), "Analyzing emails");
        let analyses = self.llm.analyze_batch(&contents, self.analysis_delay).await;

        let documents: Vec<EmailDocument> = ids
            .iter()
            .zip(embeddings)
            .zip(contents)
            .zip(metadatas)
            .zip(analyses)
            .map(|((((id, embedding), document), mut metadata), analysis)| {
                metadata.insert(
                    "analysis".into(),
                    serde_json::to_value(&analysis).unwrap_or(Value::Null),
                );
                EmailDocument {
                    id: id.clone(),
                    embedding,
                    document,
                    metadata,
                }
            })
            .collect();

        let count = documents.len();
        let mut attempt = 1;
        loop {
            match self.store.add_documents(documents.clone()).await {
                Ok(written) => {
                    info!(count, written, "Successfully added documents to document store");
                    return BatchOutcome {
                        processed_ids: ids,
                        failed,
                    };
                }
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts = STORE_ATTEMPTS,
                        error = %e,
                        "Error adding documents to document store"
                    );
                    if attempt >= STORE_ATTEMPTS {
                        return BatchOutcome {
                            processed_ids: Vec::new(),
                            failed: failed + count,
                        };
                    }
                    sleep(self.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
