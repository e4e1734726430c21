//! Email models.
//!
//! [`ParsedEmail`] is what the mail source hands over; [`Email`] is a stored
//! SQLite row; [`EmailSummary`] and [`SearchHit`] are read projections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An attachment found while parsing a message.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAttachment {
    pub filename: String,
    pub mime_type: String,
    /// Decoded size in bytes
    pub size: usize,
    /// Extracted text, when the type is supported
    pub text: Option<String>,
}

/// A message fetched from the mailbox, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEmail {
    pub id: String,
    pub account: String,
    pub folder: String,
    pub subject: String,
    pub sender_name: String,
    pub sender_email: String,
    pub received_time: DateTime<Utc>,
    pub sent_time: Option<DateTime<Utc>>,
    pub recipients: String,
    pub body: String,
    pub attachments: Vec<ParsedAttachment>,
    pub conversation_id: Option<String>,
    pub conversation_index: Option<i64>,
    pub internet_message_id: Option<String>,
    pub is_task: bool,
    pub unread: bool,
    pub categories: Vec<String>,
}

impl ParsedEmail {
    /// Comma-separated attachment names, as kept in the `attachments` column.
    pub fn attachment_names(&self) -> String {
        self.attachments
            .iter()
            .map(|a| a.filename.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// A stored email row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub account: String,
    pub folder: String,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub received_time: Option<DateTime<Utc>>,
    pub sent_time: Option<DateTime<Utc>>,
    pub recipients: Option<String>,
    pub is_task: bool,
    pub unread: bool,
    pub categories: Option<String>,
    pub processed: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub body: Option<String>,
    pub attachments: Option<String>,
    pub conversation_id: Option<String>,
    pub conversation_index: Option<i64>,
    pub internet_message_id: Option<String>,
}

impl Email {
    pub fn subject_or_default(&self) -> &str {
        self.subject.as_deref().unwrap_or("No Subject")
    }

    /// Conversation id, or the email's own id for standalone messages.
    pub fn thread_key(&self) -> &str {
        self.conversation_id
            .as_deref()
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.id)
    }
}

/// List projection used by `GET /emails`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSummary {
    pub id: String,
    pub subject: Option<String>,
    pub sender_name: Option<String>,
    pub sender_email: Option<String>,
    pub received_time: Option<DateTime<Utc>>,
    pub folder: String,
}

impl From<&Email> for EmailSummary {
    fn from(email: &Email) -> Self {
        Self {
            id: email.id.clone(),
            subject: email.subject.clone(),
            sender_name: email.sender_name.clone(),
            sender_email: email.sender_email.clone(),
            received_time: email.received_time,
            folder: email.folder.clone(),
        }
    }
}

/// A full-text search hit. Lower rank is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub email: Email,
    pub rank: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_similarity: Option<f32>,
}

/// Result of offering an email to the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Existing,
    Rejected,
}

impl StoreOutcome {
    /// Inserted or already present.
    pub fn is_stored(self) -> bool {
        !matches!(self, StoreOutcome::Rejected)
    }
}
