//! Question answering over stored email (retrieval-augmented generation).
//!
//! A question is turned into a full-text query, hits are grouped into
//! conversation threads, optionally reranked by vector similarity, and the
//! resulting threads are handed to the LLM as context. The answer comes back
//! with citations to the emails it was built from.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use mailrag_embeddings::EmbeddingService;
use mailrag_llm::{CompletionOptions, LlmService};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::db::{get_attachment_texts, get_emails_by_conversation_id, search_emails_fts, DbPool};
use crate::error::Result;
use crate::models::{format_timestamp, truncate_chars, Email, SearchHit};

use super::mime::clean_html_body;
use super::vectors::DocumentStore;

static KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[\w-]+\b").expect("keyword pattern is valid"));

const STOP_WORDS: &[&str] = &[
    "the", "what", "when", "where", "who", "why", "how", "with", "about", "from", "for", "and",
    "or", "but", "did", "happened", "said", "say", "give", "me", "brief", "tell", "show", "find",
    "search", "query",
];

pub const NO_RESULTS_ANSWER: &str = "I couldn't find any relevant emails to answer your question.";

const BODY_PREVIEW_CHARS: usize = 2000;
const ATTACHMENT_PREVIEW_CHARS: usize = 500;
const ATTACHMENTS_PER_EMAIL: usize = 5;
const SNIPPET_CHARS: usize = 200;
const ANSWER_MAX_TOKENS: u32 = 500;
const ANSWER_TEMPERATURE: f32 = 0.2;

/// An email an answer was drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub sender_email: Option<String>,
    pub received_time: Option<DateTime<Utc>>,
    pub snippet: String,
}

/// Answer to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub success: bool,
    pub answer: String,
    pub citations: Vec<Citation>,
    pub retrieved_emails: Vec<SearchHit>,
}

/// Lowercased words longer than two characters, stop words removed.
pub fn extract_keywords(question: &str) -> Vec<String> {
    let lowered = question.to_lowercase();
    KEYWORD
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w))
        .map(str::to_string)
        .collect()
}

/// Full-text query for a question: keywords joined by `OR`, plus phrases of
/// adjacent keyword pairs.
pub fn build_enhanced_query(question: &str) -> String {
    let keywords = extract_keywords(question);

    let mut enhanced = if keywords.len() > 1 {
        keywords.join(" OR ")
    } else {
        question.to_string()
    };

    let phrases: Vec<String> = keywords
        .windows(2)
        .map(|pair| format!("\"{} {}\"", pair[0], pair[1]))
        .collect();

    if !phrases.is_empty() {
        enhanced = format!("({}) OR ({})", enhanced, phrases.join(" OR "));
    }

    enhanced
}

/// Whether an email mentions any keyword in its subject or body.
pub fn is_relevant(email: &Email, keywords: &[String]) -> bool {
    if keywords.is_empty() {
        return true;
    }

    let subject = email.subject.as_deref().unwrap_or_default().to_lowercase();
    let body = clean_html_body(&email.body.as_deref().unwrap_or_default().to_lowercase());

    keywords
        .iter()
        .any(|k| subject.contains(k.as_str()) || body.contains(k.as_str()))
}

/// Truncate to `max` characters, marking the cut with `...`.
fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", truncate_chars(text, max))
    } else {
        text.to_string()
    }
}

fn received(email: &Email) -> String {
    email
        .received_time
        .as_ref()
        .map(format_timestamp)
        .unwrap_or_default()
}

/// Subject and number of relevant messages of a selected thread.
#[derive(Debug, Clone)]
struct ThreadInfo {
    count: usize,
    subject: String,
}

/// The answering pipeline.
#[derive(Clone)]
pub struct QueryService {
    db: DbPool,
    store: Arc<dyn DocumentStore>,
    embeddings: EmbeddingService,
    llm: LlmService,
    enable_vector_rerank: bool,
}

impl QueryService {
    pub fn new(
        db: DbPool,
        store: Arc<dyn DocumentStore>,
        embeddings: EmbeddingService,
        llm: LlmService,
        enable_vector_rerank: bool,
    ) -> Self {
        Self {
            db,
            store,
            embeddings,
            llm,
            enable_vector_rerank,
        }
    }

    /// Answer `question` from the `top_k` best matching threads.
    pub async fn query(&self, question: &str, top_k: usize) -> Result<QueryResponse> {
        let top_k = top_k.max(1);
        info!(question, top_k, "Processing query");

        let keywords = extract_keywords(question);
        let enhanced = build_enhanced_query(question);
        info!(keywords = ?keywords, enhanced = %enhanced, "Built search query");

        let limit = i64::try_from(top_k.saturating_mul(3)).unwrap_or(i64::MAX);
        let hits = search_emails_fts(&self.db, &enhanced, limit).await?;
        if hits.is_empty() {
            warn!(question, "No emails found matching query");
            return Ok(QueryResponse {
                success: false,
                answer: NO_RESULTS_ANSWER.to_string(),
                citations: Vec::new(),
                retrieved_emails: Vec::new(),
            });
        }
        info!(count = hits.len(), "Full-text search returned results");

        let thread_keys = top_threads(&hits, top_k);
        info!(count = thread_keys.len(), "Selected top threads");

        let (gathered, thread_info) = self.gather_threads(&hits, &thread_keys, &keywords).await?;
        info!(
            emails = gathered.len(),
            threads = thread_info.len(),
            "Fetched relevant thread emails"
        );

        let rerank_limit = top_k.saturating_mul(5);
        let emails = if self.enable_vector_rerank
            && self.embeddings.has_providers()
            && gathered.len() > rerank_limit
        {
            self.rerank(question, gathered, rerank_limit).await
        } else {
            info!("Skipping vector reranking");
            gathered
        };

        let context = self.build_thread_context(&emails, &thread_info).await;
        let prompt = build_prompt(question, &context);

        let options = CompletionOptions::new(ANSWER_MAX_TOKENS).temperature(ANSWER_TEMPERATURE);
        let answer = match self.llm.complete_with(&prompt, options).await {
            Ok(answer) => answer,
            Err(e) => {
                error!(error = %e, "Error generating answer");
                format!(
                    "I found relevant emails but encountered an error generating the answer: {}",
                    e
                )
            }
        };

        let citations = build_citations(&emails, &keywords);
        let retrieved_emails = emails.into_iter().take(top_k.saturating_mul(10)).collect();

        Ok(QueryResponse {
            success: true,
            answer,
            citations,
            retrieved_emails,
        })
    }

    /// Load each selected thread and keep its relevant, unseen emails.
    async fn gather_threads(
        &self,
        hits: &[SearchHit],
        thread_keys: &[String],
        keywords: &[String],
    ) -> Result<(Vec<SearchHit>, HashMap<String, ThreadInfo>)> {
        let mut gathered: Vec<SearchHit> = Vec::new();
        let mut info_by_thread = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();

        for key in thread_keys {
            let thread = get_emails_by_conversation_id(&self.db, key).await?;

            let relevant: Vec<SearchHit> = if thread.is_empty() {
                hits.iter()
                    .find(|h| h.email.id == *key)
                    .filter(|h| !seen.contains(&h.email.id) && is_relevant(&h.email, keywords))
                    .cloned()
                    .into_iter()
                    .collect()
            } else {
                thread
                    .into_iter()
                    .filter(|e| !seen.contains(&e.id) && is_relevant(e, keywords))
                    .map(|email| {
                        let rank = hits
                            .iter()
                            .find(|h| h.email.id == email.id)
                            .map(|h| h.rank)
                            .unwrap_or(0.0);
                        SearchHit {
                            email,
                            rank,
                            vector_similarity: None,
                        }
                    })
                    .collect()
            };

            if relevant.is_empty() {
                continue;
            }

            seen.extend(relevant.iter().map(|h| h.email.id.clone()));
            info_by_thread.insert(
                key.clone(),
                ThreadInfo {
                    count: relevant.len(),
                    subject: relevant[0].email.subject_or_default().to_string(),
                },
            );
            gathered.extend(relevant);
        }

        Ok((gathered, info_by_thread))
    }

    /// Keep the `limit` emails most similar to the question. Any failure
    /// leaves the emails as they were.
    async fn rerank(&self, question: &str, emails: Vec<SearchHit>, limit: usize) -> Vec<SearchHit> {
        info!(count = emails.len(), limit, "Vector reranking thread emails");

        let vector = match self.embeddings.embed_single(question).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(error = %e, "Error embedding query, falling back to all thread emails");
                return emails;
            }
        };

        let ids: Vec<String> = emails.iter().map(|h| h.email.id.clone()).collect();
        let ranked = match self.store.rerank(&ids, vector, limit).await {
            Ok(ranked) => ranked,
            Err(e) => {
                warn!(error = %e, "Error during vector reranking, falling back to all thread emails");
                return emails;
            }
        };

        let mut by_id: HashMap<String, SearchHit> = emails
            .into_iter()
            .map(|h| (h.email.id.clone(), h))
            .collect();

        let reranked: Vec<SearchHit> = ranked
            .into_iter()
            .filter_map(|hit| {
                by_id.remove(&hit.email_id).map(|mut email| {
                    email.vector_similarity = Some(hit.similarity);
                    email
                })
            })
            .collect();

        info!(count = reranked.len(), "Reranked emails");
        reranked
    }

    async fn attachment_lines(&self, email_id: &str, indent: &str) -> Vec<String> {
        let attachments = match get_attachment_texts(&self.db, email_id).await {
            Ok(attachments) => attachments,
            Err(e) => {
                warn!(email_id, error = %e, "Error getting attachments");
                return Vec::new();
            }
        };

        attachments
            .iter()
            .take(ATTACHMENTS_PER_EMAIL)
            .filter(|a| !a.text.is_empty())
            .map(|a| {
                format!(
                    "{}- {}: {}",
                    indent,
                    a.filename,
                    preview(&a.text, ATTACHMENT_PREVIEW_CHARS)
                )
            })
            .collect()
    }

    /// Render emails as numbered threads followed by standalone emails.
    async fn build_thread_context(
        &self,
        emails: &[SearchHit],
        thread_info: &HashMap<String, ThreadInfo>,
    ) -> String {
        let mut threads: Vec<(String, Vec<&Email>)> = Vec::new();
        let mut standalone: Vec<&Email> = Vec::new();

        for hit in emails {
            match hit.email.conversation_id.as_deref().filter(|c| !c.is_empty()) {
                Some(conversation_id) => {
                    match threads.iter_mut().find(|(id, _)| id == conversation_id) {
                        Some((_, members)) => members.push(&hit.email),
                        None => threads.push((conversation_id.to_string(), vec![&hit.email])),
                    }
                }
                None => standalone.push(&hit.email),
            }
        }

        for (_, members) in threads.iter_mut() {
            members.sort_by_key(|e| e.received_time);
        }

        let mut parts: Vec<String> = Vec::new();
        let mut number = 1;

        for (conversation_id, members) in &threads {
            let info = thread_info.get(conversation_id);
            let count = info.map(|i| i.count).unwrap_or(members.len());
            let subject = info
                .map(|i| i.subject.as_str())
                .unwrap_or_else(|| members[0].subject_or_default());

            parts.push(format!(
                "\nTHREAD {} ({} messages):\nSubject: {}\nConversation ID: {}\n\n",
                number, count, subject, conversation_id
            ));

            for (i, email) in members.iter().enumerate() {
                let body = clean_html_body(email.body.as_deref().unwrap_or_default());
                parts.push(format!(
                    "  Message {}:\n  From: {} <{}>\n  Date: {}\n  Body: {}\n",
                    i + 1,
                    email.sender_name.as_deref().unwrap_or_default(),
                    email.sender_email.as_deref().unwrap_or_default(),
                    received(email),
                    preview(&body, BODY_PREVIEW_CHARS)
                ));

                let lines = self.attachment_lines(&email.id, "    ").await;
                if !lines.is_empty() {
                    parts.push("  Attachments:".to_string());
                    parts.extend(lines);
                }
                parts.push(String::new());
            }

            number += 1;
        }

        for email in standalone {
            let body = clean_html_body(email.body.as_deref().unwrap_or_default());
            parts.push(format!(
                "\nSTANDALONE EMAIL {}:\nSubject: {}\nFrom: {} <{}>\nDate: {}\nBody: {}\n",
                number,
                email.subject_or_default(),
                email.sender_name.as_deref().unwrap_or_default(),
                email.sender_email.as_deref().unwrap_or_default(),
                received(email),
                preview(&body, BODY_PREVIEW_CHARS)
            ));

            let lines = self.attachment_lines(&email.id, "  ").await;
            if !lines.is_empty() {
                parts.push("Attachments:".to_string());
                parts.extend(lines);
            }
            parts.push(String::new());
            number += 1;
        }

        parts.join("\n")
    }
}

/// Thread keys ordered by their best (lowest) rank, at most `top_k`.
fn top_threads(hits: &[SearchHit], top_k: usize) -> Vec<String> {
    let mut best: Vec<(String, f64)> = Vec::new();

    for hit in hits {
        let key = hit.email.thread_key();
        match best.iter_mut().find(|(k, _)| k == key) {
            Some((_, rank)) => {
                if hit.rank < *rank {
                    *rank = hit.rank;
                }
            }
            None => best.push((key.to_string(), hit.rank)),
        }
    }

    best.sort_by(|a, b| a.1.total_cmp(&b.1));
    best.into_iter().take(top_k).map(|(k, _)| k).collect()
}

/// Prompt asking the LLM to answer from the given threads only.
pub fn build_prompt(question: &str, context: &str) -> String {
    format!(
        r#"You are a helpful assistant that answers questions based on company emails.

IMPORTANT RULES:
1. Answer ONLY using information from the emails/threads provided below
2. If the answer is not in the emails, say "I don't have enough information in the emails to answer that."
3. When referencing emails, cite by thread number and message number (e.g., "According to Thread 1, Message 2...")
4. Pay attention to the full conversation context in each thread - earlier messages may provide important context
5. Be concise and factual
6. If multiple threads discuss the same topic, synthesize information across threads

EMAIL THREADS:
{context}

QUESTION:
{question}

Please provide:
1. A clear, concise answer based on the email threads
2. Citations to specific threads and messages that support your answer
"#
    )
}

/// Citations for the emails that mention a keyword.
pub fn build_citations(emails: &[SearchHit], keywords: &[String]) -> Vec<Citation> {
    emails
        .iter()
        .map(|hit| &hit.email)
        .filter(|email| is_relevant(email, keywords))
        .map(|email| {
            let body = clean_html_body(email.body.as_deref().unwrap_or_default());
            let snippet = if body.is_empty() {
                String::new()
            } else {
                format!("{}...", truncate_chars(&body, SNIPPET_CHARS))
            };
            Citation {
                id: email.id.clone(),
                subject: email.subject.clone(),
                sender: email.sender_name.clone(),
                sender_email: email.sender_email.clone(),
                received_time: email.received_time,
                snippet,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn email(id: &str, conversation_id: Option<&str>, subject: &str, body: &str) -> Email {
        Email {
            id: id.to_string(),
            account: "me@example.com".into(),
            folder: "INBOX".into(),
            subject: Some(subject.to_string()),
            sender_name: Some("Ann".into()),
            sender_email: Some("ann@example.com".into()),
            received_time: None,
            sent_time: None,
            recipients: Some("team@example.com".into()),
            is_task: false,
            unread: false,
            categories: None,
            processed: true,
            last_updated: None,
            body: Some(body.to_string()),
            attachments: None,
            conversation_id: conversation_id.map(str::to_string),
            conversation_index: None,
            internet_message_id: None,
        }
    }

    fn hit(email: Email, rank: f64) -> SearchHit {
        SearchHit {
            email,
            rank,
            vector_similarity: None,
        }
    }

    #[rstest]
    #[case("What did Ann say about the Q3-budget?", vec!["ann", "q3-budget"])]
    #[case("tell me about it", vec![])]
    #[case("Invoice invoice", vec!["invoice", "invoice"])]
    fn test_extract_keywords(#[case] question: &str, #[case] expected: Vec<&str>) {
        assert_eq!(extract_keywords(question), expected);
    }

    #[rstest]
    #[case("budget", "budget")]
    #[case("budget review meeting", "(budget OR review OR meeting) OR (\"budget review\" OR \"review meeting\")")]
    #[case("what is the budget", "what is the budget")]
    fn test_build_enhanced_query(#[case] question: &str, #[case] expected: &str) {
        assert_eq!(build_enhanced_query(question), expected);
    }

    #[test]
    fn test_is_relevant_checks_subject_and_body() {
        let keywords = vec!["invoice".to_string()];
        assert!(is_relevant(&email("a", None, "Invoice 42", "hi"), &keywords));
        assert!(is_relevant(&email("b", None, "Hi", "the <b>invoice</b> is due"), &keywords));
        assert!(!is_relevant(&email("c", None, "Lunch", "pizza"), &keywords));
        assert!(is_relevant(&email("d", None, "Lunch", "pizza"), &[]));
    }

    #[test]
    fn test_top_threads_orders_by_best_rank() {
        let hits = vec![
            hit(email("a1", Some("t-a"), "A", ""), -1.0),
            hit(email("b1", Some("t-b"), "B", ""), -3.0),
            hit(email("a2", Some("t-a"), "A", ""), -5.0),
            hit(email("s1", None, "S", ""), -2.0),
        ];
        assert_eq!(top_threads(&hits, 8), vec!["t-a", "t-b", "s1"]);
        assert_eq!(top_threads(&hits, 1), vec!["t-a"]);
    }

    #[test]
    fn test_citations_snippet_and_filtering() {
        let long_body = "invoice ".repeat(60);
        let emails = vec![
            hit(email("a", None, "Invoice", &long_body), 0.0),
            hit(email("b", None, "Lunch", "pizza"), 0.0),
            hit(email("c", None, "Invoice", ""), 0.0),
        ];
        let citations = build_citations(&emails, &["invoice".to_string()]);

        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].snippet.chars().count(), SNIPPET_CHARS + 3);
        assert!(citations[0].snippet.ends_with("..."));
        assert_eq!(citations[1].snippet, "");
    }

    #[test]
    fn test_prompt_contains_context_and_question() {
        let prompt = build_prompt("When is the launch?", "THREAD 1 (1 messages):");
        assert!(prompt.contains("EMAIL THREADS:\nTHREAD 1 (1 messages):\n\nQUESTION:\nWhen is the launch?"));
        assert!(prompt.contains("6. If multiple threads discuss the same topic"));
    }

    #[test]
    fn test_preview_marks_truncation() {
        assert_eq!(preview("abcdef", 3), "abc...");
        assert_eq!(preview("abc", 3), "abc");
    }
}
