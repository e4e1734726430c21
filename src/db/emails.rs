//! Database operations for emails.
//!
//! Emails are written once (an existing id is never overwritten) and
//! searched through the `emails_fts` index, with a LIKE fallback.

use std::sync::LazyLock;

use regex::Regex;
use sqlx::FromRow;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::{format_timestamp, now, parse_timestamp, Email, ParsedEmail, SearchHit, StoreOutcome};
use crate::services::mime::sanitize_text;

use super::DbPool;

static LIKE_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\w+\b").expect("term pattern is valid"));

const FTS_OPERATORS: [&str; 4] = ["OR", "AND", "NOT", "NEAR"];

const EMAIL_COLUMNS: &str = "e.id, e.account, e.folder, e.subject, e.sender_name, e.sender_email, \
     e.received_time, e.sent_time, e.recipients, e.is_task, e.unread, e.categories, \
     e.processed, e.last_updated, e.body, e.attachments, e.conversation_id, \
     e.conversation_index, e.internet_message_id";

/// Database row for emails
#[derive(Debug, FromRow)]
struct EmailRow {
    id: String,
    account: String,
    folder: String,
    subject: Option<String>,
    sender_name: Option<String>,
    sender_email: Option<String>,
    received_time: Option<String>,
    sent_time: Option<String>,
    recipients: Option<String>,
    is_task: bool,
    unread: bool,
    categories: Option<String>,
    processed: bool,
    last_updated: Option<String>,
    body: Option<String>,
    attachments: Option<String>,
    conversation_id: Option<String>,
    conversation_index: Option<i64>,
    internet_message_id: Option<String>,
}

impl From<EmailRow> for Email {
    fn from(row: EmailRow) -> Self {
        Self {
            id: row.id,
            account: row.account,
            folder: row.folder,
            subject: row.subject,
            sender_name: row.sender_name,
            sender_email: row.sender_email,
            received_time: row.received_time.as_deref().and_then(parse_timestamp),
            sent_time: row.sent_time.as_deref().and_then(parse_timestamp),
            recipients: row.recipients,
            is_task: row.is_task,
            unread: row.unread,
            categories: row.categories,
            processed: row.processed,
            last_updated: row.last_updated.as_deref().and_then(parse_timestamp),
            body: row.body,
            attachments: row.attachments,
            conversation_id: row.conversation_id,
            conversation_index: row.conversation_index,
            internet_message_id: row.internet_message_id,
        }
    }
}

#[derive(Debug, FromRow)]
struct SearchRow {
    #[sqlx(flatten)]
    email: EmailRow,
    rank: f64,
}

impl From<SearchRow> for SearchHit {
    fn from(row: SearchRow) -> Self {
        Self {
            email: row.email.into(),
            rank: row.rank,
            vector_similarity: None,
        }
    }
}

/// Names of required fields that are blank.
fn missing_fields(email: &ParsedEmail) -> Vec<&'static str> {
    [
        ("id", email.id.as_str()),
        ("account", email.account.as_str()),
        ("folder", email.folder.as_str()),
        ("subject", email.subject.as_str()),
        ("body", email.body.as_str()),
    ]
    .into_iter()
    .filter(|(_, value)| value.trim().is_empty())
    .map(|(name, _)| name)
    .collect()
}

/// Store an email unless it is incomplete or already present.
pub async fn add_or_update_email(pool: &DbPool, email: &ParsedEmail) -> Result<StoreOutcome> {
    let missing = missing_fields(email);
    if !missing.is_empty() {
        warn!(id = %email.id, missing = ?missing, "Missing required fields");
        return Ok(StoreOutcome::Rejected);
    }

    let result = sqlx::query(
        r#"
        INSERT INTO emails (
            id, account, folder, subject, sender_name, sender_email,
            received_time, sent_time, recipients, is_task, unread,
            categories, processed, last_updated, body, attachments,
            conversation_id, conversation_index, internet_message_id
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, FALSE, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO NOTHING
        "#,
    )
    .bind(&email.id)
    .bind(sanitize_text(&email.account))
    .bind(sanitize_text(&email.folder))
    .bind(sanitize_text(&email.subject))
    .bind(sanitize_text(&email.sender_name))
    .bind(sanitize_text(&email.sender_email))
    .bind(format_timestamp(&email.received_time))
    .bind(email.sent_time.as_ref().map(format_timestamp))
    .bind(sanitize_text(&email.recipients))
    .bind(email.is_task)
    .bind(email.unread)
    .bind(email.categories.join(", "))
    .bind(format_timestamp(&now()))
    .bind(&email.body)
    .bind(email.attachment_names())
    .bind(email.conversation_id.as_deref().filter(|c| !c.is_empty()))
    .bind(email.conversation_index)
    .bind(email.internet_message_id.as_deref().filter(|m| !m.is_empty()))
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        info!(id = %email.id, "Email already exists, skipping");
        Ok(StoreOutcome::Existing)
    } else {
        debug!(id = %email.id, "Stored email");
        Ok(StoreOutcome::Inserted)
    }
}

/// Emails not yet embedded, newest first.
pub async fn get_unprocessed_emails(pool: &DbPool, limit: i64) -> Result<Vec<Email>> {
    let rows: Vec<EmailRow> = sqlx::query_as(&format!(
        "SELECT {EMAIL_COLUMNS} FROM emails e WHERE e.processed = FALSE \
         ORDER BY e.received_time DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Flag an email as embedded. Returns false when the id is unknown.
pub async fn mark_as_processed(pool: &DbPool, id: &str) -> Result<bool> {
    let result = sqlx::query("UPDATE emails SET processed = TRUE, last_updated = ? WHERE id = ?")
        .bind(format_timestamp(&now()))
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Get an email by ID.
pub async fn get_email_by_id(pool: &DbPool, id: &str) -> Result<Option<Email>> {
    let row: Option<EmailRow> =
        sqlx::query_as(&format!("SELECT {EMAIL_COLUMNS} FROM emails e WHERE e.id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;

    Ok(row.map(Into::into))
}

pub async fn get_email_count(pool: &DbPool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM emails")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Page through emails, newest first.
pub async fn list_emails(pool: &DbPool, limit: i64, offset: i64) -> Result<Vec<Email>> {
    let rows: Vec<EmailRow> = sqlx::query_as(&format!(
        "SELECT {EMAIL_COLUMNS} FROM emails e ORDER BY e.received_time DESC LIMIT ? OFFSET ?"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// All emails of a conversation, oldest first.
pub async fn get_emails_by_conversation_id(
    pool: &DbPool,
    conversation_id: &str,
) -> Result<Vec<Email>> {
    if conversation_id.is_empty() {
        return Ok(Vec::new());
    }

    let rows: Vec<EmailRow> = sqlx::query_as(&format!(
        "SELECT {EMAIL_COLUMNS} FROM emails e WHERE e.conversation_id = ? \
         ORDER BY e.received_time ASC"
    ))
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;

    debug!(conversation_id, count = rows.len(), "Loaded conversation");

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Full-text search ordered by rank, falling back to LIKE matching when
/// the index finds nothing or rejects the query.
pub async fn search_emails_fts(pool: &DbPool, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
    let normalized = normalize_fts_query(query);

    if normalized.is_empty() {
        return like_search(pool, query, limit).await;
    }

    let result: std::result::Result<Vec<SearchRow>, sqlx::Error> = sqlx::query_as(&format!(
        "SELECT {EMAIL_COLUMNS}, emails_fts.rank AS rank \
         FROM emails_fts JOIN emails e ON e.rowid = emails_fts.rowid \
         WHERE emails_fts MATCH ? ORDER BY emails_fts.rank LIMIT ?"
    ))
    .bind(&normalized)
    .bind(limit)
    .fetch_all(pool)
    .await;

    match result {
        Ok(rows) if !rows.is_empty() => {
            info!(query, count = rows.len(), "FTS search returned results");
            Ok(rows.into_iter().map(Into::into).collect())
        }
        Ok(_) => {
            info!(query, "FTS returned no results, trying LIKE fallback");
            like_search(pool, query, limit).await
        }
        Err(e) => {
            warn!(query, fts_query = %normalized, error = %e, "FTS search failed, trying LIKE fallback");
            like_search(pool, query, limit).await
        }
    }
}

/// Case-insensitive LIKE search over subject and body, newest first, rank 0.
async fn like_search(pool: &DbPool, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
    let terms = like_terms(query);
    if terms.is_empty() {
        return Ok(Vec::new());
    }

    let where_clause = terms
        .iter()
        .map(|_| "(LOWER(e.subject) LIKE ? OR LOWER(e.body) LIKE ?)")
        .collect::<Vec<_>>()
        .join(" OR ");

    let sql = format!(
        "SELECT {EMAIL_COLUMNS}, 0.0 AS rank FROM emails e WHERE {where_clause} \
         ORDER BY e.received_time DESC LIMIT ?"
    );

    let mut q = sqlx::query_as::<_, SearchRow>(&sql);
    for term in &terms {
        let pattern = format!("%{}%", term);
        q = q.bind(pattern.clone()).bind(pattern);
    }

    let rows = q.bind(limit).fetch_all(pool).await?;
    info!(query, count = rows.len(), "LIKE fallback search returned results");

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Lowercased words of a query with FTS operators removed.
fn like_terms(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut terms: Vec<String> = Vec::new();
    for m in LIKE_TERM.find_iter(&lowered) {
        let term = m.as_str();
        if FTS_OPERATORS.iter().any(|op| op.eq_ignore_ascii_case(term)) {
            continue;
        }
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }
    terms
}

/// Rebuild the full-text index from the emails table.
pub async fn rebuild_fts_index(pool: &DbPool) -> Result<()> {
    sqlx::query("INSERT INTO emails_fts(emails_fts) VALUES('rebuild')")
        .execute(pool)
        .await?;
    info!("Rebuilt FTS index");
    Ok(())
}

// ============================================================================
// Query normalisation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum QueryToken {
    Open,
    Close,
    Operator(&'static str),
    Phrase(String),
    Term(String),
}

fn tokenize(query: &str) -> Vec<QueryToken> {
    let mut tokens = Vec::new();
    let mut chars = query.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(QueryToken::Open);
            }
            ')' => {
                chars.next();
                tokens.push(QueryToken::Close);
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                for ch in chars.by_ref() {
                    if ch == '"' {
                        break;
                    }
                    phrase.push(ch);
                }
                let phrase = phrase.trim().to_string();
                if !phrase.is_empty() {
                    tokens.push(QueryToken::Phrase(phrase));
                }
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '(' || ch == ')' || ch == '"' {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                match FTS_OPERATORS.iter().find(|op| **op == word) {
                    Some(op) => tokens.push(QueryToken::Operator(op)),
                    None => tokens.push(QueryToken::Term(word)),
                }
            }
        }
    }

    tokens
}

fn capitalize(term: &str) -> String {
    let mut chars = term.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('"', ""))
}

/// A bare term as an FTS expression with its case variations.
fn expand_term(term: &str) -> String {
    let needs_quotes = !term.chars().all(|c| c.is_alphanumeric() || c == '_');
    let render = |t: &str| {
        if needs_quotes || FTS_OPERATORS.contains(&t) {
            quote(t)
        } else {
            t.to_string()
        }
    };

    let mut variations: Vec<String> = Vec::new();
    for v in [
        term.to_string(),
        term.to_lowercase(),
        capitalize(term),
        term.to_uppercase(),
    ] {
        if !variations.contains(&v) {
            variations.push(v);
        }
    }

    if variations.len() == 1 {
        render(&variations[0])
    } else {
        format!(
            "({})",
            variations.iter().map(|v| render(v)).collect::<Vec<_>>().join(" OR ")
        )
    }
}

/// Rewrite a user query into a valid FTS5 expression.
///
/// Bare terms gain case variations, terms with punctuation are quoted,
/// quoted phrases and upper-case operators are kept, dangling operators
/// are dropped and parentheses are balanced.
pub fn normalize_fts_query(query: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut depth = 0usize;

    let last_is_operand_end = |out: &Vec<String>| {
        out.last()
            .map(|t| t != "(" && !FTS_OPERATORS.contains(&t.as_str()))
            .unwrap_or(false)
    };

    for token in tokenize(query) {
        match token {
            QueryToken::Open => {
                depth += 1;
                out.push("(".to_string());
            }
            QueryToken::Close => {
                if depth == 0 {
                    continue;
                }
                while out
                    .last()
                    .map(|t| FTS_OPERATORS.contains(&t.as_str()))
                    .unwrap_or(false)
                {
                    out.pop();
                }
                if out.last().map(|t| t == "(").unwrap_or(false) {
                    out.pop();
                } else {
                    out.push(")".to_string());
                }
                depth -= 1;
            }
            QueryToken::Operator(op) => {
                if last_is_operand_end(&out) {
                    out.push(op.to_string());
                }
            }
            QueryToken::Phrase(phrase) => out.push(quote(&phrase)),
            QueryToken::Term(term) => {
                let term = term.trim_matches(|c: char| c == '*' || c == ':' || c == '^');
                if !term.is_empty() {
                    out.push(expand_term(term));
                }
            }
        }
    }

    while out
        .last()
        .map(|t| t == "(" || FTS_OPERATORS.contains(&t.as_str()))
        .unwrap_or(false)
    {
        if out.last().map(|t| t == "(").unwrap_or(false) {
            depth = depth.saturating_sub(1);
        }
        out.pop();
    }

    for _ in 0..depth {
        out.push(")".to_string());
    }

    out.join(" ").replace("( ", "(").replace(" )", ")")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("budget", "(budget OR Budget OR BUDGET)")]
    #[case("Budget", "(Budget OR budget OR BUDGET)")]
    #[case("42", "42")]
    #[case("budget OR invoice", "(budget OR Budget OR BUDGET) OR (invoice OR Invoice OR INVOICE)")]
    #[case("\"quarterly review\"", "\"quarterly review\"")]
    #[case("e-mail", "(\"e-mail\" OR \"E-mail\" OR \"E-MAIL\")")]
    #[case("(42 OR 7", "(42 OR 7)")]
    #[case("42) OR 7", "42 OR 7")]
    #[case("OR 42 AND", "42")]
    #[case("or", "(or OR Or OR \"OR\")")]
    #[case("()", "")]
    #[case("   ", "")]
    fn test_normalize_fts_query(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_fts_query(input), expected);
    }

    #[test]
    fn test_like_terms_skip_operators() {
        assert_eq!(
            like_terms("Budget OR \"Q3 review\" AND not near"),
            vec!["budget", "q3", "review"]
        );
        assert!(like_terms("OR AND").is_empty());
    }
}
