//! Database operations for attachments.

use sqlx::FromRow;

use crate::error::Result;
use crate::models::{
    format_timestamp, parse_timestamp, truncate_chars, Attachment, AttachmentText,
    MAX_ATTACHMENT_TEXT,
};

use super::DbPool;

/// Attachments handed to the answer prompt per email.
const MAX_CONTEXT_ATTACHMENTS: i64 = 10;

#[derive(Debug, FromRow)]
struct AttachmentRow {
    id: String,
    email_id: String,
    filename: String,
    mime_type: Option<String>,
    file_size: i64,
    extracted_text: Option<String>,
    text_length: i64,
    chunk_count: i64,
    is_processed: bool,
    created_at: String,
}

impl From<AttachmentRow> for Attachment {
    fn from(row: AttachmentRow) -> Self {
        Self {
            id: row.id,
            email_id: row.email_id,
            filename: row.filename,
            mime_type: row.mime_type,
            file_size: row.file_size,
            extracted_text: row.extracted_text,
            text_length: row.text_length,
            chunk_count: row.chunk_count,
            is_processed: row.is_processed,
            created_at: parse_timestamp(&row.created_at).unwrap_or_default(),
        }
    }
}

/// Insert an attachment row. Extracted text is truncated on the way in.
pub async fn insert_attachment(pool: &DbPool, attachment: &Attachment) -> Result<()> {
    let text = attachment
        .extracted_text
        .as_deref()
        .map(|t| truncate_chars(t, MAX_ATTACHMENT_TEXT));

    sqlx::query(
        r#"
        INSERT OR REPLACE INTO attachments (
            id, email_id, filename, mime_type, file_size, extracted_text,
            text_length, chunk_count, is_processed, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&attachment.id)
    .bind(&attachment.email_id)
    .bind(&attachment.filename)
    .bind(&attachment.mime_type)
    .bind(attachment.file_size)
    .bind(text)
    .bind(attachment.text_length)
    .bind(attachment.chunk_count)
    .bind(attachment.is_processed)
    .bind(format_timestamp(&attachment.created_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn list_attachments(pool: &DbPool, email_id: &str) -> Result<Vec<Attachment>> {
    let rows: Vec<AttachmentRow> = sqlx::query_as(
        r#"
        SELECT id, email_id, filename, mime_type, file_size, extracted_text,
               text_length, chunk_count, is_processed, created_at
        FROM attachments WHERE email_id = ? ORDER BY created_at, filename
        "#,
    )
    .bind(email_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Non-empty attachment texts of an email, longest first.
pub async fn get_attachment_texts(pool: &DbPool, email_id: &str) -> Result<Vec<AttachmentText>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT filename, extracted_text FROM attachments
        WHERE email_id = ? AND extracted_text IS NOT NULL AND extracted_text != ''
        ORDER BY text_length DESC
        LIMIT ?
        "#,
    )
    .bind(email_id)
    .bind(MAX_CONTEXT_ATTACHMENTS)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(filename, text)| AttachmentText { filename, text })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{add_or_update_email, init_pool, initialize_schema};
    use crate::models::{new_id, now, ParsedEmail};

    fn email(id: &str) -> ParsedEmail {
        ParsedEmail {
            id: id.to_string(),
            account: "me@example.com".into(),
            folder: "INBOX".into(),
            subject: "Report".into(),
            sender_name: "Ann".into(),
            sender_email: "ann@example.com".into(),
            received_time: now(),
            sent_time: None,
            recipients: "me@example.com".into(),
            body: "See attached".into(),
            attachments: Vec::new(),
            conversation_id: None,
            conversation_index: None,
            internet_message_id: None,
            is_task: false,
            unread: true,
            categories: Vec::new(),
        }
    }

    fn attachment(email_id: &str, filename: &str, text: Option<&str>) -> Attachment {
        Attachment {
            id: new_id(),
            email_id: email_id.to_string(),
            filename: filename.to_string(),
            mime_type: Some("text/plain".into()),
            file_size: 10,
            extracted_text: text.map(str::to_string),
            text_length: text.map(|t| t.chars().count() as i64).unwrap_or(0),
            chunk_count: 0,
            is_processed: true,
            created_at: now(),
        }
    }

    #[tokio::test]
    async fn test_attachment_texts_longest_first() {
        let pool = init_pool(":memory:").await.unwrap();
        initialize_schema(&pool).await.unwrap();
        add_or_update_email(&pool, &email("e1")).await.unwrap();

        insert_attachment(&pool, &attachment("e1", "short.txt", Some("abc"))).await.unwrap();
        insert_attachment(&pool, &attachment("e1", "long.txt", Some("abcdefgh"))).await.unwrap();
        insert_attachment(&pool, &attachment("e1", "image.png", None)).await.unwrap();

        let texts = get_attachment_texts(&pool, "e1").await.unwrap();
        let names: Vec<&str> = texts.iter().map(|t| t.filename.as_str()).collect();
        assert_eq!(names, vec!["long.txt", "short.txt"]);

        assert_eq!(list_attachments(&pool, "e1").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_extracted_text_is_truncated() {
        let pool = init_pool(":memory:").await.unwrap();
        initialize_schema(&pool).await.unwrap();
        add_or_update_email(&pool, &email("e1")).await.unwrap();

        let long = "x".repeat(MAX_ATTACHMENT_TEXT + 100);
        insert_attachment(&pool, &attachment("e1", "big.txt", Some(&long))).await.unwrap();

        let stored = list_attachments(&pool, "e1").await.unwrap();
        assert_eq!(
            stored[0].extracted_text.as_ref().map(|t| t.len()),
            Some(MAX_ATTACHMENT_TEXT)
        );
        assert_eq!(stored[0].text_length, (MAX_ATTACHMENT_TEXT + 100) as i64);
    }

    #[tokio::test]
    async fn test_attachment_requires_email() {
        let pool = init_pool(":memory:").await.unwrap();
        initialize_schema(&pool).await.unwrap();

        let result = insert_attachment(&pool, &attachment("missing", "a.txt", Some("x"))).await;
        assert!(result.is_err());
    }
}
