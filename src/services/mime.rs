//! RFC 5322 message parsing and text cleanup.
//!
//! Turns a raw message fetched from the mailbox into a [`ParsedEmail`]:
//! decoded headers, a cleaned plain-text body, threading ids and the
//! attachments with whatever text can be pulled out of them.

use std::sync::LazyLock;

use chrono::{DateTime, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::models::{ParsedAttachment, ParsedEmail};

static CONTROL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\x00-\x1F\x7F-\x9F]").expect("control pattern is valid"));

static LINE_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r\n|\r|\n|\t").expect("line break pattern is valid"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("tag pattern is valid"));

static HTML_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style[^>]*>.*?</style>|<script[^>]*>.*?</script>")
        .expect("block pattern is valid")
});

static MESSAGE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<>\s]+>").expect("message id pattern is valid"));

// ============================================================================
// Text cleanup
// ============================================================================

/// Flatten a body to a single line of text.
///
/// Line breaks become spaces, remaining control characters are dropped and
/// runs of whitespace collapse to one space.
pub fn clean_email_body(body: &str) -> String {
    if body.is_empty() {
        return String::new();
    }
    let body = LINE_BREAKS.replace_all(body, " ");
    let body = CONTROL_CHARS.replace_all(&body, "");
    WHITESPACE.replace_all(&body, " ").trim().to_string()
}

/// Cleanup applied to header values before they are stored.
pub fn sanitize_text(value: &str) -> String {
    clean_email_body(value)
}

/// Reduce an HTML body to its visible text.
pub fn clean_html_body(html: &str) -> String {
    let text = html_escape::decode_html_entities(html);
    let text = HTML_BLOCK.replace_all(&text, " ");
    let text = HTML_TAG.replace_all(&text, " ");
    let text = html_escape::decode_html_entities(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

// ============================================================================
// Headers
// ============================================================================

/// Split a `From` value into display name and address.
///
/// Without an angle-bracketed address both halves are the raw value.
pub fn split_sender(from: &str) -> (String, String) {
    match (from.find('<'), from.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = from[..open].trim().trim_matches('"').trim().to_string();
            let address = from[open + 1..close].trim().to_string();
            (name, address)
        }
        _ => (from.trim().to_string(), from.trim().to_string()),
    }
}

/// Conversation id and index from the threading headers.
///
/// The id is the first `References` entry, else `In-Reply-To`, else the
/// message's own id. The index is how many messages are referenced.
pub fn thread_ids(
    references: Option<&str>,
    in_reply_to: Option<&str>,
    message_id: Option<&str>,
) -> (Option<String>, Option<i64>) {
    let refs: Vec<String> = references
        .map(|r| {
            let bracketed: Vec<String> = MESSAGE_ID
                .find_iter(r)
                .map(|m| m.as_str().to_string())
                .collect();
            if bracketed.is_empty() {
                r.split_whitespace().map(str::to_string).collect()
            } else {
                bracketed
            }
        })
        .unwrap_or_default();

    let first_id = |value: Option<&str>| {
        value.map(str::trim).filter(|v| !v.is_empty()).map(|v| {
            MESSAGE_ID
                .find(v)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| v.to_string())
        })
    };

    let conversation_id = refs
        .first()
        .cloned()
        .or_else(|| first_id(in_reply_to))
        .or_else(|| first_id(message_id));

    (conversation_id, Some(refs.len() as i64))
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if value.trim().is_empty() {
        return None;
    }
    match mailparse::dateparse(value) {
        Ok(timestamp) => Utc.timestamp_opt(timestamp, 0).single(),
        Err(e) => {
            warn!(date = value, error = %e, "Cannot parse message date");
            None
        }
    }
}

// ============================================================================
// Parts
// ============================================================================

/// Every part of a message, depth first, the root included. Embedded
/// messages are kept whole.
fn walk<'a>(part: &'a ParsedMail<'a>, parts: &mut Vec<&'a ParsedMail<'a>>) {
    parts.push(part);
    if part.ctype.mimetype == "message/rfc822" {
        return;
    }
    for sub in &part.subparts {
        walk(sub, parts);
    }
}

fn disposition_header(part: &ParsedMail) -> String {
    part.headers
        .get_first_value("Content-Disposition")
        .unwrap_or_default()
        .to_lowercase()
}

fn part_filename(part: &ParsedMail) -> Option<String> {
    let disposition = part.get_content_disposition();
    disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

fn part_text(part: &ParsedMail) -> Option<String> {
    match part.get_body() {
        Ok(body) => Some(body),
        Err(e) => {
            debug!(mime_type = %part.ctype.mimetype, error = %e, "Cannot decode part");
            None
        }
    }
}

/// Body text: first plain part, else first HTML part.
fn extract_body(parsed: &ParsedMail) -> String {
    if parsed.subparts.is_empty() {
        let body = part_text(parsed).unwrap_or_default();
        return if parsed.ctype.mimetype == "text/html" {
            clean_html_body(&body)
        } else {
            clean_email_body(&body)
        };
    }

    let mut parts = Vec::new();
    walk(parsed, &mut parts);

    let mut html = None;
    for part in parts {
        if disposition_header(part).contains("attachment") {
            continue;
        }
        match part.ctype.mimetype.as_str() {
            "text/plain" => {
                if let Some(text) = part_text(part) {
                    return clean_email_body(&text);
                }
            }
            "text/html" if html.is_none() => html = part_text(part),
            _ => {}
        }
    }

    html.map(|h| clean_html_body(&h)).unwrap_or_default()
}

/// MIME type of an attachment, from the filename when the part does not
/// declare a useful one.
fn attachment_mime_type(part: &ParsedMail, filename: &str) -> String {
    let declared = part.headers.get_first_value("Content-Type").is_some();
    let mimetype = part.ctype.mimetype.to_lowercase();

    if declared && mimetype != "application/octet-stream" {
        return mimetype;
    }

    mime_guess::from_path(filename)
        .first_raw()
        .map(str::to_string)
        .unwrap_or(mimetype)
}

/// Whether text can be pulled out of this MIME type.
pub fn is_text_mime_type(mime_type: &str) -> bool {
    let mime_type = mime_type.to_lowercase();
    mime_type.starts_with("text/")
        || mime_type == "message/rfc822"
        || mime_type == "application/json"
        || mime_type == "application/xml"
        || mime_type.ends_with("+json")
        || mime_type.ends_with("+xml")
}

fn attachment_text(part: &ParsedMail, mime_type: &str) -> Option<String> {
    if !is_text_mime_type(mime_type) {
        return None;
    }

    let text = if mime_type == "message/rfc822" {
        let raw = part.get_body_raw().ok()?;
        let inner = mailparse::parse_mail(&raw).ok()?;
        let subject = inner.headers.get_first_value("Subject").unwrap_or_default();
        format!("Subject: {}\n\n{}", subject.trim(), extract_body(&inner))
    } else if mime_type == "text/html" {
        clean_html_body(&part_text(part)?)
    } else {
        part_text(part)?
    };

    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn extract_attachments(parsed: &ParsedMail) -> Vec<ParsedAttachment> {
    let mut parts = Vec::new();
    walk(parsed, &mut parts);

    parts
        .into_iter()
        .filter(|part| !part.ctype.mimetype.starts_with("multipart/"))
        .filter_map(|part| {
            // mailparse reports `Inline` when the header is missing
            if disposition_header(part).trim_start().starts_with("inline") {
                return None;
            }

            let disposition = part.get_content_disposition().disposition;
            let filename = part_filename(part);
            if !matches!(disposition, DispositionType::Attachment) && filename.is_none() {
                return None;
            }

            let filename = filename.unwrap_or_else(|| "attachment".to_string());
            let mime_type = attachment_mime_type(part, &filename);
            let size = part.get_body_raw().map(|b| b.len()).unwrap_or(0);
            let text = attachment_text(part, &mime_type);

            Some(ParsedAttachment {
                filename,
                mime_type,
                size,
                text,
            })
        })
        .collect()
}

// ============================================================================
// Messages
// ============================================================================

/// Parse a raw message fetched as sequence number `seq`.
///
/// Returns `Ok(None)` when the message has no usable `Date`.
pub fn parse_message(
    raw: &[u8],
    seq: u32,
    account: &str,
    folder: &str,
) -> Result<Option<ParsedEmail>> {
    let parsed = mailparse::parse_mail(raw)?;
    let headers = &parsed.headers;

    let date_header = headers.get_first_value("Date").unwrap_or_default();
    let Some(received_time) = parse_date(&date_header) else {
        debug!(seq, "Skipping message without a usable date");
        return Ok(None);
    };

    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let from = headers.get_first_value("From").unwrap_or_default();
    let to = headers.get_first_value("To").unwrap_or_default();
    let message_id = headers
        .get_first_value("Message-ID")
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty());
    let references = headers.get_first_value("References");
    let in_reply_to = headers.get_first_value("In-Reply-To");

    let (sender_name, sender_email) = split_sender(&from);
    let (conversation_id, conversation_index) = thread_ids(
        references.as_deref(),
        in_reply_to.as_deref(),
        message_id.as_deref(),
    );

    let id = message_id
        .clone()
        .unwrap_or_else(|| format!("{}_{}", seq, date_header.trim()));

    Ok(Some(ParsedEmail {
        id,
        account: account.to_string(),
        folder: folder.to_string(),
        subject: subject.trim().to_string(),
        sender_name,
        sender_email,
        received_time,
        sent_time: Some(received_time),
        recipients: to.trim().to_string(),
        body: extract_body(&parsed),
        attachments: extract_attachments(&parsed),
        conversation_id,
        conversation_index,
        internet_message_id: message_id,
        is_task: false,
        unread: false,
        categories: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const MULTIPART: &str = "MIME-Version: 1.0\r\n\
From: \"Ann Lee\" <ann@example.com>\r\n\
To: team@example.com\r\n\
Subject: =?UTF-8?Q?Caf=C3=A9_budget?=\r\n\
Date: Tue, 02 Jan 2024 10:30:00 +0100\r\n\
Message-ID: <m2@example.com>\r\n\
In-Reply-To: <m1@example.com>\r\n\
References: <m0@example.com> <m1@example.com>\r\n\
Content-Type: multipart/mixed; boundary=b1\r\n\
\r\n\
--b1\r\n\
Content-Type: multipart/alternative; boundary=b2\r\n\
\r\n\
--b2\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Hello team,\r\n\
the budget is attached.\r\n\
--b2\r\n\
Content-Type: text/html\r\n\
\r\n\
<p>Hello team</p>\r\n\
--b2--\r\n\
--b1\r\n\
Content-Type: text/csv; name=\"q1.csv\"\r\n\
Content-Disposition: attachment; filename=\"q1.csv\"\r\n\
\r\n\
item,cost\r\n\
coffee,12\r\n\
--b1\r\n\
Content-Type: image/png; name=\"logo.png\"\r\n\
Content-Disposition: inline; filename=\"logo.png\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
iVBORw0KGgo=\r\n\
--b1--\r\n";

    #[test]
    fn test_parse_multipart_message() {
        let email = parse_message(MULTIPART.as_bytes(), 7, "me@example.com", "INBOX")
            .unwrap()
            .unwrap();

        assert_eq!(email.id, "<m2@example.com>");
        assert_eq!(email.subject, "Café budget");
        assert_eq!(email.sender_name, "Ann Lee");
        assert_eq!(email.sender_email, "ann@example.com");
        assert_eq!(email.recipients, "team@example.com");
        assert_eq!(email.body, "Hello team, the budget is attached.");
        assert_eq!(email.received_time.to_rfc3339(), "2024-01-02T09:30:00+00:00");
        assert_eq!(email.sent_time, Some(email.received_time));
        assert_eq!(email.conversation_id.as_deref(), Some("<m0@example.com>"));
        assert_eq!(email.conversation_index, Some(2));
        assert_eq!(email.folder, "INBOX");
        assert!(!email.unread);

        assert_eq!(email.attachments.len(), 1);
        let csv = &email.attachments[0];
        assert_eq!(csv.filename, "q1.csv");
        assert_eq!(csv.mime_type, "text/csv");
        assert!(csv.text.as_deref().unwrap().contains("coffee,12"));
        assert_eq!(email.attachment_names(), "q1.csv");
    }

    #[test]
    fn test_html_only_body_and_fallback_id() {
        let raw = "From: bob@example.com\r\n\
Subject: Notice\r\n\
Date: Wed, 03 Jan 2024 08:00:00 +0000\r\n\
Content-Type: text/html\r\n\
\r\n\
<html><style>p {color: red}</style><p>Office &amp; parking</p><br>closed</html>\r\n";

        let email = parse_message(raw.as_bytes(), 12, "me@example.com", "INBOX")
            .unwrap()
            .unwrap();

        assert_eq!(email.id, "12_Wed, 03 Jan 2024 08:00:00 +0000");
        assert_eq!(email.body, "Office & parking closed");
        assert_eq!(email.sender_name, "bob@example.com");
        assert_eq!(email.sender_email, "bob@example.com");
        assert_eq!(email.conversation_id, None);
        assert_eq!(email.internet_message_id, None);
    }

    #[test]
    fn test_message_without_date_is_skipped() {
        let raw = "From: bob@example.com\r\nSubject: x\r\n\r\nbody\r\n";
        assert!(parse_message(raw.as_bytes(), 1, "a", "INBOX").unwrap().is_none());
    }

    #[test]
    fn test_embedded_message_attachment() {
        let raw = "From: bob@example.com\r\n\
Subject: Fwd\r\n\
Date: Wed, 03 Jan 2024 08:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=xx\r\n\
\r\n\
--xx\r\n\
Content-Type: text/plain\r\n\
\r\n\
See below\r\n\
--xx\r\n\
Content-Type: message/rfc822\r\n\
Content-Disposition: attachment; filename=\"original.eml\"\r\n\
\r\n\
Subject: Original plan\r\n\
\r\n\
Ship on Friday\r\n\
--xx--\r\n";

        let email = parse_message(raw.as_bytes(), 2, "a", "INBOX").unwrap().unwrap();
        assert_eq!(email.body, "See below");
        let text = email.attachments[0].text.as_deref().unwrap();
        assert!(text.starts_with("Subject: Original plan"));
        assert!(text.contains("Ship on Friday"));
    }

    #[test]
    fn test_named_part_without_disposition_is_attachment() {
        let raw = "From: bob@example.com\r\n\
Subject: Notes\r\n\
Date: Wed, 03 Jan 2024 08:00:00 +0000\r\n\
Content-Type: multipart/mixed; boundary=xx\r\n\
\r\n\
--xx\r\n\
Content-Type: text/plain\r\n\
\r\n\
Notes attached\r\n\
--xx\r\n\
Content-Type: application/octet-stream; name=\"notes.csv\"\r\n\
\r\n\
item,cost\r\n\
--xx--\r\n";

        let email = parse_message(raw.as_bytes(), 3, "a", "INBOX").unwrap().unwrap();
        assert_eq!(email.attachments.len(), 1);
        assert_eq!(email.attachments[0].filename, "notes.csv");
        assert_eq!(email.attachments[0].mime_type, "text/csv");
        assert_eq!(email.attachment_names(), "notes.csv");
    }

    #[rstest]
    #[case("Hello\r\nworld", "Hello world")]
    #[case("  a\t\tb \u{0}c  ", "a b c")]
    #[case("x\u{85}y", "xy")]
    #[case("", "")]
    fn test_clean_email_body(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(clean_email_body(input), expected);
    }

    #[test]
    fn test_clean_html_body_decodes_escaped_markup() {
        assert_eq!(
            clean_html_body("&lt;b&gt;Bold&lt;/b&gt; <i>and</i>&nbsp;more"),
            "Bold and more"
        );
    }

    #[rstest]
    #[case("Ann <ann@x.com>", "Ann", "ann@x.com")]
    #[case("<ann@x.com>", "", "ann@x.com")]
    #[case("ann@x.com", "ann@x.com", "ann@x.com")]
    fn test_split_sender(#[case] from: &str, #[case] name: &str, #[case] address: &str) {
        assert_eq!(split_sender(from), (name.to_string(), address.to_string()));
    }

    #[test]
    fn test_thread_ids_precedence() {
        assert_eq!(
            thread_ids(None, Some(" <p@x> "), Some("<me@x>")),
            (Some("<p@x>".to_string()), Some(0))
        );
        assert_eq!(
            thread_ids(None, None, Some("<me@x>")),
            (Some("<me@x>".to_string()), Some(0))
        );
        assert_eq!(thread_ids(None, None, None), (None, Some(0)));
    }

    #[test]
    fn test_is_text_mime_type() {
        assert!(is_text_mime_type("text/plain"));
        assert!(is_text_mime_type("application/ld+json"));
        assert!(is_text_mime_type("message/rfc822"));
        assert!(!is_text_mime_type("application/pdf"));
    }
}
