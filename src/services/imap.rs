//! Mail source abstraction and the IMAP implementation.
//!
//! Ingestion asks a [`MailSource`] for every message received in a date
//! range. [`ImapMailSource`] talks to a real server over TLS; tests plug in
//! an in-memory source.

use std::net::TcpStream;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use native_tls::{TlsConnector, TlsStream};
use tracing::{debug, error, info, warn};

use crate::config::ImapConfig;
use crate::error::{Error, Result};
use crate::models::ParsedEmail;

use super::mime;

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: u32 = 3;

/// Pause between connection attempts.
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

type ImapSession = imap::Session<TlsStream<TcpStream>>;

/// Source of messages for ingestion.
#[async_trait]
pub trait MailSource: Send + Sync {
    /// Account the messages belong to.
    fn account(&self) -> &str;

    /// Messages received between `start` 00:00:00 and `end` 23:59:59 UTC.
    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ParsedEmail>>;
}

/// Reads a single folder of an IMAP account.
#[derive(Debug, Clone)]
pub struct ImapMailSource {
    config: ImapConfig,
}

impl ImapMailSource {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        self.config.email.is_some() && self.config.password.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        match (self.config.email.as_deref(), self.config.password.as_deref()) {
            (Some(email), Some(password)) => Ok((email, password)),
            _ => Err(Error::Validation(
                "EMAIL_ADDRESS and EMAIL_PASSWORD must be set".to_string(),
            )),
        }
    }

    fn create_session(&self) -> Result<ImapSession> {
        let (login, password) = self.credentials()?;

        let builder = TlsConnector::builder().build()?;

        let client = imap::ClientBuilder::new(&self.config.server, self.config.port)
            .connect(|domain, tcp| {
                let stream = TlsConnector::connect(&builder, domain, tcp)?;
                Ok(stream)
            })?;

        client.login(login, password).map_err(|res| Error::from(res.0))
    }

    /// Connect and log in, retrying with a fixed back-off.
    fn connect(&self) -> Result<ImapSession> {
        let mut attempt = 1;
        loop {
            info!(
                server = %self.config.server,
                port = self.config.port,
                attempt,
                "Connecting to IMAP server"
            );
            match self.create_session() {
                Ok(session) => {
                    info!("Successfully connected to IMAP server");
                    return Ok(session);
                }
                Err(e @ Error::Validation(_)) => return Err(e),
                Err(e) => {
                    error!(
                        attempt,
                        max_attempts = CONNECT_ATTEMPTS,
                        error = %e,
                        "Error connecting to IMAP server"
                    );
                    if attempt >= CONNECT_ATTEMPTS {
                        return Err(e);
                    }
                    std::thread::sleep(CONNECT_BACKOFF);
                    attempt += 1;
                }
            }
        }
    }

    /// Blocking fetch, run on the blocking pool.
    fn fetch_blocking(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ParsedEmail>> {
        let (account, _) = self.credentials()?;
        let window_start = Utc.from_utc_datetime(&start.and_time(NaiveTime::MIN));
        let window_end = Utc.from_utc_datetime(&end.and_time(NaiveTime::MIN))
            + chrono::Duration::seconds(86_399);

        let mut session = self.connect()?;
        session.select(&self.config.folder)?;
        info!(folder = %self.config.folder, "Selected folder");

        let query = search_query(start);
        debug!(%query, "Searching messages");
        let mut seqs: Vec<u32> = session.search(&query)?.into_iter().collect();
        seqs.sort_unstable();
        info!(count = seqs.len(), folder = %self.config.folder, "Found messages");

        let mut emails = Vec::new();
        for seq in seqs {
            let fetches = match session.fetch(seq.to_string(), "BODY.PEEK[]") {
                Ok(fetches) => fetches,
                Err(e) => {
                    error!(seq, error = %e, "Error fetching message");
                    continue;
                }
            };

            for fetch in fetches.iter() {
                let Some(raw) = fetch.body() else {
                    continue;
                };
                match mime::parse_message(raw, seq, account, &self.config.folder) {
                    Ok(Some(email))
                        if email.received_time >= window_start
                            && email.received_time <= window_end =>
                    {
                        emails.push(email)
                    }
                    Ok(_) => {}
                    Err(e) => error!(seq, error = %e, "Error processing message"),
                }
            }
        }

        if let Err(e) = session.logout() {
            warn!(error = %e, "Error disconnecting from IMAP server");
        }

        info!(count = emails.len(), "Successfully retrieved emails");
        Ok(emails)
    }
}

#[async_trait]
impl MailSource for ImapMailSource {
    fn account(&self) -> &str {
        self.config.email.as_deref().unwrap_or_default()
    }

    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<ParsedEmail>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.fetch_blocking(start, end)).await?
    }
}

/// `SEARCH` criteria for messages since `start`.
pub fn search_query(start: NaiveDate) -> String {
    format!("SINCE {}", start.format("%d-%b-%Y"))
}
