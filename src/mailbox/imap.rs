//! IMAP mailbox over TLS.
//!
//! Read-only: messages are fetched with `BODY.PEEK[]` so nothing is marked
//! seen. The blocking socket work runs on the blocking pool.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};

use crate::error::MailboxError;
use crate::mailbox::Mailbox;
use crate::mailbox::parse::parse_message;
use crate::pipeline::types::EmailRecord;

/// IMAP connection settings.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
}

impl ImapConfig {
    /// Returns `None` when `EMAIL_IMAP_HOST` is unset.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let folder = std::env::var("EMAIL_IMAP_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        Some(Self {
            host,
            port,
            username,
            password,
            folder,
        })
    }
}

pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_recent_emails(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>, MailboxError> {
        let config = self.config.clone();
        let records = tokio::task::spawn_blocking(move || fetch_since_imap(&config, since))
            .await
            .map_err(|e| MailboxError::Connection(format!("IMAP task failed: {e}")))??;

        // SEARCH SINCE has day granularity.
        let records: Vec<EmailRecord> = records
            .into_iter()
            .filter(|r| r.received_at >= since)
            .collect();
        tracing::info!(host = %self.config.host, count = records.len(), "Fetched emails");
        Ok(records)
    }
}

/// IMAP date format for SEARCH, e.g. `11-Oct-2026`.
fn imap_date(since: DateTime<Utc>) -> String {
    since.format("%d-%b-%Y").to_string()
}

/// Quote a string for use in an IMAP command.
fn imap_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Parse `* SEARCH 1 2 3` responses.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(str::to_string))
        .collect()
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn read_line(tls: &mut TlsStream) -> Result<String, MailboxError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(MailboxError::Connection("IMAP connection closed".into())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn send_cmd(tls: &mut TlsStream, tag: &str, cmd: &str) -> Result<Vec<String>, MailboxError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes())?;
    IoWrite::flush(tls)?;
    let mut lines = Vec::new();
    loop {
        let line = read_line(tls)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

fn tagged_ok(lines: &[String], tag: &str) -> bool {
    lines
        .last()
        .is_some_and(|l| l.starts_with(tag) && l[tag.len()..].trim_start().starts_with("OK"))
}

/// Fetch messages received since `since` (blocking).
fn fetch_since_imap(
    config: &ImapConfig,
    since: DateTime<Utc>,
) -> Result<Vec<EmailRecord>, MailboxError> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .map_err(|e| MailboxError::Connection(format!("{}:{}: {e}", config.host, config.port)))?;
    tcp.set_read_timeout(Some(Duration::from_secs(30)))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(config.host.clone())
        .map_err(|e| MailboxError::Connection(format!("invalid host name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::Connection(format!("TLS setup failed: {e}")))?;
    let mut tls = rustls::StreamOwned::new(conn, tcp);

    let _greeting = read_line(&mut tls)?;

    let login = send_cmd(
        &mut tls,
        "A1",
        &format!(
            "LOGIN {} {}",
            imap_quote(&config.username),
            imap_quote(config.password.expose_secret())
        ),
    )?;
    if !tagged_ok(&login, "A1") {
        return Err(MailboxError::AuthFailed(config.username.clone()));
    }

    let select = send_cmd(&mut tls, "A2", &format!("EXAMINE {}", imap_quote(&config.folder)))?;
    if !tagged_ok(&select, "A2") {
        return Err(MailboxError::Protocol(format!(
            "cannot open folder {}",
            config.folder
        )));
    }

    let search = send_cmd(&mut tls, "A3", &format!("UID SEARCH SINCE {}", imap_date(since)))?;
    if !tagged_ok(&search, "A3") {
        return Err(MailboxError::Protocol("UID SEARCH failed".into()));
    }
    let uids = parse_search(&search);
    tracing::debug!(count = uids.len(), "IMAP search matched");

    let mut records = Vec::new();
    let mut tag_counter = 4_u32;

    for uid in &uids {
        let tag = format!("A{tag_counter}");
        tag_counter += 1;
        let resp = send_cmd(&mut tls, &tag, &format!("UID FETCH {uid} BODY.PEEK[]"))?;

        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(2))
            .cloned()
            .collect();

        match parse_message(raw.as_bytes(), &format!("imap-uid-{uid}")) {
            Some(record) => records.push(record),
            None => tracing::warn!(uid = %uid, "Unparsable message skipped"),
        }
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, &logout_tag, "LOGOUT");

    Ok(records)
}
