//! Mailbox collaborators.
//!
//! The pipeline only needs one read operation: fetch the emails received
//! since a point in time. Authentication and transport stay in here.

pub mod imap;
pub mod parse;

pub use imap::{ImapConfig, ImapMailbox};

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MailboxError;
use crate::pipeline::types::EmailRecord;

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn fetch_recent_emails(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>, MailboxError>;
}

/// A fixed set of emails, e.g. loaded from a JSON export.
#[derive(Debug, Clone, Default)]
pub struct StaticMailbox {
    emails: Vec<EmailRecord>,
}

impl StaticMailbox {
    pub fn new(emails: Vec<EmailRecord>) -> Self {
        Self { emails }
    }

    /// Load a JSON array of email records.
    pub fn from_json_file(path: &Path) -> Result<Self, MailboxError> {
        let content = std::fs::read_to_string(path)?;
        let emails: Vec<EmailRecord> = serde_json::from_str(&content)
            .map_err(|e| MailboxError::Protocol(format!("{}: {e}", path.display())))?;
        Ok(Self::new(emails))
    }
}

#[async_trait]
impl Mailbox for StaticMailbox {
    async fn fetch_recent_emails(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>, MailboxError> {
        Ok(self
            .emails
            .iter()
            .filter(|e| e.received_at >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;

    #[tokio::test]
    async fn static_mailbox_filters_by_since() {
        let now = Utc::now();
        let mailbox = StaticMailbox::new(vec![
            EmailRecord::new("old", "a@x.com", "old", "old body", now - Duration::days(10)),
            EmailRecord::new("new", "b@x.com", "new", "new body", now - Duration::days(1)),
        ]);
        let fetched = mailbox
            .fetch_recent_emails(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, "new");
    }

    #[test]
    fn loads_json_export() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "m-1", "received_at": "2026-10-12T09:30:00Z", "sender": "a@x.com",
                "subject": "Hi", "body_text": "Hello"}}]"#
        )
        .unwrap();
        let mailbox = StaticMailbox::from_json_file(file.path()).unwrap();
        assert_eq!(mailbox.emails.len(), 1);
        assert!(mailbox.emails[0].detected_language.is_none());
    }

    #[test]
    fn bad_json_is_a_protocol_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            StaticMailbox::from_json_file(file.path()),
            Err(MailboxError::Protocol(_))
        ));
    }
}
