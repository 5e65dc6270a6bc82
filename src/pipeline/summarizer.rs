//! Executive summary of an email.
//!
//! A short briefing written in the email's language. It feeds the
//! classification prompt and is stored on the record. Like drafting, it
//! never fails the record: an unavailable summary is stored empty.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::inference::InferenceClient;
use crate::mailbox::parse::truncate_chars;
use crate::pipeline::resilience::Guard;
use crate::pipeline::types::EmailRecord;

/// Body characters sent to the model.
const MAX_SUMMARY_INPUT_CHARS: usize = 1500;
/// Longest summary kept on a record.
pub const MAX_SUMMARY_CHARS: usize = 2000;

pub struct Summarizer {
    inference: Arc<dyn InferenceClient>,
    guard: Guard,
}

impl Summarizer {
    pub fn new(inference: Arc<dyn InferenceClient>, guard: Guard) -> Self {
        Self { inference, guard }
    }

    /// Summarize `email` in `language`, or return an empty string.
    pub async fn summarize(&self, email: &EmailRecord, language: &str) -> String {
        let text = format!(
            "Subject: {}\n\n{}",
            email.subject,
            truncate_chars(&email.body_text, MAX_SUMMARY_INPUT_CHARS)
        );

        match self
            .guard
            .call("summarize", || self.inference.summarize(&text, language))
            .await
        {
            Ok(summary) => {
                let summary = truncate_chars(summary.trim(), MAX_SUMMARY_CHARS).to_string();
                debug!(email_id = %email.id, chars = summary.chars().count(), "Summary produced");
                summary
            }
            Err(e) => {
                warn!(email_id = %email.id, error = %e, "Summary unavailable, stored empty");
                String::new()
            }
        }
    }
}
