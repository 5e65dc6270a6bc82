//! Reply drafting.
//!
//! One combined request asks for both variants. Variants that come back
//! missing are requested again on their own until the round budget is
//! spent. Whatever was produced is kept; drafting never fails the record.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::llm::inference::{DraftRequest, InferenceClient};
use crate::mailbox::parse::truncate_chars;
use crate::pipeline::resilience::Guard;
use crate::pipeline::types::{EmailRecord, IntentClassification, ReplyDraftPair};

/// Result of the drafting stage.
#[derive(Debug, Clone, PartialEq)]
pub struct DraftOutcome {
    pub drafts: ReplyDraftPair,
    /// Last error seen, if any variant is still missing.
    pub error: Option<String>,
}

impl DraftOutcome {
    pub fn is_complete(&self) -> bool {
        self.drafts.is_complete()
    }
}

pub struct ReplyDrafter {
    inference: Arc<dyn InferenceClient>,
    guard: Guard,
    max_body_chars: usize,
}

impl ReplyDrafter {
    pub fn new(inference: Arc<dyn InferenceClient>, guard: Guard, max_body_chars: usize) -> Self {
        Self {
            inference,
            guard,
            max_body_chars,
        }
    }

    pub async fn draft(
        &self,
        email: &EmailRecord,
        classification: &IntentClassification,
        language: &str,
    ) -> DraftOutcome {
        let mut drafts = ReplyDraftPair::default();
        let mut error = None;
        let rounds = self.guard.policy().max_attempts.max(1);
        let text = truncate_chars(&email.body_text, self.max_body_chars).to_string();

        for round in 1..=rounds {
            let missing = drafts.missing();
            if missing.is_empty() {
                break;
            }
            let request = DraftRequest {
                subject: email.subject.clone(),
                text: text.clone(),
                intent: classification.intent(),
                language: language.to_string(),
                variants: missing.clone(),
            };

            match self
                .guard
                .call("draft_replies", || self.inference.draft_replies(&request))
                .await
            {
                Ok(replies) => {
                    for variant in &missing {
                        if let Some(text) = replies.get(*variant) {
                            drafts.set(*variant, text.to_string());
                        }
                    }
                    let still_missing = drafts.missing();
                    if !still_missing.is_empty() {
                        let names: Vec<&str> = still_missing.iter().map(|v| v.as_str()).collect();
                        warn!(email_id = %email.id, round, missing = ?names, "Draft variants missing");
                        error = Some(format!("no {} draft returned", names.join(" or ")));
                    }
                }
                Err(e) => {
                    warn!(email_id = %email.id, round, error = %e, "Drafting failed");
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        if drafts.is_complete() {
            error = None;
            debug!(email_id = %email.id, "Both drafts produced");
        }
        DraftOutcome { drafts, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InferenceError;
    use crate::llm::inference::DraftReplies;
    use crate::pipeline::resilience::{CircuitBreaker, RetryPolicy};
    use crate::pipeline::taxonomy::{Intent, Taxonomy};
    use crate::pipeline::types::{RawModelSignal, ReplyVariant};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Replies from a script, one entry per call; records requested variants.
    struct ScriptedDrafts {
        script: Mutex<Vec<Result<DraftReplies, InferenceError>>>,
        requests: Mutex<Vec<Vec<ReplyVariant>>>,
    }

    impl ScriptedDrafts {
        fn new(script: Vec<Result<DraftReplies, InferenceError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InferenceClient for ScriptedDrafts {
        async fn classify_and_score(
            &self,
            _text: &str,
            _language: &str,
        ) -> Result<RawModelSignal, InferenceError> {
            Err(InferenceError::Rejected("not used".into()))
        }

        async fn draft_replies(&self, request: &DraftRequest) -> Result<DraftReplies, InferenceError> {
            self.requests.lock().unwrap().push(request.variants.clone());
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(InferenceError::Transient("script exhausted".into()));
            }
            script.remove(0)
        }

        async fn summarize(&self, _text: &str, _language: &str) -> Result<String, InferenceError> {
            Err(InferenceError::Rejected("not used".into()))
        }
    }

    fn drafter(client: Arc<ScriptedDrafts>) -> ReplyDrafter {
        let guard = Guard::new(
            RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                timeout: Duration::from_secs(1),
            },
            Arc::new(CircuitBreaker::new("inference", 10)),
        );
        ReplyDrafter::new(client, guard, 2500)
    }

    fn inputs() -> (EmailRecord, IntentClassification) {
        let email = EmailRecord::new(
            "m-1",
            "a@example.com",
            "Cancellation request",
            "Please cancel my subscription",
            Utc::now(),
        );
        let c = IntentClassification::new(Intent::Cancellation, &Taxonomy::standard(), None, 1.0);
        (email, c)
    }

    fn replies(formal: Option<&str>, friendly: Option<&str>) -> DraftReplies {
        DraftReplies {
            formal: formal.map(str::to_string),
            friendly: friendly.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn combined_call_fills_both() {
        let client = ScriptedDrafts::new(vec![Ok(replies(Some("Dear"), Some("Hi")))]);
        let (email, c) = inputs();
        let outcome = drafter(client.clone()).draft(&email, &c, "en").await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.drafts.formal_text, "Dear");
        assert_eq!(outcome.drafts.friendly_text, "Hi");
        assert!(outcome.error.is_none());
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_variant_is_requested_alone() {
        let client = ScriptedDrafts::new(vec![
            Ok(replies(Some("Dear"), None)),
            Ok(replies(None, Some("Hi"))),
        ]);
        let (email, c) = inputs();
        let outcome = drafter(client.clone()).draft(&email, &c, "en").await;
        assert!(outcome.is_complete());
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests[0], vec![ReplyVariant::Formal, ReplyVariant::Friendly]);
        assert_eq!(requests[1], vec![ReplyVariant::Friendly]);
    }

    #[tokio::test]
    async fn formal_kept_when_friendly_never_arrives() {
        let client = ScriptedDrafts::new(vec![
            Ok(replies(Some("Dear"), None)),
            Ok(replies(None, None)),
            Ok(replies(None, None)),
        ]);
        let (email, c) = inputs();
        let outcome = drafter(client).draft(&email, &c, "en").await;
        assert!(!outcome.is_complete());
        assert_eq!(outcome.drafts.formal_text, "Dear");
        assert!(outcome.drafts.friendly_text.is_empty());
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn outage_leaves_both_empty() {
        let client = ScriptedDrafts::new(vec![]);
        let (email, c) = inputs();
        let outcome = drafter(client).draft(&email, &c, "en").await;
        assert_eq!(outcome.drafts, ReplyDraftPair::default());
        assert!(outcome.error.unwrap().contains("attempt"));
    }
}
