//! End-to-end triage runs against a scripted LLM provider and an in-memory
//! libSQL audit store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::timeout;

use mail_triage::config::TriageConfig;
use mail_triage::error::LlmError;
use mail_triage::llm::LlmInference;
use mail_triage::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use mail_triage::mailbox::StaticMailbox;
use mail_triage::pipeline::TriageOrchestrator;
use mail_triage::pipeline::resilience::RetryPolicy;
use mail_triage::pipeline::taxonomy::{Department, Intent, Taxonomy};
use mail_triage::pipeline::types::{EmailRecord, PipelineStatus, RecordOutcome, Stage};
use mail_triage::store::{AuditStore, LibSqlAuditStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Scripted provider: one canned reply each for summary, classification and
/// drafting prompts. Counts calls per prompt kind.
struct ScriptedLlm {
    classify_reply: String,
    draft_reply: String,
    delay: Option<Duration>,
    summary_calls: AtomicUsize,
    classify_calls: AtomicUsize,
    draft_calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(classify_reply: &str, draft_reply: &str) -> Self {
        Self {
            classify_reply: classify_reply.to_string(),
            draft_reply: draft_reply.to_string(),
            delay: None,
            summary_calls: AtomicUsize::new(0),
            classify_calls: AtomicUsize::new(0),
            draft_calls: AtomicUsize::new(0),
        }
    }

    fn hanging() -> Self {
        Self {
            delay: Some(Duration::from_secs(5)),
            ..Self::new("{}", "{}")
        }
    }

    fn calls(&self) -> usize {
        self.summary_calls.load(Ordering::SeqCst)
            + self.classify_calls.load(Ordering::SeqCst)
            + self.draft_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let system = request
            .messages
            .first()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let content = if system.contains("executive summary") {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            SUMMARY.to_string()
        } else if system.contains("single best intent") {
            self.classify_calls.fetch_add(1, Ordering::SeqCst);
            self.classify_reply.clone()
        } else {
            self.draft_calls.fetch_add(1, Ordering::SeqCst);
            self.draft_reply.clone()
        };
        Ok(CompletionResponse {
            content,
            input_tokens: 10,
            output_tokens: 10,
        })
    }
}

const SUMMARY: &str = "Alice wants to cancel her subscription.";
const CANCEL_CLASSIFY: &str =
    r#"{"intent": "Sales.Cancellation", "certainty": 0.9, "sentiment": "negative"}"#;
const BOTH_DRAFTS: &str = r#"{"formal": "Dear customer, we have received your cancellation request.", "friendly": "Hi! Sorry to see you go, we're on it."}"#;

fn config() -> TriageConfig {
    TriageConfig {
        inference_retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(100),
        },
        store_retry: RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            timeout: Duration::from_secs(2),
        },
        ..TriageConfig::default()
    }
}

async fn setup(llm: Arc<ScriptedLlm>) -> (TriageOrchestrator, Arc<LibSqlAuditStore>) {
    let taxonomy = Taxonomy::standard();
    let inference = Arc::new(LlmInference::new(llm, &taxonomy));
    let store = Arc::new(LibSqlAuditStore::new_memory().await.unwrap());
    let orchestrator =
        TriageOrchestrator::new(&config(), Arc::new(taxonomy), inference, store.clone());
    (orchestrator, store)
}

fn cancellation_email(id: &str) -> EmailRecord {
    EmailRecord::new(
        id,
        "alice@example.com",
        "Cancellation request",
        "Please cancel my subscription",
        Utc::now(),
    )
}

#[tokio::test]
async fn cancellation_email_is_synced() {
    timeout(TEST_TIMEOUT, async {
        let llm = Arc::new(ScriptedLlm::new(CANCEL_CLASSIFY, BOTH_DRAFTS));
        let (orchestrator, store) = setup(llm).await;

        let outcome = orchestrator.process_email(cancellation_email("m-1")).await;
        let RecordOutcome::Stored(record) = outcome else {
            panic!("expected a stored record, got {outcome:?}");
        };

        assert_eq!(record.language, "en");
        assert_eq!(record.summary, SUMMARY);
        assert_eq!(record.classification.intent(), Intent::Cancellation);
        assert_eq!(record.classification.intent().label(), "Sales.Cancellation");
        assert_eq!(record.classification.department(), Department::Sales);
        assert!(record.scoring.confidence >= 0.5);
        assert!(!record.drafts.formal_text.is_empty());
        assert!(!record.drafts.friendly_text.is_empty());
        assert_eq!(record.pipeline_status, PipelineStatus::Synced);

        let stored = store.get("m-1").await.unwrap().unwrap();
        assert_eq!(stored.record_id, record.record_id);
        assert_eq!(stored.pipeline_status, PipelineStatus::Synced);
        assert_eq!(stored.summary, SUMMARY);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn same_email_twice_is_a_no_op() {
    timeout(TEST_TIMEOUT, async {
        let llm = Arc::new(ScriptedLlm::new(CANCEL_CLASSIFY, BOTH_DRAFTS));
        let (orchestrator, store) = setup(Arc::clone(&llm)).await;

        orchestrator.process_email(cancellation_email("m-1")).await;
        let calls_after_first = llm.calls();

        let summary = orchestrator
            .process_batch(Utc::now(), vec![cancellation_email("m-1")])
            .await;
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.synced, 0);
        assert_eq!(llm.calls(), calls_after_first);
        assert_eq!(store.list_recent(10).await.unwrap().len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn classification_timeouts_fail_the_record() {
    timeout(TEST_TIMEOUT, async {
        let llm = Arc::new(ScriptedLlm::hanging());
        let (orchestrator, store) = setup(llm).await;

        let summary = orchestrator
            .process_batch(Utc::now(), vec![cancellation_email("m-1")])
            .await;
        assert_eq!(summary.failed, 1);
        let report = &summary.records[0];
        assert_eq!(report.status, PipelineStatus::Failed(Stage::Classified).to_string());
        assert_eq!(report.status, "FAILED_CLASSIFIED");
        assert!(report.error.as_deref().unwrap().contains("3 attempt"));
        assert!(!store.exists("m-1").await.unwrap());
        assert!(!summary.is_clean());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missing_friendly_draft_is_kept_as_draft_failed() {
    timeout(TEST_TIMEOUT, async {
        let llm = Arc::new(ScriptedLlm::new(
            CANCEL_CLASSIFY,
            r#"{"formal": "Dear customer, your request is noted."}"#,
        ));
        let (orchestrator, store) = setup(llm).await;

        let summary = orchestrator
            .process_batch(Utc::now(), vec![cancellation_email("m-1")])
            .await;
        assert_eq!(summary.draft_failed, 1);

        let record = store.get("m-1").await.unwrap().unwrap();
        assert_eq!(record.pipeline_status, PipelineStatus::DraftFailed);
        assert!(!record.drafts.formal_text.is_empty());
        assert!(record.drafts.friendly_text.is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn label_outside_taxonomy_is_unclassified() {
    timeout(TEST_TIMEOUT, async {
        let llm = Arc::new(ScriptedLlm::new(
            r#"{"intent": "Sales.TimeTravel", "certainty": 0.99}"#,
            BOTH_DRAFTS,
        ));
        let (orchestrator, _store) = setup(llm).await;

        let RecordOutcome::Stored(record) =
            orchestrator.process_email(cancellation_email("m-1")).await
        else {
            panic!("expected a stored record");
        };
        assert_eq!(record.classification.intent(), Intent::Unclassified);
        assert_eq!(record.classification.department(), Department::General);
        assert!(record.scoring.confidence <= 0.3);
        assert_eq!(
            record.classification.raw_model_signal().unwrap().intent_label,
            "Sales.TimeTravel"
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn run_since_reads_the_mailbox_window() {
    timeout(TEST_TIMEOUT, async {
        let llm = Arc::new(ScriptedLlm::new(CANCEL_CLASSIFY, BOTH_DRAFTS));
        let (orchestrator, _store) = setup(llm).await;

        let old = EmailRecord::new(
            "old",
            "carol@example.com",
            "Cancellation request",
            "Please cancel my old subscription",
            Utc::now() - chrono::Duration::days(30),
        );
        let mailbox = StaticMailbox::new(vec![old, cancellation_email("new")]);

        let summary = orchestrator.run_lookback(&mailbox, None).await.unwrap();
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.synced, 1);
        assert!(summary.languages.contains("en"));
        assert_eq!(summary.records[0].email_id, "new");
        assert!(!orchestrator.is_running());
    })
    .await
    .expect("test timed out");
}
