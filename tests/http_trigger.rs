//! Integration tests for the HTTP trigger.
//!
//! Each test spins up an Axum server on a random port and drives the REST
//! contract with reqwest.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use mail_triage::config::TriageConfig;
use mail_triage::error::{InferenceError, MailboxError};
use mail_triage::llm::{DraftReplies, DraftRequest, InferenceClient};
use mail_triage::mailbox::{Mailbox, StaticMailbox};
use mail_triage::pipeline::TriageOrchestrator;
use mail_triage::pipeline::taxonomy::Taxonomy;
use mail_triage::pipeline::types::{EmailRecord, RawModelSignal};
use mail_triage::server::triage_routes;
use mail_triage::store::{AuditStore, MemoryAuditStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Labels every email as a demo request, optionally after a delay.
struct StubInference {
    delay: Duration,
}

#[async_trait]
impl InferenceClient for StubInference {
    async fn classify_and_score(
        &self,
        _text: &str,
        _language: &str,
    ) -> Result<RawModelSignal, InferenceError> {
        tokio::time::sleep(self.delay).await;
        Ok(RawModelSignal {
            intent_label: "Sales.EnterpriseDemo".into(),
            certainty: Some(0.8),
            sentiment: Some("opportunity".into()),
        })
    }

    async fn draft_replies(&self, _request: &DraftRequest) -> Result<DraftReplies, InferenceError> {
        Ok(DraftReplies {
            formal: Some("Dear Dana, thank you for your interest.".into()),
            friendly: Some("Hi Dana, happy to set up a demo!".into()),
        })
    }

    async fn summarize(&self, _text: &str, _language: &str) -> Result<String, InferenceError> {
        Ok("Prospect asks for an enterprise demo.".into())
    }
}

struct DownMailbox;

#[async_trait]
impl Mailbox for DownMailbox {
    async fn fetch_recent_emails(
        &self,
        _since: DateTime<Utc>,
    ) -> Result<Vec<EmailRecord>, MailboxError> {
        Err(MailboxError::Connection("imap.example.com:993 refused".into()))
    }
}

fn inbox() -> StaticMailbox {
    StaticMailbox::new(vec![
        EmailRecord::new(
            "demo-1",
            "dana@example.com",
            "Demo request",
            "Hi, could we get a demo of the enterprise plan for our team next week?",
            Utc::now(),
        ),
        EmailRecord::new(
            "demo-2",
            "erin@example.com",
            "Walkthrough",
            "We would like a walkthrough of the product for our sales team, please.",
            Utc::now(),
        ),
    ])
}

fn bulk_inbox(count: usize) -> StaticMailbox {
    StaticMailbox::new(
        (1..=count)
            .map(|i| {
                EmailRecord::new(
                    format!("bulk-{i}"),
                    "dana@example.com",
                    "Demo request",
                    "Hi, could we get a demo of the enterprise plan for our team next week?",
                    Utc::now(),
                )
            })
            .collect(),
    )
}

/// Start an Axum server on a random port, return its base URL.
async fn start_server(mailbox: Arc<dyn Mailbox>, delay: Duration) -> String {
    start_server_with(mailbox, delay, TriageConfig::default()).await.0
}

/// Like `start_server`, with a custom config; also returns the store.
async fn start_server_with(
    mailbox: Arc<dyn Mailbox>,
    delay: Duration,
    config: TriageConfig,
) -> (String, Arc<MemoryAuditStore>) {
    let store = Arc::new(MemoryAuditStore::new());
    let orchestrator = Arc::new(TriageOrchestrator::new(
        &config,
        Arc::new(Taxonomy::standard()),
        Arc::new(StubInference { delay }),
        store.clone(),
    ));
    let app = triage_routes(orchestrator, mailbox);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), store)
}

#[tokio::test]
async fn index_and_health() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(inbox()), Duration::ZERO).await;
        let client = reqwest::Client::new();

        let index: Value = client.get(&base).send().await.unwrap().json().await.unwrap();
        assert_eq!(index["service"], "mail-triage");
        assert!(index["endpoints"].as_array().unwrap().len() >= 3);

        let resp = client.get(format!("{base}/health")).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        let health: Value = resp.json().await.unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["batch_running"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn process_emails_then_list_records() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(inbox()), Duration::ZERO).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{base}/process-emails"))
            .json(&json!({"lookback_days": 7}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let summary: Value = resp.json().await.unwrap();
        assert_eq!(summary["fetched"], 2);
        assert_eq!(summary["synced"], 2);
        assert_eq!(summary["failed"], 0);
        assert_eq!(summary["records"].as_array().unwrap().len(), 2);

        // A second run finds both already triaged.
        let summary: Value = client
            .post(format!("{base}/process-emails"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["duplicates"], 2);

        let records: Value = client
            .get(format!("{base}/api/records?limit=1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let records = records.as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["pipeline_status"], "SYNCED");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_trigger_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(inbox()), Duration::from_millis(500)).await;
        let client = reqwest::Client::new();
        let url = format!("{base}/process-emails");

        let (a, b) = tokio::join!(client.post(&url).send(), client.post(&url).send());
        let mut statuses = vec![a.unwrap().status().as_u16(), b.unwrap().status().as_u16()];
        statuses.sort_unstable();
        assert_eq!(statuses, vec![200, 409]);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_without_batch_is_conflict() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(inbox()), Duration::ZERO).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/process-emails/cancel"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mailbox_failure_is_reported_without_internals() {
    timeout(TEST_TIMEOUT, async {
        let base = start_server(Arc::new(DownMailbox), Duration::ZERO).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/process-emails"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("Mailbox fetch failed"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn batch_finishes_after_client_disconnects() {
    timeout(TEST_TIMEOUT, async {
        let (base, store) = start_server_with(
            Arc::new(bulk_inbox(3)),
            Duration::from_millis(200),
            TriageConfig::default(),
        )
        .await;
        let impatient = reqwest::Client::builder()
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        let result = impatient.post(format!("{base}/process-emails")).send().await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.len(), 3);
        let health: Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["batch_running"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn cancel_stops_a_running_batch() {
    timeout(TEST_TIMEOUT, async {
        let config = TriageConfig {
            max_concurrent: 2,
            ..TriageConfig::default()
        };
        let (base, store) =
            start_server_with(Arc::new(bulk_inbox(6)), Duration::from_millis(300), config).await;
        let client = reqwest::Client::new();

        let (batch, cancel) = tokio::join!(
            client.post(format!("{base}/process-emails")).send(),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                client.post(format!("{base}/process-emails/cancel")).send().await
            }
        );

        let cancel = cancel.unwrap();
        assert_eq!(cancel.status(), 202);
        let body: Value = cancel.json().await.unwrap();
        assert_eq!(body["status"], "cancelling");

        let batch = batch.unwrap();
        assert_eq!(batch.status(), 200);
        let summary: Value = batch.json().await.unwrap();
        assert_eq!(summary["cancelled"], true);
        assert_eq!(summary["fetched"], 6);
        assert_eq!(summary["synced"], 2);
        assert_eq!(summary["not_attempted"], 4);
        assert_eq!(store.len(), 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn reprocess_route_overwrites_stored_record() {
    timeout(TEST_TIMEOUT, async {
        let (base, store) =
            start_server_with(Arc::new(inbox()), Duration::ZERO, TriageConfig::default()).await;
        let client = reqwest::Client::new();

        // Nothing stored yet.
        let resp = client
            .post(format!("{base}/api/records/demo-1/reprocess"))
            .json(&json!({"reason": "taxonomy update"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.post(format!("{base}/process-emails")).send().await.unwrap();
        assert_eq!(resp.status(), 200);

        let resp = client
            .post(format!("{base}/api/records/demo-1/reprocess"))
            .json(&json!({"reason": "  "}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);

        let resp = client
            .post(format!("{base}/api/records/demo-1/reprocess"))
            .json(&json!({"reason": "taxonomy update"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let record: Value = resp.json().await.unwrap();
        assert_eq!(record["email_id"], "demo-1");
        assert_eq!(record["revision"], 2);
        assert_eq!(record["summary"], "Prospect asks for an enterprise demo.");

        let history = store.overwrite_history("demo-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "taxonomy update");
    })
    .await
    .expect("test timed out");
}
