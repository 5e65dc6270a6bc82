//! Triage orchestrator.
//!
//! Sequences the stages for each email and owns the state machine:
//!
//! ```text
//! exists? ──yes──> DUPLICATE (no-op)
//!    │no
//! RECEIVED → LANGUAGE_DETECTED → (summary) → CLASSIFIED → SCORED → DRAFTED → SYNCED
//!                                                  └─────────→ DRAFT_FAILED
//! any stage that cannot be reached → FAILED_<STAGE>
//! ```
//!
//! Records run concurrently within a batch; stages within one record run
//! in order. The `exists` + `write` pair is serialized per email id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TriageConfig;
use crate::error::{DatabaseError, PipelineError};
use crate::llm::inference::InferenceClient;
use crate::mailbox::Mailbox;
use crate::pipeline::classifier::IntentClassifier;
use crate::pipeline::drafter::ReplyDrafter;
use crate::pipeline::language::LanguageDetector;
use crate::pipeline::resilience::{CallError, CircuitBreaker, Guard};
use crate::pipeline::scorer::Scorer;
use crate::pipeline::summarizer::Summarizer;
use crate::pipeline::taxonomy::{Intent, Taxonomy};
use crate::pipeline::types::{
    BatchSummary, EmailRecord, PipelineStatus, RecordOutcome, ReplyDraftPair, Stage,
    StatusTracker, TriageRecord,
};
use crate::store::AuditStore;

const INFERENCE: &str = "inference";
const AUDIT_STORE: &str = "audit_store";

/// A stage that could not be reached.
struct StageFailure {
    status: PipelineStatus,
    error: PipelineError,
}

/// Clears the running flag when a batch ends, however it ends.
struct BatchGuard<'a>(&'a AtomicBool);

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TriageOrchestrator {
    store: Arc<dyn AuditStore>,
    detector: LanguageDetector,
    summarizer: Summarizer,
    classifier: IntentClassifier,
    scorer: Scorer,
    drafter: ReplyDrafter,
    store_guard: Guard,
    inference_breaker: Arc<CircuitBreaker>,
    min_body_chars: usize,
    max_concurrent: usize,
    lookback: Duration,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    cancelled: AtomicBool,
    running: AtomicBool,
}

impl TriageOrchestrator {
    pub fn new(
        config: &TriageConfig,
        taxonomy: Arc<Taxonomy>,
        inference: Arc<dyn InferenceClient>,
        store: Arc<dyn AuditStore>,
    ) -> Self {
        let inference_breaker = Arc::new(CircuitBreaker::new(INFERENCE, config.breaker_threshold));
        let store_breaker = Arc::new(CircuitBreaker::new(AUDIT_STORE, config.breaker_threshold));
        let inference_guard = Guard::new(config.inference_retry, Arc::clone(&inference_breaker));

        Self {
            store,
            detector: LanguageDetector::new(config.default_language.clone()),
            summarizer: Summarizer::new(Arc::clone(&inference), inference_guard.clone()),
            classifier: IntentClassifier::new(
                Arc::clone(&inference),
                taxonomy,
                inference_guard.clone(),
                config.max_body_chars,
            ),
            scorer: Scorer::new(config.scoring),
            drafter: ReplyDrafter::new(inference, inference_guard, config.max_body_chars),
            store_guard: Guard::new(config.store_retry, store_breaker),
            inference_breaker,
            min_body_chars: config.min_body_chars,
            max_concurrent: config.max_concurrent.max(1),
            lookback: config.lookback,
            locks: Mutex::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
            running: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop picking up new records. Records in flight still finish.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            info!("Batch cancellation requested");
        }
    }

    // ── Batch runs ──────────────────────────────────────────────────

    /// Fetch everything received since `now - lookback` and triage it.
    pub async fn run_lookback(
        &self,
        mailbox: &dyn Mailbox,
        lookback: Option<Duration>,
    ) -> Result<BatchSummary, PipelineError> {
        let window = chrono::Duration::from_std(lookback.unwrap_or(self.lookback))
            .unwrap_or_else(|_| chrono::Duration::days(7));
        self.run_since(mailbox, Utc::now() - window).await
    }

    /// Fetch everything received since `since` and triage it.
    ///
    /// Only one batch runs at a time; a second call gets `BatchInProgress`.
    pub async fn run_since(
        &self,
        mailbox: &dyn Mailbox,
        since: DateTime<Utc>,
    ) -> Result<BatchSummary, PipelineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PipelineError::BatchInProgress);
        }
        let _batch = BatchGuard(&self.running);
        self.cancelled.store(false, Ordering::SeqCst);

        let emails = mailbox.fetch_recent_emails(since).await.map_err(|e| {
            error!(error = %e, "Mailbox fetch failed");
            PipelineError::from(e)
        })?;
        info!(count = emails.len(), since = %since, "Fetched emails for triage");

        Ok(self.triage_batch(since, emails).await)
    }

    /// Triage a fetched batch. Every email appears in the summary with its
    /// terminal status.
    pub async fn process_batch(&self, since: DateTime<Utc>, emails: Vec<EmailRecord>) -> BatchSummary {
        self.cancelled.store(false, Ordering::SeqCst);
        self.triage_batch(since, emails).await
    }

    /// Cancellation requested after the batch started is honoured here.
    async fn triage_batch(&self, since: DateTime<Utc>, emails: Vec<EmailRecord>) -> BatchSummary {
        let mut summary = BatchSummary::new(since, Utc::now());
        summary.fetched = emails.len();
        self.inference_breaker.reset();
        self.store_guard.breaker().reset();

        let outcomes: Vec<RecordOutcome> = stream::iter(emails)
            .map(|email| async move {
                if let Some(reason) = self.halt_reason() {
                    return RecordOutcome::NotAttempted {
                        email_id: email.id,
                        reason,
                    };
                }
                self.process_email(email).await
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for outcome in &outcomes {
            summary.record(outcome);
        }
        summary.cancelled = self.cancelled.load(Ordering::SeqCst);
        summary.aborted = self
            .open_breaker()
            .map(|name| format!("{name} unavailable: circuit open"));
        summary.finished_at = Utc::now();

        if let Some(reason) = &summary.aborted {
            error!(
                reason = %reason,
                synced = summary.synced,
                failed = summary.failed,
                not_attempted = summary.not_attempted,
                "Batch aborted"
            );
        } else {
            info!(
                fetched = summary.fetched,
                synced = summary.synced,
                draft_failed = summary.draft_failed,
                failed = summary.failed,
                duplicates = summary.duplicates,
                not_attempted = summary.not_attempted,
                priority = summary.priority,
                cancelled = summary.cancelled,
                "Batch complete"
            );
        }
        summary
    }

    fn open_breaker(&self) -> Option<&'static str> {
        [&self.inference_breaker, self.store_guard.breaker()]
            .into_iter()
            .find(|b| b.is_open())
            .map(|b| b.name())
    }

    fn halt_reason(&self) -> Option<String> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Some("batch cancelled".to_string());
        }
        self.open_breaker()
            .map(|name| format!("{name} unavailable: circuit open"))
    }

    // ── Single records ──────────────────────────────────────────────

    /// Take one email to a terminal state.
    pub async fn process_email(&self, email: EmailRecord) -> RecordOutcome {
        let email_id = email.id.clone();
        let lock = self.lock_for(&email_id);
        let outcome = {
            let _held = lock.lock().await;
            self.process_locked(email).await
        };
        drop(lock);
        self.release_lock(&email_id);

        match &outcome {
            RecordOutcome::Stored(record) => info!(
                email_id = %record.email_id,
                status = %record.pipeline_status,
                intent = %record.classification.intent(),
                department = %record.classification.department(),
                confidence = record.scoring.confidence,
                priority = record.priority,
                "Triage record stored"
            ),
            RecordOutcome::Duplicate { email_id } => {
                info!(email_id = %email_id, status = "DUPLICATE", "Already triaged, skipped")
            }
            RecordOutcome::Failed {
                email_id,
                status,
                error,
            } => info!(email_id = %email_id, status = %status, error = %error, "Triage failed"),
            RecordOutcome::NotAttempted { .. } => {}
        }
        outcome
    }

    async fn process_locked(&self, email: EmailRecord) -> RecordOutcome {
        let email_id = email.id.clone();
        let mut tracker = StatusTracker::new(&email_id);

        match self
            .store_guard
            .call("exists", || self.store.exists(&email_id))
            .await
        {
            Ok(true) => return RecordOutcome::Duplicate { email_id },
            Ok(false) => {}
            Err(e) => {
                let failure = fail(&mut tracker, Stage::LanguageDetected, e.into_pipeline_error(AUDIT_STORE));
                return failed(email_id, failure);
            }
        }

        let record = match self.compute(email, &mut tracker).await {
            Ok(record) => record,
            Err(failure) => return failed(email_id, failure),
        };

        match self
            .store_guard
            .call("write", || self.store.write(&record))
            .await
        {
            Ok(()) => stored(&mut tracker, record),
            Err(CallError::Rejected(DatabaseError::Duplicate(_))) => {
                if self.is_our_write(&record).await {
                    debug!(email_id = %email_id, "Write acknowledged late, stored row is this run's");
                    return stored(&mut tracker, record);
                }
                warn!(email_id = %email_id, "Record written concurrently by another process");
                RecordOutcome::Duplicate { email_id }
            }
            Err(e) => {
                let failure = fail(&mut tracker, Stage::Synced, e.into_pipeline_error(AUDIT_STORE));
                failed(email_id, failure)
            }
        }
    }

    /// A retried write can hit the row an earlier, timed-out attempt committed.
    async fn is_our_write(&self, record: &TriageRecord) -> bool {
        match self
            .store_guard
            .call("get", || self.store.get(&record.email_id))
            .await
        {
            Ok(Some(existing)) => existing.record_id == record.record_id,
            Ok(None) => false,
            Err(e) => {
                warn!(email_id = %record.email_id, error = %e, "Could not read back duplicate record");
                false
            }
        }
    }

    /// Run the stages and build the record. On success the tracker sits at
    /// `DRAFTED` (or `SCORED` for a partial draft) and the record carries
    /// the status it will be stored with.
    async fn compute(
        &self,
        email: EmailRecord,
        tracker: &mut StatusTracker,
    ) -> Result<TriageRecord, StageFailure> {
        let detection = self.detector.detect(&email.subject, &email.body_text);
        debug!(
            email_id = %email.id,
            language = %detection.language,
            score = detection.score,
            fallback = detection.fallback,
            "Language detected"
        );
        let email = email.with_language(detection.language.clone());
        step(tracker, PipelineStatus::LanguageDetected)?;

        let short_body = email.body_text.trim().chars().count() < self.min_body_chars;
        let summary = if short_body {
            String::new()
        } else {
            self.summarizer.summarize(&email, &detection.language).await
        };

        let classification = if short_body {
            debug!(email_id = %email.id, "Short body, classified locally");
            self.classifier.classify_locally(&email, Intent::NoAction)
        } else {
            match self
                .classifier
                .classify(&email, &summary, &detection.language)
                .await
            {
                Ok(classification) => classification,
                Err(e) => {
                    return Err(fail(tracker, Stage::Classified, e.into_pipeline_error(INFERENCE)));
                }
            }
        };
        if classification.recovered_label() {
            warn!(
                email_id = %email.id,
                label = classification.raw_model_signal().map(|s| s.intent_label.as_str()).unwrap_or(""),
                "Label outside taxonomy, recorded as unclassified"
            );
        }
        step(tracker, PipelineStatus::Classified)?;

        let scoring = self.scorer.score(&classification, !detection.fallback);
        step(tracker, PipelineStatus::Scored)?;

        let (drafts, status) = if short_body {
            step(tracker, PipelineStatus::Drafted)?;
            (ReplyDraftPair::default(), PipelineStatus::Synced)
        } else {
            let outcome = self
                .drafter
                .draft(&email, &classification, &detection.language)
                .await;
            if outcome.is_complete() {
                step(tracker, PipelineStatus::Drafted)?;
                (outcome.drafts, PipelineStatus::Synced)
            } else {
                warn!(
                    email_id = %email.id,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Partial draft, record kept as DRAFT_FAILED"
                );
                (outcome.drafts, PipelineStatus::DraftFailed)
            }
        };

        let priority = classification.intent().is_priority();
        Ok(TriageRecord {
            record_id: Uuid::new_v4(),
            email_id: email.id,
            sender: email.sender,
            subject: email.subject,
            received_at: email.received_at,
            language: detection.language,
            summary,
            classification,
            scoring,
            drafts,
            priority,
            processed_at: Utc::now(),
            pipeline_status: status,
            revision: 1,
        })
    }

    // ── Operator reprocessing ───────────────────────────────────────

    /// Recompute the record for an email that was already triaged and
    /// replace it through an audited overwrite.
    pub async fn reprocess(
        &self,
        email: EmailRecord,
        reason: &str,
    ) -> Result<TriageRecord, PipelineError> {
        let email_id = email.id.clone();
        let lock = self.lock_for(&email_id);
        let result = {
            let _held = lock.lock().await;
            self.reprocess_locked(email, reason).await
        };
        drop(lock);
        self.release_lock(&email_id);
        result
    }

    /// Reprocess a stored record from the message still held by the mailbox.
    pub async fn reprocess_from_mailbox(
        &self,
        mailbox: &dyn Mailbox,
        email_id: &str,
        reason: &str,
    ) -> Result<TriageRecord, PipelineError> {
        let previous = self
            .store_guard
            .call("get", || self.store.get(email_id))
            .await
            .map_err(|e| e.into_pipeline_error(AUDIT_STORE))?
            .ok_or_else(|| PipelineError::RecordNotFound(email_id.to_string()))?;

        let email = mailbox
            .fetch_recent_emails(previous.received_at)
            .await
            .map_err(|e| {
                error!(email_id, error = %e, "Mailbox fetch for reprocessing failed");
                PipelineError::from(e)
            })?
            .into_iter()
            .find(|e| e.id == email_id)
            .ok_or_else(|| PipelineError::EmailUnavailable(email_id.to_string()))?;

        self.reprocess(email, reason).await
    }

    async fn reprocess_locked(
        &self,
        email: EmailRecord,
        reason: &str,
    ) -> Result<TriageRecord, PipelineError> {
        let email_id = email.id.clone();
        let previous = self
            .store_guard
            .call("get", || self.store.get(&email_id))
            .await
            .map_err(|e| e.into_pipeline_error(AUDIT_STORE))?
            .ok_or_else(|| PipelineError::RecordNotFound(email_id.clone()))?;

        let mut tracker = StatusTracker::new(&email_id);
        let mut record = self
            .compute(email, &mut tracker)
            .await
            .map_err(|failure| failure.error)?;
        record.revision = previous.revision + 1;

        let entry = self
            .store_guard
            .call("overwrite", || self.store.overwrite(&record, reason))
            .await
            .map_err(|e| e.into_pipeline_error(AUDIT_STORE))?;

        info!(
            email_id = %email_id,
            previous_status = %entry.previous_status,
            status = %entry.new_status,
            revision = record.revision,
            reason,
            "Triage record overwritten"
        );
        Ok(record)
    }

    // ── Per-id locks ────────────────────────────────────────────────

    fn lock_for(&self, email_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(email_id.to_string()).or_default())
    }

    fn release_lock(&self, email_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks
            .get(email_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(email_id);
        }
    }
}

fn stored(tracker: &mut StatusTracker, record: TriageRecord) -> RecordOutcome {
    if let Err(e) = tracker.advance(record.pipeline_status) {
        warn!(email_id = %record.email_id, error = %e, "Unexpected final transition");
    }
    RecordOutcome::Stored(Box::new(record))
}

fn step(tracker: &mut StatusTracker, next: PipelineStatus) -> Result<(), StageFailure> {
    tracker.advance(next).map_err(|e| StageFailure {
        status: tracker.status(),
        error: e.into(),
    })
}

/// Move the tracker to `FAILED_<stage>`.
fn fail(tracker: &mut StatusTracker, stage: Stage, error: PipelineError) -> StageFailure {
    let status = PipelineStatus::Failed(stage);
    if let Err(e) = tracker.advance(status) {
        warn!(error = %e, "Unexpected failure transition");
    }
    StageFailure { status, error }
}

fn failed(email_id: String, failure: StageFailure) -> RecordOutcome {
    RecordOutcome::Failed {
        email_id,
        status: failure.status,
        error: failure.error.to_string(),
    }
}
