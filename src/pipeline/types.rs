//! Shared types for the triage pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StateError;
use crate::pipeline::taxonomy::{Department, Intent, Taxonomy};

// ── Email record ────────────────────────────────────────────────────

/// One fetched message, normalized by the mailbox adapter.
///
/// `id` is the mailbox-provided identifier and the idempotency key for
/// the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailRecord {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub sender: String,
    pub subject: String,
    pub body_text: String,
    /// ISO-639-1 code, set once the language detector has run.
    #[serde(default)]
    pub detected_language: Option<String>,
}

impl EmailRecord {
    pub fn new(
        id: impl Into<String>,
        sender: impl Into<String>,
        subject: impl Into<String>,
        body_text: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            received_at,
            sender: sender.into(),
            subject: subject.into(),
            body_text: body_text.into(),
            detected_language: None,
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.detected_language = Some(language.into());
        self
    }
}

// ── Classification ──────────────────────────────────────────────────

/// What the inference collaborator said, kept verbatim for audit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawModelSignal {
    pub intent_label: String,
    /// Model-reported certainty, as returned (not yet normalized).
    #[serde(default)]
    pub certainty: Option<f64>,
    #[serde(default)]
    pub sentiment: Option<String>,
}

/// Result of the intent classifier.
///
/// `department` is derived from `intent` at construction and has no setter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentClassification {
    intent: Intent,
    department: Department,
    raw_model_signal: Option<RawModelSignal>,
    keyword_strength: f64,
    recovered_label: bool,
}

impl IntentClassification {
    pub fn new(
        intent: Intent,
        taxonomy: &Taxonomy,
        raw_model_signal: Option<RawModelSignal>,
        keyword_strength: f64,
    ) -> Self {
        Self {
            intent,
            department: taxonomy.department(intent),
            raw_model_signal,
            keyword_strength: keyword_strength.clamp(0.0, 1.0),
            recovered_label: false,
        }
    }

    /// Mark that the model label was outside the taxonomy and replaced.
    pub fn recovered(mut self) -> Self {
        self.recovered_label = true;
        self
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }

    pub fn department(&self) -> Department {
        self.department
    }

    pub fn raw_model_signal(&self) -> Option<&RawModelSignal> {
        self.raw_model_signal.as_ref()
    }

    pub fn keyword_strength(&self) -> f64 {
        self.keyword_strength
    }

    /// True when the model label was outside the taxonomy.
    pub fn recovered_label(&self) -> bool {
        self.recovered_label
    }
}

// ── Scoring ─────────────────────────────────────────────────────────

/// Tone label derived from the model's sentiment signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Positive,
    #[default]
    Neutral,
    Negative,
    Urgent,
    Opportunity,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
            Self::Urgent => "urgent",
            Self::Opportunity => "opportunity",
        }
    }

    /// Map a free-form sentiment word to a tone. Unknown words are neutral.
    pub fn from_sentiment(sentiment: &str) -> Self {
        match sentiment.trim().to_lowercase().as_str() {
            "positive" | "happy" | "satisfied" | "grateful" => Self::Positive,
            "negative" | "angry" | "frustrated" | "dissatisfied" | "upset" => Self::Negative,
            "urgent" | "critical" | "asap" | "emergency" => Self::Urgent,
            "opportunity" => Self::Opportunity,
            _ => Self::Neutral,
        }
    }
}

impl fmt::Display for Tone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The signals a confidence value was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceSignals {
    /// Model certainty normalized to [0, 1]; `None` when the model gave none.
    pub certainty: Option<f64>,
    pub keyword_strength: f64,
    pub language_agrees: bool,
    /// The conservative floor was used instead of the weighted sum.
    pub floor_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    /// Always within [0.0, 1.0].
    pub confidence: f64,
    pub tone: Tone,
    pub signals: ConfidenceSignals,
}

// ── Drafts ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyVariant {
    Formal,
    Friendly,
}

impl ReplyVariant {
    pub const BOTH: [ReplyVariant; 2] = [ReplyVariant::Formal, ReplyVariant::Friendly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Formal => "formal",
            Self::Friendly => "friendly",
        }
    }
}

/// Formal and friendly reply texts. Empty string means "not produced".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyDraftPair {
    pub formal_text: String,
    pub friendly_text: String,
}

impl ReplyDraftPair {
    pub fn get(&self, variant: ReplyVariant) -> &str {
        match variant {
            ReplyVariant::Formal => &self.formal_text,
            ReplyVariant::Friendly => &self.friendly_text,
        }
    }

    pub fn set(&mut self, variant: ReplyVariant, text: String) {
        match variant {
            ReplyVariant::Formal => self.formal_text = text,
            ReplyVariant::Friendly => self.friendly_text = text,
        }
    }

    /// Variants that are still empty.
    pub fn missing(&self) -> Vec<ReplyVariant> {
        ReplyVariant::BOTH
            .into_iter()
            .filter(|v| self.get(*v).trim().is_empty())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

// ── State machine ───────────────────────────────────────────────────

/// A pipeline stage, named after the state it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    LanguageDetected,
    Classified,
    Scored,
    Drafted,
    Synced,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LanguageDetected => "LANGUAGE_DETECTED",
            Self::Classified => "CLASSIFIED",
            Self::Scored => "SCORED",
            Self::Drafted => "DRAFTED",
            Self::Synced => "SYNCED",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::LanguageDetected => 1,
            Self::Classified => 2,
            Self::Scored => 3,
            Self::Drafted => 4,
            Self::Synced => 5,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one email in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum PipelineStatus {
    Received,
    LanguageDetected,
    Classified,
    Scored,
    Drafted,
    /// Terminal success.
    Synced,
    /// Terminal partial success: record stored with missing drafts.
    DraftFailed,
    /// Terminal failure: the named stage was never reached.
    Failed(Stage),
}

impl PipelineStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Received => 0,
            Self::LanguageDetected => 1,
            Self::Classified => 2,
            Self::Scored => 3,
            Self::Drafted => 4,
            Self::Synced | Self::DraftFailed => 5,
            Self::Failed(stage) => stage.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced | Self::DraftFailed | Self::Failed(_))
    }

    /// Strictly forward transitions only.
    pub fn can_transition_to(&self, target: PipelineStatus) -> bool {
        use PipelineStatus::*;

        if self.is_terminal() {
            return false;
        }
        match target {
            Received => false,
            DraftFailed => matches!(self, Scored),
            Failed(stage) => stage.rank() > self.rank(),
            next => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => f.write_str("RECEIVED"),
            Self::LanguageDetected => f.write_str("LANGUAGE_DETECTED"),
            Self::Classified => f.write_str("CLASSIFIED"),
            Self::Scored => f.write_str("SCORED"),
            Self::Drafted => f.write_str("DRAFTED"),
            Self::Synced => f.write_str("SYNCED"),
            Self::DraftFailed => f.write_str("DRAFT_FAILED"),
            Self::Failed(stage) => write!(f, "FAILED_{}", stage.as_str()),
        }
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stage = |name: &str| match name {
            "LANGUAGE_DETECTED" => Ok(Stage::LanguageDetected),
            "CLASSIFIED" => Ok(Stage::Classified),
            "SCORED" => Ok(Stage::Scored),
            "DRAFTED" => Ok(Stage::Drafted),
            "SYNCED" => Ok(Stage::Synced),
            other => Err(format!("unknown stage '{other}'")),
        };
        match s {
            "RECEIVED" => Ok(Self::Received),
            "DRAFT_FAILED" => Ok(Self::DraftFailed),
            _ => match s.strip_prefix("FAILED_") {
                Some(rest) => stage(rest).map(Self::Failed),
                None => stage(s).map(|st| match st {
                    Stage::LanguageDetected => Self::LanguageDetected,
                    Stage::Classified => Self::Classified,
                    Stage::Scored => Self::Scored,
                    Stage::Drafted => Self::Drafted,
                    Stage::Synced => Self::Synced,
                }),
            },
        }
    }
}

impl From<PipelineStatus> for String {
    fn from(status: PipelineStatus) -> Self {
        status.to_string()
    }
}

impl TryFrom<String> for PipelineStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Tracks one email's progress and rejects backwards moves.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    email_id: String,
    status: PipelineStatus,
    history: Vec<PipelineStatus>,
}

impl StatusTracker {
    pub fn new(email_id: impl Into<String>) -> Self {
        Self {
            email_id: email_id.into(),
            status: PipelineStatus::Received,
            history: vec![PipelineStatus::Received],
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    pub fn history(&self) -> &[PipelineStatus] {
        &self.history
    }

    pub fn advance(&mut self, next: PipelineStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(next) {
            return Err(StateError {
                email_id: self.email_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        tracing::debug!(email_id = %self.email_id, from = %self.status, to = %next, "Stage transition");
        self.status = next;
        self.history.push(next);
        Ok(())
    }
}

// ── Triage record ───────────────────────────────────────────────────

/// The final, immutable artifact for one email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageRecord {
    pub record_id: Uuid,
    pub email_id: String,
    pub sender: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub language: String,
    /// Executive briefing; empty when unavailable or the body was too short.
    #[serde(default)]
    pub summary: String,
    pub classification: IntentClassification,
    pub scoring: ScoringResult,
    pub drafts: ReplyDraftPair,
    /// Intent is in the executive-priority set.
    pub priority: bool,
    pub processed_at: DateTime<Utc>,
    pub pipeline_status: PipelineStatus,
    /// 1 for the first write, incremented by each audited overwrite.
    pub revision: u32,
}

// ── Batch reporting ─────────────────────────────────────────────────

/// Terminal result of one email within a batch.
#[derive(Debug, Clone)]
pub enum RecordOutcome {
    /// Record built and stored (status is `SYNCED` or `DRAFT_FAILED`).
    Stored(Box<TriageRecord>),
    /// A record already existed; nothing was recomputed.
    Duplicate { email_id: String },
    /// Terminal failure, nothing stored.
    Failed {
        email_id: String,
        status: PipelineStatus,
        error: String,
    },
    /// Never started (batch cancelled or aborted first).
    NotAttempted { email_id: String, reason: String },
}

impl RecordOutcome {
    pub fn email_id(&self) -> &str {
        match self {
            Self::Stored(record) => &record.email_id,
            Self::Duplicate { email_id }
            | Self::Failed { email_id, .. }
            | Self::NotAttempted { email_id, .. } => email_id,
        }
    }

    /// Short label for logging and reports.
    pub fn label(&self) -> String {
        match self {
            Self::Stored(record) => record.pipeline_status.to_string(),
            Self::Duplicate { .. } => "DUPLICATE".to_string(),
            Self::Failed { status, .. } => status.to_string(),
            Self::NotAttempted { .. } => "NOT_ATTEMPTED".to_string(),
        }
    }
}

/// Per-record line in a batch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordReport {
    pub email_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&RecordOutcome> for RecordReport {
    fn from(outcome: &RecordOutcome) -> Self {
        let error = match outcome {
            RecordOutcome::Failed { error, .. } => Some(error.clone()),
            RecordOutcome::NotAttempted { reason, .. } => Some(reason.clone()),
            _ => None,
        };
        Self {
            email_id: outcome.email_id().to_string(),
            status: outcome.label(),
            error,
        }
    }
}

/// What a batch run reports back to its trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub since: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched: usize,
    pub synced: usize,
    pub draft_failed: usize,
    pub failed: usize,
    pub duplicates: usize,
    pub not_attempted: usize,
    pub priority: usize,
    pub languages: BTreeSet<String>,
    pub cancelled: bool,
    /// Set when a collaborator-wide outage stopped the batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub records: Vec<RecordReport>,
}

impl BatchSummary {
    pub fn new(since: DateTime<Utc>, started_at: DateTime<Utc>) -> Self {
        Self {
            since,
            started_at,
            finished_at: started_at,
            fetched: 0,
            synced: 0,
            draft_failed: 0,
            failed: 0,
            duplicates: 0,
            not_attempted: 0,
            priority: 0,
            languages: BTreeSet::new(),
            cancelled: false,
            aborted: None,
            records: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: &RecordOutcome) {
        match outcome {
            RecordOutcome::Stored(record) => {
                match record.pipeline_status {
                    PipelineStatus::DraftFailed => self.draft_failed += 1,
                    _ => self.synced += 1,
                }
                if record.priority {
                    self.priority += 1;
                }
                self.languages.insert(record.language.clone());
            }
            RecordOutcome::Duplicate { .. } => self.duplicates += 1,
            RecordOutcome::Failed { .. } => self.failed += 1,
            RecordOutcome::NotAttempted { .. } => self.not_attempted += 1,
        }
        self.records.push(RecordReport::from(outcome));
    }

    /// No failures, no abort.
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.aborted.is_none()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_and_parse_agree() {
        let all = [
            PipelineStatus::Received,
            PipelineStatus::LanguageDetected,
            PipelineStatus::Classified,
            PipelineStatus::Scored,
            PipelineStatus::Drafted,
            PipelineStatus::Synced,
            PipelineStatus::DraftFailed,
            PipelineStatus::Failed(Stage::Classified),
            PipelineStatus::Failed(Stage::Synced),
        ];
        for status in all {
            assert_eq!(status.to_string().parse::<PipelineStatus>().unwrap(), status);
        }
        assert_eq!(
            PipelineStatus::Failed(Stage::Classified).to_string(),
            "FAILED_CLASSIFIED"
        );
    }

    #[test]
    fn forward_chain_is_allowed() {
        let mut tracker = StatusTracker::new("m-1");
        for next in [
            PipelineStatus::LanguageDetected,
            PipelineStatus::Classified,
            PipelineStatus::Scored,
            PipelineStatus::Drafted,
            PipelineStatus::Synced,
        ] {
            tracker.advance(next).unwrap();
        }
        assert!(tracker.status().is_terminal());
        assert_eq!(tracker.history().len(), 6);
    }

    #[test]
    fn stages_cannot_be_skipped_or_repeated() {
        let mut tracker = StatusTracker::new("m-1");
        assert!(tracker.advance(PipelineStatus::Classified).is_err());
        tracker.advance(PipelineStatus::LanguageDetected).unwrap();
        assert!(tracker.advance(PipelineStatus::LanguageDetected).is_err());
        assert!(tracker.advance(PipelineStatus::Received).is_err());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut tracker = StatusTracker::new("m-1");
        tracker.advance(PipelineStatus::LanguageDetected).unwrap();
        tracker
            .advance(PipelineStatus::Failed(Stage::Classified))
            .unwrap();
        assert!(tracker.advance(PipelineStatus::Classified).is_err());
        assert!(tracker.advance(PipelineStatus::Failed(Stage::Synced)).is_err());
    }

    #[test]
    fn draft_failed_only_follows_scored() {
        assert!(PipelineStatus::Scored.can_transition_to(PipelineStatus::DraftFailed));
        assert!(!PipelineStatus::Classified.can_transition_to(PipelineStatus::DraftFailed));
        assert!(!PipelineStatus::Drafted.can_transition_to(PipelineStatus::DraftFailed));
    }

    #[test]
    fn failure_must_name_a_later_stage() {
        assert!(PipelineStatus::Scored.can_transition_to(PipelineStatus::Failed(Stage::Synced)));
        assert!(
            !PipelineStatus::Scored.can_transition_to(PipelineStatus::Failed(Stage::Classified))
        );
    }

    #[test]
    fn status_serializes_as_string() {
        let json = serde_json::to_string(&PipelineStatus::Failed(Stage::Classified)).unwrap();
        assert_eq!(json, "\"FAILED_CLASSIFIED\"");
        let back: PipelineStatus = serde_json::from_str("\"DRAFT_FAILED\"").unwrap();
        assert_eq!(back, PipelineStatus::DraftFailed);
    }

    #[test]
    fn record_without_summary_loads_empty() {
        let record = fixtures::sample_record("m-1");
        let mut json = serde_json::to_value(&record).unwrap();
        json.as_object_mut().unwrap().remove("summary");
        let back: TriageRecord = serde_json::from_value(json).unwrap();
        assert!(back.summary.is_empty());
        assert_eq!(back.email_id, "m-1");
    }

    #[test]
    fn tone_from_sentiment() {
        assert_eq!(Tone::from_sentiment("Positive"), Tone::Positive);
        assert_eq!(Tone::from_sentiment(" urgent "), Tone::Urgent);
        assert_eq!(Tone::from_sentiment("frustrated"), Tone::Negative);
        assert_eq!(Tone::from_sentiment("bewildered"), Tone::Neutral);
    }

    #[test]
    fn draft_pair_reports_missing_variants() {
        let mut pair = ReplyDraftPair::default();
        assert_eq!(pair.missing(), vec![ReplyVariant::Formal, ReplyVariant::Friendly]);
        pair.set(ReplyVariant::Formal, "Dear customer".into());
        assert_eq!(pair.missing(), vec![ReplyVariant::Friendly]);
        pair.set(ReplyVariant::Friendly, "Hi there".into());
        assert!(pair.is_complete());
    }

    #[test]
    fn classification_derives_department() {
        let taxonomy = Taxonomy::standard();
        let c = IntentClassification::new(Intent::Cancellation, &taxonomy, None, 1.4);
        assert_eq!(c.department(), Department::Sales);
        assert_eq!(c.keyword_strength(), 1.0);
    }

    #[test]
    fn summary_counts_outcomes() {
        let now = Utc::now();
        let mut summary = BatchSummary::new(now, now);
        summary.record(&RecordOutcome::Duplicate {
            email_id: "a".into(),
        });
        summary.record(&RecordOutcome::Failed {
            email_id: "b".into(),
            status: PipelineStatus::Failed(Stage::Classified),
            error: "timeout".into(),
        });
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.failed, 1);
        assert!(!summary.is_clean());
        assert_eq!(summary.records[1].status, "FAILED_CLASSIFIED");
        assert_eq!(summary.records[1].error.as_deref(), Some("timeout"));
    }
}
