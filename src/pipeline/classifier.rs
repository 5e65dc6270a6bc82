//! Intent classification.
//!
//! The inference collaborator suggests a label; the taxonomy decides what it
//! means. A label outside the taxonomy becomes `General.Unclassified` here
//! and never travels further. Local keyword rules contribute an independent
//! keyword-strength signal for the scorer.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::InferenceError;
use crate::llm::inference::InferenceClient;
use crate::mailbox::parse::truncate_chars;
use crate::pipeline::resilience::{CallError, Guard};
use crate::pipeline::taxonomy::{Intent, Taxonomy};
use crate::pipeline::types::{EmailRecord, IntentClassification};

/// Weight of a subject match in the keyword strength; a body match adds the rest.
const SUBJECT_WEIGHT: f64 = 0.6;
const BODY_WEIGHT: f64 = 0.4;

const KEYWORD_PATTERNS: &[(Intent, &str)] = &[
    (
        Intent::Cancellation,
        r"(?i)\b(cancel(l?ation|l?ing|led|s)?|terminate|close (my|our) account|end (my|our) subscription)\b",
    ),
    (Intent::RefundRequest, r"(?i)\b(refund(s|ed)?|money back|chargeback)\b"),
    (
        Intent::PricingRequest,
        r"(?i)\b(pricing|price list|how much (does|do|is)|cost of)\b",
    ),
    (Intent::QuoteRequest, r"(?i)\b(quote|quotation|estimate for)\b"),
    (Intent::PurchaseOrder, r"(?i)\b(purchase order|p\.?o\.? number|place an order)\b"),
    (Intent::Renewal, r"(?i)\b(renew(al|ing)?|extend (my|our) (contract|license))\b"),
    (Intent::Upgrade, r"(?i)\b(upgrade|higher tier|premium plan)\b"),
    (Intent::EnterpriseDemo, r"(?i)\b(demo|demonstration|walkthrough)\b"),
    (
        Intent::StrategicPartnership,
        r"(?i)\b(strategic (partnership|alliance)|joint venture)\b",
    ),
    (Intent::PartnershipRequest, r"(?i)\b(partner(ship)?|collaborat(e|ion))\b"),
    (Intent::InvestmentInquiry, r"(?i)\b(invest(ment|or|ing)?|funding round|term sheet)\b"),
    (
        Intent::TechnicalIssue,
        r"(?i)\b(not working|error|outage|down|crash(es|ed|ing)?|broken)\b",
    ),
    (Intent::BugReport, r"(?i)\b(bug|defect|regression|stack ?trace)\b"),
    (Intent::FeatureRequest, r"(?i)\b(feature request|would be (great|nice) if|please add)\b"),
    (Intent::BillingQuestion, r"(?i)\b(billing|charged|payment|overcharg(e|ed))\b"),
    (Intent::InvoiceRequest, r"(?i)\b(invoice|receipt)\b"),
    (Intent::PasswordReset, r"(?i)\b(password|reset (my )?login|locked out)\b"),
    (Intent::AccessRequest, r"(?i)\b(access to|permission(s)?|grant access)\b"),
    (Intent::JobApplication, r"(?i)\b(job application|apply(ing)? for|resume|cv|cover letter)\b"),
    (Intent::InterviewScheduling, r"(?i)\b(interview)\b"),
    (Intent::LeaveRequest, r"(?i)\b(leave request|vacation|time off|pto)\b"),
    (Intent::ContractRequest, r"(?i)\b(contract|msa|nda|agreement)\b"),
    (Intent::ComplianceQuestion, r"(?i)\b(compliance|gdpr|hipaa|soc ?2|audit)\b"),
    (Intent::PrivacyRequest, r"(?i)\b(personal data|data deletion|privacy|right to be forgotten)\b"),
    (Intent::LegalInquiry, r"(?i)\b(legal|lawsuit|attorney|lawyer)\b"),
    (Intent::ExecutiveMeeting, r"(?i)\b(meeting with (your )?(ceo|cto|cfo|executive)|board meeting)\b"),
    (Intent::SecurityAlert, r"(?i)\b(security (alert|incident)|breach|phishing|vulnerability)\b"),
    (Intent::DeliveryStatus, r"(?i)\b(delivery|shipment|tracking number|shipped)\b"),
    (Intent::MediaInquiry, r"(?i)\b(press|journalist|media inquiry|interview request)\b"),
    (Intent::SpeakingEngagement, r"(?i)\b(keynote|speak(er|ing) (slot|engagement)|panel)\b"),
    (Intent::Feedback, r"(?i)\b(feedback|suggestion|review)\b"),
    (Intent::FollowUp, r"(?i)\b(follow(ing)?[- ]up|checking in|any update)\b"),
];

/// Compiled keyword rules, keyed by intent.
pub struct KeywordRules {
    rules: Vec<(Intent, Regex)>,
}

impl KeywordRules {
    pub fn standard() -> Self {
        let rules = KEYWORD_PATTERNS
            .iter()
            .filter_map(|(intent, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*intent, re)),
                Err(e) => {
                    warn!(intent = %intent, error = %e, "Invalid keyword pattern skipped");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// How strongly subject and body support `intent`, in [0, 1].
    pub fn strength(&self, intent: Intent, subject: &str, body: &str) -> f64 {
        let mut subject_hit = false;
        let mut body_hit = false;
        for (_, re) in self.rules.iter().filter(|(i, _)| *i == intent) {
            subject_hit |= re.is_match(subject);
            body_hit |= re.is_match(body);
        }
        let mut strength = 0.0;
        if subject_hit {
            strength += SUBJECT_WEIGHT;
        }
        if body_hit {
            strength += BODY_WEIGHT;
        }
        strength
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self::standard()
    }
}

pub struct IntentClassifier {
    inference: Arc<dyn InferenceClient>,
    taxonomy: Arc<Taxonomy>,
    keywords: KeywordRules,
    guard: Guard,
    max_body_chars: usize,
}

impl IntentClassifier {
    pub fn new(
        inference: Arc<dyn InferenceClient>,
        taxonomy: Arc<Taxonomy>,
        guard: Guard,
        max_body_chars: usize,
    ) -> Self {
        Self {
            inference,
            taxonomy,
            keywords: KeywordRules::standard(),
            guard,
            max_body_chars,
        }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Classify through the inference collaborator, with retries.
    ///
    /// A non-empty `summary` is sent as a briefing ahead of the body.
    pub async fn classify(
        &self,
        email: &EmailRecord,
        summary: &str,
        language: &str,
    ) -> Result<IntentClassification, CallError<InferenceError>> {
        let body = truncate_chars(&email.body_text, self.max_body_chars);
        let text = if summary.is_empty() {
            format!("Subject: {}\n\n{}", email.subject, body)
        } else {
            format!("Subject: {}\nBriefing: {}\n\n{}", email.subject, summary, body)
        };

        let signal = self
            .guard
            .call("classify_and_score", || {
                self.inference.classify_and_score(&text, language)
            })
            .await?;

        let (intent, recovered) = self.taxonomy.resolve_or_unclassified(&signal.intent_label);
        let strength = self
            .keywords
            .strength(intent, &email.subject, &email.body_text);
        let classification = IntentClassification::new(intent, &self.taxonomy, Some(signal), strength);

        debug!(
            email_id = %email.id,
            intent = %intent,
            department = %classification.department(),
            keyword_strength = strength,
            recovered,
            "Email classified"
        );
        Ok(if recovered {
            classification.recovered()
        } else {
            classification
        })
    }

    /// Classify without inference (used for trivially short bodies).
    pub fn classify_locally(&self, email: &EmailRecord, intent: Intent) -> IntentClassification {
        let strength = self
            .keywords
            .strength(intent, &email.subject, &email.body_text);
        IntentClassification::new(intent, &self.taxonomy, None, strength)
    }
}
