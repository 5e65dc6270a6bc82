//! Email triage pipeline.
//!
//! Each fetched email flows through:
//! 1. `AuditStore::exists()`: idempotency check, duplicates stop here
//! 2. `LanguageDetector::detect()`: local, no inference
//! 3. `Summarizer::summarize()`: executive briefing, empty when unavailable
//! 4. `IntentClassifier::classify()`: inference label resolved against the taxonomy
//! 5. `Scorer::score()`: confidence and tone
//! 6. `ReplyDrafter::draft()`: formal and friendly replies
//! 7. `AuditStore::write()`: one immutable triage record per email

pub mod classifier;
pub mod drafter;
pub mod language;
pub mod orchestrator;
pub mod resilience;
pub mod scheduler;
pub mod scorer;
pub mod summarizer;
pub mod taxonomy;
pub mod types;

pub use orchestrator::TriageOrchestrator;
