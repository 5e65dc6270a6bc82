//! Confidence and tone scoring.
//!
//! Confidence is a weighted sum of named signals so every value can be
//! explained from the `ConfidenceSignals` stored next to it:
//!
//! ```text
//! no certainty            -> floor
//! otherwise               base = model_weight * certainty + keyword_weight * keyword_strength
//! language not confirmed  base -= language_penalty
//! unclassified intent     base = min(base, floor)
//! confidence              clamp(base, 0, 1)
//! ```

use crate::config::ScoringWeights;
use crate::pipeline::taxonomy::Intent;
use crate::pipeline::types::{ConfidenceSignals, IntentClassification, ScoringResult, Tone};

#[derive(Debug, Clone)]
pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Score a classification. `language_agrees` is false when the reply
    /// language could not be confirmed against the email's language.
    pub fn score(&self, classification: &IntentClassification, language_agrees: bool) -> ScoringResult {
        let raw = classification.raw_model_signal();
        let certainty = raw.and_then(|r| r.certainty).and_then(normalize_certainty);
        let keyword_strength = classification.keyword_strength();
        let w = &self.weights;

        let (confidence, floor_applied) = match certainty {
            None => (w.floor, true),
            Some(certainty) => {
                let mut base = w.model_weight * certainty + w.keyword_weight * keyword_strength;
                if !language_agrees {
                    base -= w.language_penalty;
                }
                let capped = classification.intent() == Intent::Unclassified && base > w.floor;
                if capped {
                    base = w.floor;
                }
                (base, capped)
            }
        };

        let tone = raw
            .and_then(|r| r.sentiment.as_deref())
            .map(Tone::from_sentiment)
            .unwrap_or_default();

        ScoringResult {
            confidence: confidence.clamp(0.0, 1.0),
            tone,
            signals: ConfidenceSignals {
                certainty,
                keyword_strength,
                language_agrees,
                floor_applied,
            },
        }
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringWeights::default())
    }
}

/// Map a model certainty onto [0, 1].
///
/// Values in (1, 100] are percentages. Negative, NaN and infinite values,
/// and anything above 100, carry no usable signal.
pub fn normalize_certainty(value: f64) -> Option<f64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    if value <= 1.0 {
        Some(value)
    } else if value <= 100.0 {
        Some(value / 100.0)
    } else {
        None
    }
}
