//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::pipeline::resilience::RetryPolicy;

/// Weights of the confidence formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    /// Confidence used when the model reports no certainty, and the cap
    /// for unclassified intents.
    pub floor: f64,
    /// Weight of the model-reported certainty.
    pub model_weight: f64,
    /// Weight of the local keyword-match strength.
    pub keyword_weight: f64,
    /// Subtracted when the reply language is not the confirmed email language.
    pub language_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            floor: 0.3,
            model_weight: 0.7,
            keyword_weight: 0.3,
            language_penalty: 0.2,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// ISO-639-1 code used when detection is inconclusive.
    pub default_language: String,
    pub scoring: ScoringWeights,
    pub inference_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
    /// Consecutive exhausted calls before a collaborator's circuit opens.
    pub breaker_threshold: u32,
    /// Default lookback window for a batch run.
    pub lookback: Duration,
    /// Emails processed concurrently within a batch.
    pub max_concurrent: usize,
    /// Bodies shorter than this are triaged locally without inference.
    pub min_body_chars: usize,
    /// Bodies are truncated to this many characters before inference.
    pub max_body_chars: usize,
    /// Optional JSON taxonomy table (aliases and department overrides).
    pub taxonomy_path: Option<PathBuf>,
    pub db_path: PathBuf,
    /// Cron expression for scheduled batch runs.
    pub schedule: Option<String>,
    pub http_port: u16,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            scoring: ScoringWeights::default(),
            inference_retry: RetryPolicy::inference(),
            store_retry: RetryPolicy::store(),
            breaker_threshold: 5,
            lookback: Duration::from_secs(7 * 24 * 3600), // 7 days
            max_concurrent: 4,
            min_body_chars: 25,
            max_body_chars: 2500,
            taxonomy_path: None,
            db_path: PathBuf::from("./data/mail-triage.db"),
            schedule: None,
            http_port: 8080,
        }
    }
}

impl TriageConfig {
    /// Load configuration from `TRIAGE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let scoring = ScoringWeights {
            floor: env_or("TRIAGE_CONFIDENCE_FLOOR", defaults.scoring.floor),
            model_weight: env_or("TRIAGE_MODEL_WEIGHT", defaults.scoring.model_weight),
            keyword_weight: env_or("TRIAGE_KEYWORD_WEIGHT", defaults.scoring.keyword_weight),
            language_penalty: env_or("TRIAGE_LANGUAGE_PENALTY", defaults.scoring.language_penalty),
        };

        let inference_retry = RetryPolicy {
            max_attempts: env_or(
                "TRIAGE_INFERENCE_MAX_ATTEMPTS",
                defaults.inference_retry.max_attempts,
            ),
            base_backoff: Duration::from_millis(env_or(
                "TRIAGE_INFERENCE_BACKOFF_MS",
                defaults.inference_retry.base_backoff.as_millis() as u64,
            )),
            timeout: Duration::from_secs(env_or(
                "TRIAGE_INFERENCE_TIMEOUT_SECS",
                defaults.inference_retry.timeout.as_secs(),
            )),
        };

        let store_retry = RetryPolicy {
            max_attempts: env_or("TRIAGE_STORE_MAX_ATTEMPTS", defaults.store_retry.max_attempts),
            base_backoff: Duration::from_millis(env_or(
                "TRIAGE_STORE_BACKOFF_MS",
                defaults.store_retry.base_backoff.as_millis() as u64,
            )),
            timeout: Duration::from_secs(env_or(
                "TRIAGE_STORE_TIMEOUT_SECS",
                defaults.store_retry.timeout.as_secs(),
            )),
        };

        let config = Self {
            default_language: std::env::var("TRIAGE_DEFAULT_LANGUAGE")
                .ok()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.default_language),
            scoring,
            inference_retry,
            store_retry,
            breaker_threshold: env_or("TRIAGE_BREAKER_THRESHOLD", defaults.breaker_threshold),
            lookback: lookback_from_env("TRIAGE_LOOKBACK_DAYS", defaults.lookback),
            max_concurrent: env_or("TRIAGE_MAX_CONCURRENT", defaults.max_concurrent),
            min_body_chars: env_or("TRIAGE_MIN_BODY_CHARS", defaults.min_body_chars),
            max_body_chars: env_or("TRIAGE_MAX_BODY_CHARS", defaults.max_body_chars),
            taxonomy_path: std::env::var("TRIAGE_TAXONOMY_PATH").ok().map(PathBuf::from),
            db_path: std::env::var("TRIAGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            schedule: std::env::var("TRIAGE_SCHEDULE")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            http_port: env_or("TRIAGE_HTTP_PORT", defaults.http_port),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("TRIAGE_CONFIDENCE_FLOOR", self.scoring.floor),
            ("TRIAGE_MODEL_WEIGHT", self.scoring.model_weight),
            ("TRIAGE_KEYWORD_WEIGHT", self.scoring.keyword_weight),
            ("TRIAGE_LANGUAGE_PENALTY", self.scoring.language_penalty),
        ];
        for (key, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, format!("{value} is outside [0, 1]")));
            }
        }
        if self.inference_retry.max_attempts == 0 {
            return Err(invalid("TRIAGE_INFERENCE_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(invalid("TRIAGE_STORE_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("TRIAGE_MAX_CONCURRENT", "must be at least 1"));
        }
        if self.default_language.len() != 2 || !self.default_language.is_ascii() {
            return Err(invalid(
                "TRIAGE_DEFAULT_LANGUAGE",
                format!("'{}' is not an ISO-639-1 code", self.default_language),
            ));
        }
        if let Some(schedule) = &self.schedule {
            cron::Schedule::from_str(schedule)
                .map_err(|e| invalid("TRIAGE_SCHEDULE", e.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

/// Parse an env var, falling back to `default` when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "Unparsable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

const SECS_PER_DAY: u64 = 24 * 3600;

/// A window of `days` days, or `None` if it does not fit in a `Duration`.
pub fn days(days: u64) -> Option<Duration> {
    days.checked_mul(SECS_PER_DAY).map(Duration::from_secs)
}

fn lookback_from_env(key: &str, default: Duration) -> Duration {
    let Ok(raw) = std::env::var(key) else {
        return default;
    };
    match raw.trim().parse::<u64>().ok().and_then(days) {
        Some(window) => window,
        None => {
            tracing::warn!(key, value = %raw, "Unusable lookback, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TriageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scoring.floor, 0.3);
        assert_eq!(config.inference_retry.max_attempts, 3);
        assert_eq!(config.lookback, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn floor_outside_unit_interval_is_rejected() {
        let mut config = TriageConfig::default();
        config.scoring.floor = 1.5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("TRIAGE_CONFIDENCE_FLOOR"));
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = TriageConfig::default();
        config.store_retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_schedule_rejected() {
        let mut config = TriageConfig::default();
        config.schedule = Some("every tuesday".into());
        assert!(config.validate().is_err());

        config.schedule = Some("0 0 7 * * *".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        // Unique key so parallel tests do not interfere.
        let key = "TRIAGE_TEST_ENV_OR_GARBAGE";
        unsafe { std::env::set_var(key, "not-a-number") };
        assert_eq!(env_or::<u32>(key, 7), 7);
        unsafe { std::env::set_var(key, " 12 ") };
        assert_eq!(env_or::<u32>(key, 7), 12);
        unsafe { std::env::remove_var(key) };
    }

    #[test]
    fn oversized_lookback_falls_back_to_default() {
        let key = "TRIAGE_TEST_LOOKBACK_DAYS";
        let default = Duration::from_secs(7 * SECS_PER_DAY);
        unsafe { std::env::set_var(key, u64::MAX.to_string()) };
        assert_eq!(lookback_from_env(key, default), default);
        unsafe { std::env::set_var(key, "3") };
        assert_eq!(lookback_from_env(key, default), Duration::from_secs(3 * SECS_PER_DAY));
        unsafe { std::env::set_var(key, "soon") };
        assert_eq!(lookback_from_env(key, default), default);
        unsafe { std::env::remove_var(key) };
        assert_eq!(lookback_from_env(key, default), default);
        assert!(days(u64::MAX / 2).is_none());
    }
}
