//! Timeouts, bounded retries and circuit breaking for collaborator calls.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::error::{DatabaseError, InferenceError, PipelineError};

/// Errors that know whether another attempt could help.
pub trait Retryable: fmt::Display {
    fn is_transient(&self) -> bool;

    /// The error to record when an attempt ran past its timeout.
    fn timed_out(after: Duration) -> Self;
}

impl Retryable for InferenceError {
    fn is_transient(&self) -> bool {
        InferenceError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        InferenceError::Timeout(after)
    }
}

impl Retryable for DatabaseError {
    fn is_transient(&self) -> bool {
        DatabaseError::is_transient(self)
    }

    fn timed_out(after: Duration) -> Self {
        DatabaseError::Timeout(after)
    }
}

/// Retry policy for one collaborator type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles after each retry.
    pub base_backoff: Duration,
    /// Per-attempt timeout.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn inference() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn store() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
        }
    }

    /// Backoff before attempt `attempt + 1`, with up to 50% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let max_jitter = (exp.as_millis() / 2) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        exp + Duration::from_millis(jitter)
    }
}

/// Counts consecutive exhausted calls for one collaborator.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    /// 0 disables the breaker.
    threshold: u32,
    consecutive_failures: AtomicU32,
    open: AtomicBool,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, threshold: u32) -> Self {
        Self {
            name,
            threshold,
            consecutive_failures: AtomicU32::new(0),
            open: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The collaborator answered, so it is not down.
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn record_exhausted(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if self.threshold > 0 && failures >= self.threshold && !self.open.swap(true, Ordering::SeqCst)
        {
            tracing::error!(
                collaborator = self.name,
                failures,
                "Circuit opened after consecutive exhausted calls"
            );
        }
    }

    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }
}

/// Why a guarded call gave up.
#[derive(Debug)]
pub enum CallError<E> {
    /// Every attempt failed transiently.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error; not retried.
    Rejected(E),
    /// The breaker was already open; no attempt was made.
    CircuitOpen,
}

impl<E: fmt::Display> CallError<E> {
    pub fn into_pipeline_error(self, collaborator: &str) -> PipelineError {
        match self {
            Self::Exhausted { attempts, last } => PipelineError::TransientCollaborator {
                collaborator: collaborator.to_string(),
                attempts,
                reason: last.to_string(),
            },
            Self::Rejected(e) => PipelineError::Collaborator {
                collaborator: collaborator.to_string(),
                reason: e.to_string(),
            },
            Self::CircuitOpen => PipelineError::CircuitOpen(collaborator.to_string()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "failed after {attempts} attempt(s): {last}")
            }
            Self::Rejected(e) => write!(f, "{e}"),
            Self::CircuitOpen => f.write_str("circuit open"),
        }
    }
}

/// A retry policy paired with the breaker of the collaborator it guards.
#[derive(Debug, Clone)]
pub struct Guard {
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Guard {
    pub fn new(policy: RetryPolicy, breaker: Arc<CircuitBreaker>) -> Self {
        Self { policy, breaker }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Run `op` under the timeout, retrying transient failures with
    /// exponential backoff until the attempt budget is spent.
    pub async fn call<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, CallError<E>>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.breaker.is_open() {
            return Err(CallError::CircuitOpen);
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.policy.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(E::timed_out(self.policy.timeout)),
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    self.breaker.record_success();
                    return Err(CallError::Rejected(e));
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        collaborator = self.breaker.name(),
                        call = label,
                        attempts = attempt,
                        error = %e,
                        "Retries exhausted"
                    );
                    self.breaker.record_exhausted();
                    return Err(CallError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt);
                    tracing::warn!(
                        collaborator = self.breaker.name(),
                        call = label,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    if self.breaker.is_open() {
                        return Err(CallError::CircuitOpen);
                    }
                }
            }
        }
    }
}
