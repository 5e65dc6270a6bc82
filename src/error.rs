//! Error types for mail-triage.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audit-store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A triage record for this email id is already stored.
    #[error("Triage record already exists for email {0}")]
    Duplicate(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

impl DatabaseError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Query(_) | Self::Timeout(_))
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mailbox collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox connection failed: {0}")]
    Connection(String),

    #[error("Mailbox authentication failed for {0}")]
    AuthFailed(String),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the inference collaborator.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Timeouts, rate limits, dropped connections: worth retrying.
    #[error("Transient inference failure: {0}")]
    Transient(String),

    #[error("Inference call timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator answered, but not with anything usable.
    #[error("Malformed inference response: {0}")]
    Malformed(String),

    #[error("Inference rejected: {0}")]
    Rejected(String),
}

impl InferenceError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<LlmError> for InferenceError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::RequestFailed { .. } | LlmError::RateLimited { .. } => {
                Self::Transient(e.to_string())
            }
            LlmError::InvalidResponse { .. } | LlmError::Json(_) => Self::Malformed(e.to_string()),
            LlmError::AuthFailed { .. } => Self::Rejected(e.to_string()),
        }
    }
}

/// Invalid state-machine transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Email {email_id} is {from}, cannot transition to {to}")]
pub struct StateError {
    pub email_id: String,
    pub from: String,
    pub to: String,
}

/// Pipeline-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A collaborator kept failing after every retry.
    #[error("{collaborator} failed after {attempts} attempt(s): {reason}")]
    TransientCollaborator {
        collaborator: String,
        attempts: u32,
        reason: String,
    },

    /// A collaborator returned an error that retrying cannot fix.
    #[error("{collaborator} failed: {reason}")]
    Collaborator { collaborator: String, reason: String },

    #[error("Circuit open for {0}: collaborator unavailable")]
    CircuitOpen(String),

    #[error("Mailbox fetch failed: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("A batch is already running")]
    BatchInProgress,

    #[error("No triage record for email {0}")]
    RecordNotFound(String),

    /// The mailbox no longer holds the message behind a stored record.
    #[error("Email {0} is no longer in the mailbox")]
    EmailUnavailable(String),

    #[error(transparent)]
    State(#[from] StateError),
}
