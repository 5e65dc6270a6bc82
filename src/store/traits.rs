//! The audit-store boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::TriageRecord;

/// One audited replacement of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverwriteEntry {
    pub email_id: String,
    pub previous_record_id: String,
    pub previous_status: String,
    pub new_status: String,
    pub reason: String,
    pub overwritten_at: DateTime<Utc>,
}

/// Exactly-once persistence of triage records.
///
/// `write` is write-once per `email_id`: a second write for the same id
/// fails with [`DatabaseError::Duplicate`] and leaves the stored row alone.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn exists(&self, email_id: &str) -> Result<bool, DatabaseError>;

    async fn write(&self, record: &TriageRecord) -> Result<(), DatabaseError>;

    async fn get(&self, email_id: &str) -> Result<Option<TriageRecord>, DatabaseError>;

    /// Replace an existing record and append an audit entry.
    ///
    /// Fails with [`DatabaseError::NotFound`] when nothing is stored yet.
    async fn overwrite(
        &self,
        record: &TriageRecord,
        reason: &str,
    ) -> Result<OverwriteEntry, DatabaseError>;

    /// Most recently processed records first.
    async fn list_recent(&self, limit: usize) -> Result<Vec<TriageRecord>, DatabaseError>;

    async fn overwrite_history(&self, email_id: &str)
    -> Result<Vec<OverwriteEntry>, DatabaseError>;

    /// Cheap reachability check for health endpoints.
    async fn ping(&self) -> Result<(), DatabaseError>;
}
