//! In-memory audit store, for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::DatabaseError;
use crate::pipeline::types::TriageRecord;
use crate::store::traits::{AuditStore, OverwriteEntry};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, TriageRecord>,
    audit: Vec<OverwriteEntry>,
}

/// Same write-once semantics as the libSQL store, kept in a `HashMap`.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    inner: Mutex<Inner>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, DatabaseError> {
        self.inner
            .lock()
            .map_err(|_| DatabaseError::Pool("memory store lock poisoned".into()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|g| g.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn exists(&self, email_id: &str) -> Result<bool, DatabaseError> {
        Ok(self.lock()?.records.contains_key(email_id))
    }

    async fn write(&self, record: &TriageRecord) -> Result<(), DatabaseError> {
        let mut inner = self.lock()?;
        if inner.records.contains_key(&record.email_id) {
            return Err(DatabaseError::Duplicate(record.email_id.clone()));
        }
        inner
            .records
            .insert(record.email_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, email_id: &str) -> Result<Option<TriageRecord>, DatabaseError> {
        Ok(self.lock()?.records.get(email_id).cloned())
    }

    async fn overwrite(
        &self,
        record: &TriageRecord,
        reason: &str,
    ) -> Result<OverwriteEntry, DatabaseError> {
        let mut inner = self.lock()?;
        let previous = inner
            .records
            .get(&record.email_id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "triage_record".to_string(),
                id: record.email_id.clone(),
            })?;

        let entry = OverwriteEntry {
            email_id: record.email_id.clone(),
            previous_record_id: previous.record_id.to_string(),
            previous_status: previous.pipeline_status.to_string(),
            new_status: record.pipeline_status.to_string(),
            reason: reason.to_string(),
            overwritten_at: Utc::now(),
        };
        inner
            .records
            .insert(record.email_id.clone(), record.clone());
        inner.audit.push(entry.clone());
        Ok(entry)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TriageRecord>, DatabaseError> {
        let mut records: Vec<TriageRecord> = self.lock()?.records.values().cloned().collect();
        records.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        records.truncate(limit);
        Ok(records)
    }

    async fn overwrite_history(
        &self,
        email_id: &str,
    ) -> Result<Vec<OverwriteEntry>, DatabaseError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|e| e.email_id == email_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.lock().map(|_| ())
    }
}
