//! libSQL backend for the audit store.
//!
//! Supports local file and in-memory databases. `email_id` is the primary
//! key of `triage_records`, so the store itself enforces write-once.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::pipeline::types::TriageRecord;
use crate::store::migrations;
use crate::store::traits::{AuditStore, OverwriteEntry};

/// libSQL audit store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use,
/// but a transaction opened on it covers every statement issued on it, so
/// mutations take `write_lock` for their whole duration.
pub struct LibSqlAuditStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlAuditStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Audit store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn query_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

fn is_unique_violation(e: &libsql::Error) -> bool {
    let msg = e.to_string();
    msg.contains("UNIQUE constraint failed") || msg.contains("PRIMARY KEY")
}

fn to_json(record: &TriageRecord) -> Result<String, DatabaseError> {
    serde_json::to_string(record).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json(json: &str) -> Result<TriageRecord, DatabaseError> {
    serde_json::from_str(json).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn row_to_overwrite(row: &libsql::Row) -> Result<OverwriteEntry, libsql::Error> {
    let overwritten_at: String = row.get(5)?;
    Ok(OverwriteEntry {
        email_id: row.get(0)?,
        previous_record_id: row.get(1)?,
        previous_status: row.get(2)?,
        new_status: row.get(3)?,
        reason: row.get(4)?,
        overwritten_at: parse_datetime(&overwritten_at),
    })
}

#[async_trait]
impl AuditStore for LibSqlAuditStore {
    async fn exists(&self, email_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM triage_records WHERE email_id = ?1 LIMIT 1",
                params![email_id],
            )
            .await
            .map_err(query_err("exists"))?;
        let row = rows.next().await.map_err(query_err("exists"))?;
        Ok(row.is_some())
    }

    async fn write(&self, record: &TriageRecord) -> Result<(), DatabaseError> {
        let json = to_json(record)?;
        let _write = self.write_lock.lock().await;
        let result = self
            .conn
            .execute(
                "INSERT INTO triage_records (email_id, record_id, sender, subject, received_at,
                    language, intent, department, confidence, tone, priority, pipeline_status,
                    processed_at, revision, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    record.email_id.as_str(),
                    record.record_id.to_string(),
                    record.sender.as_str(),
                    record.subject.as_str(),
                    timestamp(&record.received_at),
                    record.language.as_str(),
                    record.classification.intent().label(),
                    record.classification.department().as_str(),
                    record.scoring.confidence,
                    record.scoring.tone.as_str(),
                    record.priority as i64,
                    record.pipeline_status.to_string(),
                    timestamp(&record.processed_at),
                    record.revision as i64,
                    json,
                ],
            )
            .await;

        match result {
            Ok(_) => {
                debug!(email_id = %record.email_id, status = %record.pipeline_status, "Triage record written");
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(DatabaseError::Duplicate(record.email_id.clone())),
            Err(e) => Err(DatabaseError::Query(format!("write: {e}"))),
        }
    }

    async fn get(&self, email_id: &str) -> Result<Option<TriageRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM triage_records WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(query_err("get"))?;
        match rows.next().await.map_err(query_err("get"))? {
            Some(row) => {
                let json: String = row.get(0).map_err(query_err("get"))?;
                Ok(Some(from_json(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn overwrite(
        &self,
        record: &TriageRecord,
        reason: &str,
    ) -> Result<OverwriteEntry, DatabaseError> {
        let json = to_json(record)?;
        let _write = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(query_err("overwrite: begin"))?;

        let mut rows = tx
            .query(
                "SELECT record_id, pipeline_status, record_json FROM triage_records
                 WHERE email_id = ?1",
                params![record.email_id.as_str()],
            )
            .await
            .map_err(query_err("overwrite: read"))?;
        let row = rows
            .next()
            .await
            .map_err(query_err("overwrite: read"))?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "triage_record".to_string(),
                id: record.email_id.clone(),
            })?;
        let previous_record_id: String = row.get(0).map_err(query_err("overwrite: read"))?;
        let previous_status: String = row.get(1).map_err(query_err("overwrite: read"))?;
        let previous_json: String = row.get(2).map_err(query_err("overwrite: read"))?;
        drop(rows);

        tx.execute(
            "UPDATE triage_records SET record_id = ?2, sender = ?3, subject = ?4,
                received_at = ?5, language = ?6, intent = ?7, department = ?8,
                confidence = ?9, tone = ?10, priority = ?11, pipeline_status = ?12,
                processed_at = ?13, revision = ?14, record_json = ?15
             WHERE email_id = ?1",
            params![
                record.email_id.as_str(),
                record.record_id.to_string(),
                record.sender.as_str(),
                record.subject.as_str(),
                timestamp(&record.received_at),
                record.language.as_str(),
                record.classification.intent().label(),
                record.classification.department().as_str(),
                record.scoring.confidence,
                record.scoring.tone.as_str(),
                record.priority as i64,
                record.pipeline_status.to_string(),
                timestamp(&record.processed_at),
                record.revision as i64,
                json,
            ],
        )
        .await
        .map_err(query_err("overwrite: update"))?;

        let entry = OverwriteEntry {
            email_id: record.email_id.clone(),
            previous_record_id,
            previous_status,
            new_status: record.pipeline_status.to_string(),
            reason: reason.to_string(),
            overwritten_at: Utc::now(),
        };

        tx.execute(
            "INSERT INTO overwrite_audit (email_id, previous_record_id, previous_status,
                new_status, reason, previous_json, overwritten_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.email_id.as_str(),
                entry.previous_record_id.as_str(),
                entry.previous_status.as_str(),
                entry.new_status.as_str(),
                entry.reason.as_str(),
                previous_json,
                timestamp(&entry.overwritten_at),
            ],
        )
        .await
        .map_err(query_err("overwrite: audit"))?;

        tx.commit().await.map_err(query_err("overwrite: commit"))?;
        info!(email_id = %entry.email_id, reason, "Triage record overwritten");
        Ok(entry)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<TriageRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT record_json FROM triage_records ORDER BY processed_at DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(query_err("list_recent"))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_recent"))? {
            let json: String = row.get(0).map_err(query_err("list_recent"))?;
            records.push(from_json(&json)?);
        }
        Ok(records)
    }

    async fn overwrite_history(
        &self,
        email_id: &str,
    ) -> Result<Vec<OverwriteEntry>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT email_id, previous_record_id, previous_status, new_status, reason,
                    overwritten_at
                 FROM overwrite_audit WHERE email_id = ?1 ORDER BY id",
                params![email_id],
            )
            .await
            .map_err(query_err("overwrite_history"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("overwrite_history"))? {
            entries.push(row_to_overwrite(&row).map_err(query_err("overwrite_history"))?);
        }
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn
            .query("SELECT 1", ())
            .await
            .map_err(query_err("ping"))?;
        rows.next().await.map_err(query_err("ping"))?;
        Ok(())
    }
}
