//! Persistence layer: the audit store for triage records.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlAuditStore;
pub use memory::MemoryAuditStore;
pub use traits::{AuditStore, OverwriteEntry};
