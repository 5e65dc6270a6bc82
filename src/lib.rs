//! Mail Triage: email triage orchestration core.

pub mod config;
pub mod error;
pub mod llm;
pub mod mailbox;
pub mod pipeline;
pub mod server;
pub mod store;
