//! Durable state: a single-file embedded database shared by the manager
//! process, detached runners, and the API layer.

mod agent_store;
mod context_store;
mod database;

pub use agent_store::{AgentFilter, AgentStore};
pub use context_store::ContextStore;
pub use database::{Database, SCHEMA_VERSION};

use std::path::PathBuf;

use crate::models::ModelError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("'{0}' not found")]
    NotFound(String),
    #[error("'{0}' already exists")]
    AlreadyExists(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Invalid model: {0}")]
    Model(#[from] ModelError),
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
