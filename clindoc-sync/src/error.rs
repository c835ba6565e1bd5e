//! Error types for the sync engine

use thiserror::Error;

use crate::ids::{EntityKind, RecordId};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: RecordId },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Local cache error: {0}")]
    Cache(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    pub fn not_found(kind: EntityKind, id: &RecordId) -> Self {
        SyncError::NotFound {
            kind,
            id: id.clone(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Cache(err.to_string())
    }
}

impl From<figment::Error> for SyncError {
    fn from(err: figment::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
