//! Error types for sensorgate-store.

use std::path::PathBuf;

/// Result type for sensorgate-store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sensorgate-store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLite.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Failed to create database directory.
    #[error("Failed to create database directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A stored column could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Invalid timestamp.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for sensorgate_core::Error {
    fn from(err: Error) -> Self {
        sensorgate_core::Error::storage(err)
    }
}
