//! Error types for the journal crate

use orchestrator::StoreError;
use thiserror::Error;

/// Errors that can occur in the SQLite store
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<Error> for StoreError {
    fn from(err: Error) -> Self {
        match err {
            Error::Serialization(e) => StoreError::Serialization(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Result type for journal operations
pub type Result<T> = std::result::Result<T, Error>;
