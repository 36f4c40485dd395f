//! Error types for notecore.
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for notecore operations
pub type NoteResult<T> = Result<T, NoteError>;

/// Main error type for notecore operations
#[derive(Error, Debug)]
pub enum NoteError {
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// The on-device store ran out of space. The write was rolled back.
    #[error("Storage full: {0}")]
    StorageFull(String),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Database operation failed: {0}")]
    DatabaseOperation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Worker registration failed: {0}")]
    Registration(String),

    #[error("Invalid lifecycle transition: {0}")]
    InvalidTransition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UUID error: {0}")]
    Uuid(#[from] uuid::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl NoteError {
    /// Create a new validation error
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        NoteError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network(message: impl Into<String>) -> Self {
        NoteError::Network(message.into())
    }

    /// Create a new database operation error
    pub fn database_op(message: impl Into<String>) -> Self {
        NoteError::DatabaseOperation(message.into())
    }

    /// Create a new not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        NoteError::NotFound(what.into())
    }

    /// Errors the sync queue retries with backoff instead of surfacing at once.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NoteError::Network(_) | NoteError::Timeout(_) | NoteError::Conflict(_)
        )
    }
}

impl From<rusqlite::Error> for NoteError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => NoteError::StorageFull(err.to_string()),
            Some(rusqlite::ErrorCode::SystemIoFailure) => NoteError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            )),
            _ => NoteError::Database(err),
        }
    }
}

impl From<reqwest::Error> for NoteError {
    fn from(err: reqwest::Error) -> Self {
        NoteError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = NoteError::validation("title", "too long");
        assert_eq!(err.to_string(), "Validation error in title: too long");
    }

    #[test]
    fn test_disk_full_maps_to_storage_full() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        assert!(matches!(NoteError::from(sqlite_err), NoteError::StorageFull(_)));
    }

    #[test]
    fn test_other_sqlite_errors_stay_database() {
        let err = NoteError::from(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(err, NoteError::Database(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(NoteError::network("down").is_transient());
        assert!(NoteError::Timeout(10_000).is_transient());
        assert!(!NoteError::StorageFull("full".into()).is_transient());
        assert!(!NoteError::Registration("no".into()).is_transient());
    }
}
