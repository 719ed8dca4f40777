//! Storage error handling
//!
//! Every backend reports failures through [`StoreError`]. Callers that only
//! care about the broad class of a failure use [`StoreError::kind`], which
//! collapses the engine-specific variants into [`ErrorKind`].

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Broad classification of a [`StoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No live record exists for the key
    NotFound,
    /// Stored or supplied metadata is not a JSON object
    MalformedMetadata,
    /// The request itself was unusable (e.g. an empty key)
    InvalidInput,
    /// The underlying storage medium failed
    Io,
    /// The caller withdrew the request before completion
    Cancelled,
}

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// No live record for the key
    #[error("tiddler '{key}' not found")]
    NotFound { key: String },

    /// Metadata could not be parsed as a JSON object
    #[error("malformed tiddler metadata: {details}")]
    MalformedMetadata { details: String },

    /// Keys must be non-empty titles
    #[error("tiddler key must not be empty")]
    InvalidKey,

    /// The key does not fit in a file name once encoded
    #[error("tiddler key too long: encodes to {len} bytes, limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    /// The operation was cancelled before it committed
    #[error("operation cancelled")]
    Cancelled,

    /// SQLite database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("kv database error: {0}")]
    KvDatabase(#[from] redb::DatabaseError),

    #[error("kv transaction error: {0}")]
    KvTransaction(#[from] redb::TransactionError),

    #[error("kv table error: {0}")]
    KvTable(#[from] redb::TableError),

    #[error("kv storage error: {0}")]
    KvStorage(#[from] redb::StorageError),

    #[error("kv commit error: {0}")]
    KvCommit(#[from] redb::CommitError),

    /// File system error with path context
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to encode a JSON value we built ourselves
    #[error("JSON encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Create an error from an I/O error with path context
    pub fn from_io(error: io::Error, path: impl Into<PathBuf>) -> Self {
        StoreError::Io {
            path: path.into(),
            source: error,
        }
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        StoreError::NotFound { key: key.into() }
    }

    pub fn malformed(details: impl ToString) -> Self {
        StoreError::MalformedMetadata {
            details: details.to_string(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::MalformedMetadata { .. } => ErrorKind::MalformedMetadata,
            StoreError::InvalidKey | StoreError::KeyTooLong { .. } => ErrorKind::InvalidInput,
            StoreError::Cancelled => ErrorKind::Cancelled,
            StoreError::Database(_)
            | StoreError::KvDatabase(_)
            | StoreError::KvTransaction(_)
            | StoreError::KvTable(_)
            | StoreError::KvStorage(_)
            | StoreError::KvCommit(_)
            | StoreError::Io { .. }
            | StoreError::Json(_) => ErrorKind::Io,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        let err = StoreError::not_found("HelloThere");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
        assert!(err.to_string().contains("HelloThere"));
    }

    #[test]
    fn test_io_classification_keeps_path() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StoreError::from_io(io_err, "/data/tiddlers/a.tid");

        assert_eq!(err.kind(), ErrorKind::Io);
        let msg = err.to_string();
        assert!(msg.contains("/data/tiddlers/a.tid"));
        assert!(msg.contains("access denied"));
    }

    #[test]
    fn test_sqlite_errors_are_io() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_malformed_and_cancelled() {
        let err = StoreError::malformed("expected object");
        assert_eq!(err.kind(), ErrorKind::MalformedMetadata);
        assert!(err.to_string().contains("expected object"));

        assert_eq!(StoreError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(StoreError::InvalidKey.kind(), ErrorKind::InvalidInput);
    }
}
