//! Error types for local store operations.

use crate::entity::EntityType;
use std::io;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in local store operations.
///
/// The error is `Clone` so that a failed sync run can be reported to every
/// caller that awaited it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// I/O error while reading or writing the snapshot file.
    #[error("I/O error: {0}")]
    Io(String),

    /// Snapshot or row could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Entity row not found.
    #[error("{entity_type} row not found: {id}")]
    RowNotFound {
        /// Entity type searched.
        entity_type: EntityType,
        /// Row identifier.
        id: String,
    },

    /// A row with the same primary key already exists.
    #[error("{entity_type} row already exists: {id}")]
    DuplicateRow {
        /// Entity type written.
        entity_type: EntityType,
        /// Row identifier.
        id: String,
    },

    /// Outbox entry not found.
    #[error("outbox entry not found: {0}")]
    OutboxEntryNotFound(String),

    /// Row is malformed (missing id, not an object, ...).
    #[error("invalid row: {0}")]
    InvalidRow(String),

    /// Unknown entity type name.
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Unknown resolution strategy name.
    #[error("unknown resolution strategy: {0}")]
    UnknownStrategy(String),

    /// A journal line before the tail could not be decoded.
    #[error("corrupt journal at line {line}: {message}")]
    CorruptJournal {
        /// 1-based line number.
        line: usize,
        /// Decoder message.
        message: String,
    },

    /// Snapshot was written by an incompatible version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found on disk.
        found: u32,
        /// Version this build understands.
        expected: u32,
    },
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = StoreError::RowNotFound {
            entity_type: EntityType::Supply,
            id: "local-1".into(),
        };
        assert_eq!(err.to_string(), "supply row not found: local-1");

        let err = StoreError::UnsupportedVersion {
            found: 9,
            expected: 1,
        };
        assert!(err.to_string().contains('9'));
    }

    #[test]
    fn io_errors_convert() {
        let io = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: StoreError = io.into();
        assert!(matches!(err, StoreError::Io(ref msg) if msg.contains("gone")));
    }
}
