//! Error types for the sync engine.

use fieldsync_core::{EntityType, ResolutionStrategy, StoreError};
use fieldsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// `Clone` so one in-flight run result can be handed to every waiter.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Request exceeded the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// Server body did not match the wire contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the request.
    #[error("server error ({status}): {message}")]
    ServerError {
        /// HTTP status.
        status: u16,
        /// Server message.
        message: String,
    },

    /// Local store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// No adapter is registered for the entity type.
    #[error("no sync adapter for entity type: {0}")]
    UnknownEntityType(String),

    /// The actor has unresolved conflicts.
    #[error("{count} unresolved conflict(s); resolve conflicts first")]
    ConflictsPending {
        /// Number of unresolved conflicts.
        count: usize,
    },

    /// Another run holds the engine.
    #[error("a sync run is already in progress")]
    AlreadyRunning,

    /// No conflicted outbox entry matches the request.
    #[error("no unresolved conflict for {entity_type} {entity_id}")]
    ConflictNotFound {
        /// Entity type.
        entity_type: EntityType,
        /// Entity id.
        entity_id: String,
    },

    /// The server does not accept the chosen strategy for this conflict.
    #[error("strategy {strategy} is not allowed for this conflict")]
    StrategyNotAllowed {
        /// Rejected strategy.
        strategy: ResolutionStrategy,
    },

    /// A `merge`/`update_data` resolution came without an edited payload.
    #[error("strategy {0} requires an edited payload")]
    MissingPayload(ResolutionStrategy),

    /// A single-flight run ended without publishing a result.
    #[error("in-flight run was abandoned")]
    Abandoned,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout | SyncError::NotConnected | SyncError::Abandoned => true,
            SyncError::ServerError { status, .. } => matches!(status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::ServerError {
            status: 503,
            message: "unavailable".into()
        }
        .is_retryable());
        assert!(!SyncError::ServerError {
            status: 400,
            message: "bad request".into()
        }
        .is_retryable());
        assert!(!SyncError::UnknownEntityType("widget".into()).is_retryable());
        assert!(!SyncError::Protocol("garbage".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::ConflictsPending { count: 2 };
        assert_eq!(
            err.to_string(),
            "2 unresolved conflict(s); resolve conflicts first"
        );

        let err: SyncError = StoreError::OutboxEntryNotFound("s1".into()).into();
        assert!(err.to_string().contains("s1"));
    }
}
