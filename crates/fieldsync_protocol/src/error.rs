//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while decoding server bodies.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Body is not the expected JSON shape.
    #[error("invalid body: {0}")]
    InvalidBody(String),

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field has the wrong type or value.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Field name.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Raw JSON could not be parsed.
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}
