//! Error types for protocol message decoding.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding hub messages.
#[derive(Error, Debug)]
pub enum Error {
    /// A hash or byte field is not valid hex.
    #[error("invalid hash '{value}': {reason}")]
    InvalidHash {
        /// The offending value as received.
        value: String,
        /// Description of what's wrong.
        reason: &'static str,
    },

    /// The message type names a body that is absent from the payload.
    #[error("{message_type} message is missing its '{field}' body")]
    MissingBody {
        /// Protocol name of the message type.
        message_type: &'static str,
        /// JSON field that should carry the body.
        field: &'static str,
    },

    /// The message envelope carries no `data` section.
    #[error("message {hash} has no data")]
    MissingData {
        /// Hash of the message, as received.
        hash: String,
    },

    /// Timestamp can't be represented as a UTC instant.
    #[error("timestamp {0} is out of range")]
    InvalidTimestamp(u64),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
