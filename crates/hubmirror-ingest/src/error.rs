//! Error types for the replication engine.

use crate::store::StoreError;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mirroring a hub.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level HTTP failure talking to the hub.
    #[error("hub request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The hub answered with a non-success status.
    #[error("hub returned {status} for {endpoint}")]
    HubStatus {
        /// Endpoint path that was requested.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },

    /// A hub payload could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] hubmirror_core::Error),

    /// Relational store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// A pipeline stage hung up before its peer finished.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// A spawned task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether the failure came from the store and may succeed on retry.
    pub fn is_retryable_store(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}
