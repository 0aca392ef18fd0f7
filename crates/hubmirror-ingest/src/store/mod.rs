//! Relational store behind the persistence gateway.
//!
//! [`Store`] is the write surface the replication engine needs: stub
//! create-if-absent, keyed upserts, per-account backfill progress and the
//! subscription cursor. [`SqliteStore`] implements it on SQLite.
//!
//! Failures are reported as a [`StoreError`] carrying a [`StoreErrorKind`],
//! so retry policy never has to inspect backend error codes.

mod rows;
mod schema;
mod sqlite;

pub use rows::{AccountRow, CastRow, LinkRow, MentionRow, ReactionRow, VerificationRow};
pub use schema::{SCHEMA_VERSION, init_schema};
pub use sqlite::SqliteStore;

use crate::normalize::{StoreOp, Stub};
use rusqlite::ErrorCode;
use std::collections::HashSet;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Coarse classification of a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Lost a race with a concurrent writer (lock contention, unique key).
    Transient,
    /// A row expected by the operation wasn't there.
    NotFound,
    /// Anything retrying won't fix.
    Fatal,
}

/// A classified store failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Transient conflicts and not-found races are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            StoreErrorKind::Transient | StoreErrorKind::NotFound
        )
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        let kind = match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreErrorKind::Transient,
                ErrorCode::ConstraintViolation
                    if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                        || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
                {
                    StoreErrorKind::Transient
                }
                _ => StoreErrorKind::Fatal,
            },
            rusqlite::Error::QueryReturnedNoRows => StoreErrorKind::NotFound,
            _ => StoreErrorKind::Fatal,
        };
        Self::new(kind, err.to_string())
    }
}

/// Write surface of the mirror.
///
/// Implementations must be safe to share between the backfill workers and
/// the live pipeline.
pub trait Store: Send + Sync {
    /// Create the referenced row if absent; never modify an existing one.
    fn ensure_stub(&self, stub: &Stub) -> StoreResult<()>;

    /// Upsert the target row, then attach relations and apply the
    /// retraction, atomically.
    fn upsert(&self, op: &StoreOp) -> StoreResult<()>;

    /// Account ids whose backfill has completed.
    fn backfilled_accounts(&self) -> StoreResult<HashSet<u64>>;

    /// Record that an account's backfill completed.
    fn mark_backfilled(&self, fid: u64) -> StoreResult<()>;

    /// Last committed event id for a subscription source.
    fn load_cursor(&self, source_url: &str) -> StoreResult<Option<u64>>;

    /// Advance the cursor. A lower id than the stored one is ignored.
    fn commit_cursor(&self, source_url: &str, event_id: u64) -> StoreResult<()>;
}
