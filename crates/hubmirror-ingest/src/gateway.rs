//! PersistenceGateway: the single write path into the store.
//!
//! Backfill workers and the live applier both merge messages through one
//! gateway. Each [`StoreOp`] is applied as stubs first, then the keyed
//! upsert. A transient failure anywhere in that sequence retries the whole
//! operation, up to [`GatewayConfig::max_attempts`] tries in total; every
//! step is idempotent, so a retried stub that already landed is a no-op.

use crate::normalize::{StoreOp, normalize};
use crate::store::{Store, StoreResult};
use hubmirror_core::Message;
use hubmirror_core::metrics::increment;
use std::collections::HashSet;
use std::sync::Arc;

/// Default number of attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Configuration for the persistence gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Total tries per operation, first attempt included.
    pub max_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Applies storage operations with bounded retry.
pub struct PersistenceGateway {
    store: Arc<dyn Store>,
    config: GatewayConfig,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn Store>, config: GatewayConfig) -> Self {
        Self { store, config }
    }

    /// Apply one operation: resolve its stubs, then upsert.
    pub fn apply(&self, op: &StoreOp) -> StoreResult<()> {
        self.with_retry(&op.key, || {
            for stub in &op.ensure_exists {
                self.store.ensure_stub(stub)?;
            }
            self.store.upsert(op)
        })?;
        increment("gateway_ops_applied_total", 1);
        Ok(())
    }

    /// Normalize a message and apply every resulting operation in order.
    ///
    /// Returns the number of operations applied (0 for ignored kinds).
    pub fn merge(&self, message: &Message) -> StoreResult<usize> {
        let ops = normalize(message);
        for op in &ops {
            self.apply(op).inspect_err(|e| {
                tracing::warn!(
                    "Failed to merge {} message {} from fid {}: {}",
                    message.message_type.name(),
                    message.hash,
                    message.fid,
                    e
                );
            })?;
        }
        Ok(ops.len())
    }

    /// Merge a page of messages, stopping at the first failure.
    pub fn merge_all(&self, messages: &[Message]) -> StoreResult<usize> {
        let mut applied = 0;
        for message in messages {
            applied += self.merge(message)?;
        }
        Ok(applied)
    }

    pub fn backfilled_accounts(&self) -> StoreResult<HashSet<u64>> {
        self.with_retry(&"backfill progress", || self.store.backfilled_accounts())
    }

    pub fn mark_backfilled(&self, fid: u64) -> StoreResult<()> {
        self.with_retry(&format!("fid {}", fid), || self.store.mark_backfilled(fid))
    }

    pub fn load_cursor(&self, source_url: &str) -> StoreResult<Option<u64>> {
        self.with_retry(&source_url, || self.store.load_cursor(source_url))
    }

    pub fn commit_cursor(&self, source_url: &str, event_id: u64) -> StoreResult<()> {
        self.with_retry(&source_url, || self.store.commit_cursor(source_url, event_id))
    }

    fn with_retry<T>(
        &self,
        target: &dyn std::fmt::Display,
        mut f: impl FnMut() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    tracing::warn!(
                        "Store conflict on {} (attempt {}/{}), retrying: {}",
                        target,
                        attempt,
                        max_attempts,
                        e
                    );
                    increment("gateway_retries_total", 1);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
