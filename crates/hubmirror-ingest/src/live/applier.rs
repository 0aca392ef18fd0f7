//! BatchApplier: merges batches through the gateway and advances the
//! subscription cursor.

use super::batcher::Batch;
use crate::Result;
use crate::gateway::PersistenceGateway;
use hubmirror_core::metrics::{increment, set_gauge};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Applies one batch at a time; the cursor only advances after every entry
/// of a batch has been merged.
pub struct BatchApplier {
    gateway: Arc<PersistenceGateway>,
    source_url: String,
}

impl BatchApplier {
    pub fn new(gateway: Arc<PersistenceGateway>, source_url: impl Into<String>) -> Self {
        Self {
            gateway,
            source_url: source_url.into(),
        }
    }

    /// Merge every entry, then commit the batch's highest event id.
    ///
    /// Returns the committed id, or `None` for an empty batch. On error the
    /// cursor is left where it was.
    pub fn apply(&self, batch: &Batch) -> Result<Option<u64>> {
        for entry in &batch.entries {
            if let Err(e) = self.gateway.merge(&entry.message) {
                tracing::warn!(
                    "Batch entry for event {} ({:?}) failed: {}",
                    entry.event_id,
                    entry.kind,
                    e
                );
                return Err(e.into());
            }
        }

        let Some(max_id) = batch.max_event_id() else {
            return Ok(None);
        };
        self.gateway.commit_cursor(&self.source_url, max_id)?;

        increment("live_batches_applied_total", 1);
        set_gauge("live_cursor_event_id", max_id as f64);
        tracing::debug!("Applied {} live messages, cursor at {}", batch.len(), max_id);
        Ok(Some(max_id))
    }

    /// Apply batches until the input closes. Stops at the first failed
    /// batch and returns its error.
    pub async fn run(self, mut batches: mpsc::Receiver<Batch>) -> Result<u64> {
        let mut applied = 0u64;
        while let Some(batch) = batches.recv().await {
            if let Err(e) = self.apply(&batch) {
                increment("live_batch_failures_total", 1);
                tracing::error!(
                    "Live batch of {} (up to event {:?}) failed: {}",
                    batch.len(),
                    batch.max_event_id(),
                    e
                );
                return Err(e);
            }
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::gateway::GatewayConfig;
    use crate::live::{EventKind, LiveMessage};
    use crate::normalize::Table;
    use crate::store::{SqliteStore, Store, StoreErrorKind};
    use crate::testing::*;

    const SOURCE: &str = "http://fake-hub:2281";

    fn batch(ids: &[u64]) -> Batch {
        Batch {
            entries: ids
                .iter()
                .map(|&id| LiveMessage {
                    message: cast_add(42, &format!("0x{:x}", 0x1000 + id), "live", id),
                    event_id: id,
                    kind: EventKind::Merge,
                })
                .collect(),
        }
    }

    fn applier(store: Arc<dyn Store>) -> BatchApplier {
        let gateway = PersistenceGateway::new(store, GatewayConfig::default());
        BatchApplier::new(Arc::new(gateway), SOURCE)
    }

    #[test]
    fn test_apply_commits_max_event_id() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let applier = applier(store.clone());

        assert_eq!(applier.apply(&batch(&[4, 6, 5])).unwrap(), Some(6));
        assert_eq!(store.load_cursor(SOURCE).unwrap(), Some(6));
        assert_eq!(store.count_rows(Table::Casts).unwrap(), 3);
    }

    #[test]
    fn test_empty_batch_leaves_cursor() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let applier = applier(store.clone());

        assert_eq!(applier.apply(&Batch::default()).unwrap(), None);
        assert_eq!(store.load_cursor(SOURCE).unwrap(), None);
    }

    #[test]
    fn test_failed_batch_does_not_commit() {
        let inner = Arc::new(SqliteStore::open_in_memory().unwrap());
        let flaky = Arc::new(FlakyStore::new(inner.clone(), 1, StoreErrorKind::Fatal));
        let applier = applier(flaky);

        let err = applier.apply(&batch(&[1, 2])).unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(inner.load_cursor(SOURCE).unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let inner = Arc::new(SqliteStore::open_in_memory().unwrap());
        inner.commit_cursor(SOURCE, 2).unwrap();
        let flaky = Arc::new(FlakyStore::new(inner.clone(), 1, StoreErrorKind::Fatal));

        let (tx, rx) = mpsc::channel(2);
        tx.send(batch(&[3])).await.unwrap();
        tx.send(batch(&[4])).await.unwrap();
        drop(tx);

        assert!(applier(flaky).run(rx).await.is_err());
        assert_eq!(inner.load_cursor(SOURCE).unwrap(), Some(2));
        assert_eq!(inner.count_rows(Table::Casts).unwrap(), 0);
    }
}
