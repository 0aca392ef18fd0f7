//! Live replication: subscriber, batcher and applier wired together.
//!
//! ```text
//! hub stream -> EventSubscriber -> mpsc -> run_batcher -> mpsc(1) -> BatchApplier
//!                                                                    |
//!                                                      merge + commit_cursor
//! ```
//!
//! The applier handles one batch at a time and the batch channel holds a
//! single slot, so cursor commits happen in stream order.

mod applier;
mod batcher;
mod subscriber;

pub use applier::BatchApplier;
pub use batcher::{Batch, BatcherConfig, DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_WAIT, run_batcher};
pub use subscriber::{
    Classified, EventKind, EventSubscriber, LiveMessage, SubscriberStats, classify,
};

use crate::Result;
use crate::gateway::PersistenceGateway;
use crate::hub::HubClient;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub batcher: BatcherConfig,
    /// Messages buffered between the subscriber and the batcher.
    pub message_buffer: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            message_buffer: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveStats {
    pub subscriber: SubscriberStats,
    pub batches: u64,
    /// Cursor after the run.
    pub cursor: Option<u64>,
}

pub struct LivePipeline<H> {
    hub: Arc<H>,
    gateway: Arc<PersistenceGateway>,
    subscriber: Arc<EventSubscriber<H>>,
    config: LiveConfig,
}

impl<H: HubClient> LivePipeline<H> {
    pub fn new(hub: Arc<H>, gateway: Arc<PersistenceGateway>, config: LiveConfig) -> Self {
        Self {
            subscriber: Arc::new(EventSubscriber::new(hub.clone())),
            hub,
            gateway,
            config,
        }
    }

    /// Stop consuming events. Buffered messages are still applied before
    /// [`run`](Self::run) returns.
    pub fn stop(&self) {
        self.subscriber.stop();
    }

    pub fn subscriber(&self) -> Arc<EventSubscriber<H>> {
        self.subscriber.clone()
    }

    /// Resume from the committed cursor and replicate until stopped, the
    /// stream ends, or a batch fails.
    pub async fn run(&self) -> Result<LiveStats> {
        let source_url = self.hub.source_url().to_string();
        let committed = self.gateway.load_cursor(&source_url)?;
        tracing::info!(
            "Live replication from {} resuming after event {:?}",
            source_url,
            committed
        );

        let (message_tx, message_rx) = mpsc::channel(self.config.message_buffer.max(1));
        let (batch_tx, batch_rx) = mpsc::channel(1);

        let batcher = tokio::spawn(run_batcher(self.config.batcher.clone(), message_rx, batch_tx));
        let mut applier = tokio::spawn(
            BatchApplier::new(self.gateway.clone(), source_url.clone()).run(batch_rx),
        );

        // A failed applier ends the run without waiting for the next event.
        let mut applier_done = None;
        let subscribed = tokio::select! {
            result = self.subscriber.run(committed, message_tx) => Some(result),
            joined = &mut applier => {
                applier_done = Some(joined);
                None
            }
        };

        let batched = batcher.await;
        let applied = match applier_done {
            Some(joined) => joined,
            None => applier.await,
        };
        self.subscriber.destroy();

        let batches = applied??;
        batched??;
        let subscriber = subscribed.transpose()?.unwrap_or_default();

        let cursor = self.gateway.load_cursor(&source_url)?;
        tracing::info!(
            "Live replication stopped after {} batches, cursor at {:?}",
            batches,
            cursor
        );
        Ok(LiveStats {
            subscriber,
            batches,
            cursor,
        })
    }
}
