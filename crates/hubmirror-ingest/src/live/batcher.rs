//! Batcher: groups live messages into bounded, time-limited batches.
//!
//! A batch is flushed when it reaches `max_batch_size` entries or when
//! `max_wait` has passed since its first entry arrived, whichever comes
//! first. Whatever is buffered when the input closes is flushed as a final
//! batch.

use super::subscriber::LiveMessage;
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(1000);

/// Placeholder deadline while the buffer is empty.
const IDLE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

/// Messages in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub entries: Vec<LiveMessage>,
}

impl Batch {
    /// Highest event id in the batch; the cursor value to commit once
    /// every entry is applied.
    pub fn max_event_id(&self) -> Option<u64> {
        self.entries.iter().map(|e| e.event_id).max()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read messages from `input` and emit batches on `output` until the input
/// closes.
///
/// Sending a batch waits for the downstream slot, so a slow applier holds
/// back the batcher rather than piling up batches.
pub async fn run_batcher(
    config: BatcherConfig,
    mut input: mpsc::Receiver<LiveMessage>,
    output: mpsc::Sender<Batch>,
) -> Result<()> {
    let max_size = config.max_batch_size.max(1);
    let mut buffer: Vec<LiveMessage> = Vec::with_capacity(max_size);
    let mut deadline: Option<Instant> = None;

    loop {
        let timer = sleep_until(deadline.unwrap_or_else(|| Instant::now() + IDLE));

        tokio::select! {
            received = input.recv() => match received {
                Some(message) => {
                    if buffer.is_empty() {
                        deadline = Some(Instant::now() + config.max_wait);
                    }
                    buffer.push(message);
                    if buffer.len() >= max_size {
                        flush(&mut buffer, &output).await?;
                        deadline = None;
                    }
                }
                None => {
                    if !buffer.is_empty() {
                        flush(&mut buffer, &output).await?;
                    }
                    return Ok(());
                }
            },
            _ = timer, if deadline.is_some() => {
                flush(&mut buffer, &output).await?;
                deadline = None;
            }
        }
    }
}

async fn flush(buffer: &mut Vec<LiveMessage>, output: &mpsc::Sender<Batch>) -> Result<()> {
    let batch = Batch {
        entries: std::mem::take(buffer),
    };
    tracing::debug!(
        "Flushing batch of {} (up to event {:?})",
        batch.len(),
        batch.max_event_id()
    );
    output
        .send(batch)
        .await
        .map_err(|_| Error::ChannelClosed("live applier"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::EventKind;
    use crate::testing::cast_add;

    fn live(id: u64) -> LiveMessage {
        LiveMessage {
            message: cast_add(42, &format!("0x{:x}", id), "live", id),
            event_id: id,
            kind: EventKind::Merge,
        }
    }

    fn spawn_batcher(
        config: BatcherConfig,
    ) -> (mpsc::Sender<LiveMessage>, mpsc::Receiver<Batch>) {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(1);
        tokio::spawn(run_batcher(config, in_rx, out_tx));
        (in_tx, out_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_without_waiting() {
        let (tx, mut batches) = spawn_batcher(BatcherConfig {
            max_batch_size: 10,
            max_wait: Duration::from_millis(1000),
        });
        let start = Instant::now();

        for id in 1..=10 {
            tx.send(live(id)).await.unwrap();
        }

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.len(), 10);
        assert_eq!(batch.max_event_id(), Some(10));
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_after_max_wait() {
        let (tx, mut batches) = spawn_batcher(BatcherConfig {
            max_batch_size: 10,
            max_wait: Duration::from_millis(1000),
        });
        let start = Instant::now();

        for id in 1..=5 {
            tx.send(live(id)).await.unwrap();
        }

        let batch = batches.recv().await.unwrap();
        let waited = start.elapsed();
        assert_eq!(batch.len(), 5);
        assert!(waited >= Duration::from_millis(1000));
        assert!(waited < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_preserves_arrival_order_across_batches() {
        let (tx, mut batches) = spawn_batcher(BatcherConfig {
            max_batch_size: 3,
            max_wait: Duration::from_millis(1000),
        });

        for id in [7, 3, 9, 4] {
            tx.send(live(id)).await.unwrap();
        }
        drop(tx);

        let first = batches.recv().await.unwrap();
        let ids: Vec<u64> = first.entries.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![7, 3, 9]);
        assert_eq!(first.max_event_id(), Some(9));

        let rest = batches.recv().await.unwrap();
        assert_eq!(rest.max_event_id(), Some(4));
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_remainder_flushed_on_close() {
        let (tx, mut batches) = spawn_batcher(BatcherConfig::default());
        tx.send(live(1)).await.unwrap();
        tx.send(live(2)).await.unwrap();
        drop(tx);

        let batch = batches.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_output_is_an_error() {
        let (in_tx, in_rx) = mpsc::channel(4);
        let (out_tx, out_rx) = mpsc::channel(1);
        drop(out_rx);

        in_tx.send(live(1)).await.unwrap();
        drop(in_tx);

        let err = run_batcher(BatcherConfig::default(), in_rx, out_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChannelClosed(_)));
    }

    #[test]
    fn test_empty_batch_has_no_cursor() {
        assert_eq!(Batch::default().max_event_id(), None);
    }
}
