//! EventSubscriber: long-lived consumer of the hub's live event stream.

use crate::hub::{EventStream, HubClient, HubEvent, HubEventType};
use crate::{Error, Result};
use hubmirror_core::Message;
use hubmirror_core::metrics::increment;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Which live event carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Merge,
    Prune,
    Revoke,
}

/// A recognized event's message, forwarded to the batcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveMessage {
    pub message: Message,
    pub event_id: u64,
    pub kind: EventKind,
}

/// Result of classifying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Message { kind: EventKind, message: Message },
    Unrecognized(String),
}

/// Classify an event and decode its embedded message.
pub fn classify(event: &HubEvent) -> Classified {
    let (kind, body) = match event.event_type {
        HubEventType::MergeMessage => (EventKind::Merge, &event.merge_message_body),
        HubEventType::PruneMessage => (EventKind::Prune, &event.prune_message_body),
        HubEventType::RevokeMessage => (EventKind::Revoke, &event.revoke_message_body),
        HubEventType::Other(code) => {
            return Classified::Unrecognized(format!("event type {}", code));
        }
    };

    let Some(raw) = body.as_ref().and_then(|b| b.message.clone()) else {
        return Classified::Unrecognized(format!("{:?} event without a message", kind));
    };

    match Message::from_value(raw) {
        Ok(message) => Classified::Message { kind, message },
        Err(e) => Classified::Unrecognized(format!("undecodable message: {}", e)),
    }
}

/// Counters from one subscriber run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub received: u64,
    pub forwarded: u64,
    /// Events at or below the committed cursor.
    pub skipped: u64,
    pub unrecognized: u64,
}

/// Consumes one hub subscription and forwards recognized messages.
///
/// [`stop`](Self::stop) ends the receive loop; [`destroy`](Self::destroy)
/// also tears down the stream's connection. Both are idempotent and may be
/// called in either order, before, during or after [`run`](Self::run).
pub struct EventSubscriber<H> {
    hub: Arc<H>,
    stop_tx: watch::Sender<bool>,
    connection: Mutex<Option<AbortHandle>>,
    destroyed: AtomicBool,
}

impl<H: HubClient> EventSubscriber<H> {
    pub fn new(hub: Arc<H>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            hub,
            stop_tx,
            connection: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Stop admitting new events.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop and release the underlying connection.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.stop();
        if let Some(connection) = self.connection.lock().take() {
            connection.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Consume events after `committed` and forward them to `out`.
    ///
    /// Returns when stopped, when the stream ends, or with
    /// [`Error::ChannelClosed`] if the downstream receiver went away.
    pub async fn run(
        &self,
        committed: Option<u64>,
        out: mpsc::Sender<LiveMessage>,
    ) -> Result<SubscriberStats> {
        let mut stats = SubscriberStats::default();
        if self.is_stopped() {
            return Ok(stats);
        }

        let from = committed.map(|id| id.saturating_add(1));
        let mut stream = self.hub.subscribe(from).await?;
        if !self.attach(&stream) {
            stream.close();
            return Ok(stats);
        }

        let mut stop_rx = self.stop_tx.subscribe();
        tracing::info!(
            "Live subscription to {} started from {:?}",
            self.hub.source_url(),
            from
        );

        let result = self
            .consume(&mut stream, &mut stop_rx, committed, &out, &mut stats)
            .await;

        stream.close();
        self.connection.lock().take();
        tracing::info!(
            "Live subscription ended: {} received, {} forwarded, {} skipped, {} unrecognized",
            stats.received,
            stats.forwarded,
            stats.skipped,
            stats.unrecognized
        );
        result.map(|()| stats)
    }

    /// Remember the stream's connection unless destroy already ran.
    fn attach(&self, stream: &EventStream) -> bool {
        let mut connection = self.connection.lock();
        if self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        *connection = stream.abort_handle();
        true
    }

    async fn consume(
        &self,
        stream: &mut EventStream,
        stop_rx: &mut watch::Receiver<bool>,
        committed: Option<u64>,
        out: &mpsc::Sender<LiveMessage>,
        stats: &mut SubscriberStats,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                biased;
                _ = async { let _ = stop_rx.wait_for(|stopped| *stopped).await; } => return Ok(()),
                event = stream.next() => match event {
                    Some(event) => event,
                    None => return Ok(()),
                },
            };

            stats.received += 1;
            increment("live_events_received_total", 1);

            if committed.is_some_and(|c| event.id <= c) {
                stats.skipped += 1;
                continue;
            }

            match classify(&event) {
                Classified::Message { kind, message } => {
                    let live = LiveMessage {
                        message,
                        event_id: event.id,
                        kind,
                    };
                    out.send(live)
                        .await
                        .map_err(|_| Error::ChannelClosed("live batcher"))?;
                    stats.forwarded += 1;
                }
                Classified::Unrecognized(reason) => {
                    stats.unrecognized += 1;
                    increment("live_events_unrecognized_total", 1);
                    tracing::debug!("Dropping event {}: {}", event.id, reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::time::Duration;

    // =========================================================================
    // Classification
    // =========================================================================

    #[test]
    fn test_classify_recognized_events() {
        let json = cast_add_json(42, "0xabc", "hello", 1);

        for (event, kind) in [
            (merge_event(1, json.clone()), EventKind::Merge),
            (prune_event(2, json.clone()), EventKind::Prune),
            (revoke_event(3, json), EventKind::Revoke),
        ] {
            match classify(&event) {
                Classified::Message { kind: got, message } => {
                    assert_eq!(got, kind);
                    assert_eq!(message.hash, "0xabc");
                }
                other => panic!("expected message, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_classify_unrecognized_events() {
        assert!(matches!(classify(&other_event(1)), Classified::Unrecognized(_)));

        let mut missing = merge_event(2, serde_json::json!({}));
        missing.merge_message_body = None;
        assert!(matches!(classify(&missing), Classified::Unrecognized(_)));

        let garbage = merge_event(3, serde_json::json!({"hash": "0x01"}));
        assert!(matches!(classify(&garbage), Classified::Unrecognized(_)));
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    #[tokio::test]
    async fn test_forwards_in_order_and_drops_unrecognized() {
        let hub = FakeHub::new(0);
        for event in cast_events(1, 2) {
            hub.push_event(event);
        }
        hub.push_event(other_event(3));
        hub.push_event(cast_events(4, 1).remove(0));

        let subscriber = EventSubscriber::new(Arc::new(hub));
        let (tx, mut rx) = mpsc::channel(16);
        let stats = subscriber.run(None, tx).await.unwrap();

        assert_eq!(stats.received, 4);
        assert_eq!(stats.forwarded, 3);
        assert_eq!(stats.unrecognized, 1);

        let mut ids = Vec::new();
        while let Some(live) = rx.recv().await {
            ids.push(live.event_id);
        }
        assert_eq!(ids, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_resumes_after_committed_event() {
        let hub = Arc::new(FakeHub::new(0));
        for event in cast_events(1, 5) {
            hub.push_event(event);
        }

        let subscriber = EventSubscriber::new(hub.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let stats = subscriber.run(Some(3), tx).await.unwrap();

        assert_eq!(hub.subscriptions(), vec![Some(4)]);
        assert_eq!(stats.forwarded, 2);
        assert_eq!(rx.recv().await.unwrap().event_id, 4);
    }

    #[tokio::test]
    async fn test_destroy_before_run_returns_immediately() {
        let hub = Arc::new(FakeHub::new(0));
        let subscriber = EventSubscriber::new(hub.clone());
        subscriber.destroy();
        subscriber.destroy();

        let (tx, _rx) = mpsc::channel(1);
        let stats = subscriber.run(None, tx).await.unwrap();
        assert_eq!(stats, SubscriberStats::default());
        assert!(hub.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_ends_open_stream() {
        let hub = FakeHub::new(0).held_open();
        for event in cast_events(1, 2) {
            hub.push_event(event);
        }
        let subscriber = Arc::new(EventSubscriber::new(Arc::new(hub)));
        let (tx, mut rx) = mpsc::channel(16);

        let running = {
            let subscriber = subscriber.clone();
            tokio::spawn(async move { subscriber.run(None, tx).await })
        };

        assert_eq!(rx.recv().await.unwrap().event_id, 1);
        assert_eq!(rx.recv().await.unwrap().event_id, 2);

        subscriber.stop();
        let stats = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(stats.forwarded, 2);

        // Either order, any number of times.
        subscriber.destroy();
        subscriber.stop();
        subscriber.destroy();
    }

    #[tokio::test]
    async fn test_closed_downstream_is_an_error() {
        let hub = FakeHub::new(0);
        for event in cast_events(1, 2) {
            hub.push_event(event);
        }
        let subscriber = EventSubscriber::new(Arc::new(hub));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = subscriber.run(None, tx).await.unwrap_err();
        assert!(matches!(err, Error::ChannelClosed(_)));
    }
}
