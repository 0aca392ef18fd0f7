//! Test fixtures: an in-memory hub, a failure-injecting store and message
//! builders.

use crate::hub::{
    EventMessageBody, EventStream, HubClient, HubEvent, HubEventType, MessageKind, MessagePage,
};
use crate::normalize::{StoreOp, Stub};
use crate::store::{SqliteStore, Store, StoreError, StoreErrorKind, StoreResult};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use hubmirror_core::{
    CastAddBody, CastId, CastRemoveBody, Embed, LinkBody, Message, MessageBody, MessageType,
    ReactionBody, ReactionType, UserDataBody, UserDataType, VerificationAddBody,
    VerificationProtocol, VerificationRemoveBody, from_farcaster_time,
};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Semaphore, mpsc};

// =============================================================================
// Fake hub
// =============================================================================

/// In-memory hub. Page tokens are page indexes.
pub struct FakeHub {
    max_fid: u64,
    source_url: String,
    pages: Mutex<HashMap<(u64, MessageKind), Vec<Vec<Message>>>>,
    failing: Mutex<HashSet<u64>>,
    gates: Mutex<HashMap<u64, Arc<Semaphore>>>,
    events: Mutex<Vec<HubEvent>>,
    hold_open: bool,
    fetches: Mutex<Vec<(u64, MessageKind)>>,
    subscriptions: Mutex<Vec<Option<u64>>>,
}

impl FakeHub {
    pub fn new(max_fid: u64) -> Self {
        Self {
            max_fid,
            source_url: "http://fake-hub:2281".to_string(),
            pages: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            hold_open: false,
            fetches: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Keep subscriptions open after replaying events, like a live hub.
    pub fn held_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn add_page(&self, fid: u64, kind: MessageKind, messages: Vec<Message>) {
        self.pages
            .lock()
            .entry((fid, kind))
            .or_default()
            .push(messages);
    }

    pub fn fail_fid(&self, fid: u64) {
        self.failing.lock().insert(fid);
    }

    pub fn heal_fid(&self, fid: u64) {
        self.failing.lock().remove(&fid);
    }

    /// Hold page fetches for `fid` until the returned gate gets a permit.
    pub fn gate_fid(&self, fid: u64) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.gates.lock().insert(fid, gate.clone());
        gate
    }

    pub fn push_event(&self, event: HubEvent) {
        self.events.lock().push(event);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }

    pub fn fetched_fids(&self) -> HashSet<u64> {
        self.fetches.lock().iter().map(|(fid, _)| *fid).collect()
    }

    pub fn subscriptions(&self) -> Vec<Option<u64>> {
        self.subscriptions.lock().clone()
    }
}

impl HubClient for FakeHub {
    fn source_url(&self) -> &str {
        &self.source_url
    }

    async fn max_account_id(&self) -> Result<u64> {
        Ok(self.max_fid)
    }

    async fn messages_page(
        &self,
        fid: u64,
        kind: MessageKind,
        page_token: Option<String>,
    ) -> Result<MessagePage> {
        self.fetches.lock().push((fid, kind));
        let gate = self.gates.lock().get(&fid).cloned();
        if let Some(gate) = gate {
            let _open = gate.acquire().await;
        }
        if self.failing.lock().contains(&fid) {
            return Err(Error::HubStatus {
                endpoint: kind.endpoint().to_string(),
                status: 503,
            });
        }

        let index: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let pages = self.pages.lock();
        let Some(kind_pages) = pages.get(&(fid, kind)) else {
            return Ok(MessagePage::default());
        };

        Ok(MessagePage {
            messages: kind_pages.get(index).cloned().unwrap_or_default(),
            next_page_token: (index + 1 < kind_pages.len()).then(|| (index + 1).to_string()),
        })
    }

    async fn subscribe(&self, from_event_id: Option<u64>) -> Result<EventStream> {
        self.subscriptions.lock().push(from_event_id);
        let events: Vec<HubEvent> = self
            .events
            .lock()
            .iter()
            .filter(|e| from_event_id.is_none_or(|from| e.id >= from))
            .cloned()
            .collect();

        if !self.hold_open {
            return Ok(EventStream::from_events(events));
        }

        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        let task = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        Ok(EventStream::new(rx, Some(task.abort_handle())))
    }
}

// =============================================================================
// Failure-injecting store
// =============================================================================

/// Wraps a real store and fails the first `failures` upserts with `kind`.
pub struct FlakyStore {
    inner: Arc<SqliteStore>,
    failures: AtomicUsize,
    kind: StoreErrorKind,
    upserts: AtomicUsize,
}

impl FlakyStore {
    pub fn new(inner: Arc<SqliteStore>, failures: usize, kind: StoreErrorKind) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(failures),
            kind,
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl Store for FlakyStore {
    fn ensure_stub(&self, stub: &Stub) -> StoreResult<()> {
        self.inner.ensure_stub(stub)
    }

    fn upsert(&self, op: &StoreOp) -> StoreResult<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::new(self.kind, "injected failure"));
        }
        self.inner.upsert(op)
    }

    fn backfilled_accounts(&self) -> StoreResult<HashSet<u64>> {
        self.inner.backfilled_accounts()
    }

    fn mark_backfilled(&self, fid: u64) -> StoreResult<()> {
        self.inner.mark_backfilled(fid)
    }

    fn load_cursor(&self, source_url: &str) -> StoreResult<Option<u64>> {
        self.inner.load_cursor(source_url)
    }

    fn commit_cursor(&self, source_url: &str, event_id: u64) -> StoreResult<()> {
        self.inner.commit_cursor(source_url, event_id)
    }
}

// =============================================================================
// Message builders
// =============================================================================

pub fn ts(secs: u64) -> DateTime<Utc> {
    from_farcaster_time(secs).unwrap()
}

pub fn message(
    hash: &str,
    fid: u64,
    secs: u64,
    message_type: MessageType,
    body: MessageBody,
) -> Message {
    Message {
        hash: hash.to_string(),
        fid,
        timestamp: ts(secs),
        message_type,
        body,
    }
}

pub fn cast_id(fid: u64, hash: &str) -> CastId {
    CastId {
        fid,
        hash: hash.to_string(),
    }
}

pub fn cast_add(fid: u64, hash: &str, text: &str, secs: u64) -> Message {
    let body = CastAddBody {
        text: text.to_string(),
        ..Default::default()
    };
    message(hash, fid, secs, MessageType::CastAdd, MessageBody::CastAdd(body))
}

/// A cast mentioning `mentions` and embedding casts authored by fid 9.
pub fn cast_with_refs(fid: u64, hash: &str, mentions: &[u64], embedded: &[&str]) -> Message {
    let body = CastAddBody {
        text: "refs".to_string(),
        mentions: mentions.to_vec(),
        mentions_positions: (0..mentions.len() as u32).collect(),
        embeds: embedded
            .iter()
            .map(|h| Embed {
                url: None,
                cast_id: Some(cast_id(9, h)),
            })
            .collect(),
        ..Default::default()
    };
    message(hash, fid, 1, MessageType::CastAdd, MessageBody::CastAdd(body))
}

pub fn cast_remove(fid: u64, target: &str, hash: &str, secs: u64) -> Message {
    let body = CastRemoveBody {
        target_hash: target.to_string(),
    };
    message(hash, fid, secs, MessageType::CastRemove, MessageBody::CastRemove(body))
}

fn like(target: CastId) -> ReactionBody {
    ReactionBody {
        reaction_type: ReactionType::Like,
        target_cast_id: Some(target),
        target_url: None,
    }
}

pub fn reaction_add(fid: u64, hash: &str, target: CastId, secs: u64) -> Message {
    message(
        hash,
        fid,
        secs,
        MessageType::ReactionAdd,
        MessageBody::ReactionAdd(like(target)),
    )
}

pub fn reaction_remove(fid: u64, hash: &str, target: CastId, secs: u64) -> Message {
    message(
        hash,
        fid,
        secs,
        MessageType::ReactionRemove,
        MessageBody::ReactionRemove(like(target)),
    )
}

fn follow(target_fid: u64) -> LinkBody {
    LinkBody {
        link_type: "follow".to_string(),
        target_fid: Some(target_fid),
        display_timestamp: None,
    }
}

pub fn link_add(fid: u64, hash: &str, target_fid: u64, secs: u64) -> Message {
    message(
        hash,
        fid,
        secs,
        MessageType::LinkAdd,
        MessageBody::LinkAdd(follow(target_fid)),
    )
}

pub fn link_remove(fid: u64, hash: &str, target_fid: u64, secs: u64) -> Message {
    message(
        hash,
        fid,
        secs,
        MessageType::LinkRemove,
        MessageBody::LinkRemove(follow(target_fid)),
    )
}

pub fn verification_add(fid: u64, hash: &str, address: &str, secs: u64) -> Message {
    let body = VerificationAddBody {
        address: address.to_string(),
        claim_signature: "0xsig".to_string(),
        block_hash: "0xblock".to_string(),
        protocol: VerificationProtocol::Ethereum,
    };
    message(
        hash,
        fid,
        secs,
        MessageType::VerificationAdd,
        MessageBody::VerificationAdd(body),
    )
}

pub fn verification_remove(fid: u64, hash: &str, address: &str, secs: u64) -> Message {
    let body = VerificationRemoveBody {
        address: address.to_string(),
        protocol: VerificationProtocol::Ethereum,
    };
    message(
        hash,
        fid,
        secs,
        MessageType::VerificationRemove,
        MessageBody::VerificationRemove(body),
    )
}

pub fn user_data(fid: u64, hash: &str, kind: UserDataType, value: &str, secs: u64) -> Message {
    let body = UserDataBody {
        user_data_type: kind,
        value: value.to_string(),
    };
    message(
        hash,
        fid,
        secs,
        MessageType::UserDataAdd,
        MessageBody::UserDataAdd(body),
    )
}

pub fn signer_add(fid: u64, hash: &str, secs: u64) -> Message {
    message(
        hash,
        fid,
        secs,
        MessageType::SignerAdd,
        MessageBody::Unsupported(MessageType::SignerAdd),
    )
}

// =============================================================================
// Event builders
// =============================================================================

/// Wire form of a cast-add, as the hub's HTTP API serves it.
pub fn cast_add_json(fid: u64, hash: &str, text: &str, secs: u64) -> serde_json::Value {
    json!({
        "data": {
            "type": "MESSAGE_TYPE_CAST_ADD",
            "fid": fid,
            "timestamp": secs,
            "castAddBody": {"text": text}
        },
        "hash": hash
    })
}

fn body(message: serde_json::Value) -> Option<EventMessageBody> {
    Some(EventMessageBody {
        message: Some(message),
    })
}

fn event(id: u64, event_type: HubEventType) -> HubEvent {
    HubEvent {
        id,
        event_type,
        merge_message_body: None,
        prune_message_body: None,
        revoke_message_body: None,
    }
}

pub fn merge_event(id: u64, message: serde_json::Value) -> HubEvent {
    HubEvent {
        merge_message_body: body(message),
        ..event(id, HubEventType::MergeMessage)
    }
}

pub fn prune_event(id: u64, message: serde_json::Value) -> HubEvent {
    HubEvent {
        prune_message_body: body(message),
        ..event(id, HubEventType::PruneMessage)
    }
}

pub fn revoke_event(id: u64, message: serde_json::Value) -> HubEvent {
    HubEvent {
        revoke_message_body: body(message),
        ..event(id, HubEventType::RevokeMessage)
    }
}

/// An event the mirror doesn't handle (e.g. an on-chain event).
pub fn other_event(id: u64) -> HubEvent {
    event(id, HubEventType::Other(9))
}

/// `n` merge events with ids `first..first + n`, one cast each.
pub fn cast_events(first: u64, n: u64) -> Vec<HubEvent> {
    (first..first + n)
        .map(|id| {
            merge_event(
                id,
                cast_add_json(42, &format!("0x{:x}", 0x1000 + id), "live", id),
            )
        })
        .collect()
}
