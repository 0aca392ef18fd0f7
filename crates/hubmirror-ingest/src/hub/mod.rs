//! HubClient: the RPC surface the replication engine consumes.
//!
//! Three operations: the highest account id, one page of an account's
//! messages of a given kind, and a live event stream starting at a cursor.
//! RPC failures are returned to the caller, never swallowed here.
//!
//! [`HttpHubClient`] binds these to the hub's HTTP JSON API; tests use an
//! in-memory fake.

mod http;
mod paging;

pub use http::{
    DEFAULT_HUB_URL, DEFAULT_PAGE_SIZE, DbStats, HttpHubClient, HttpHubConfig, HubInfo,
};
pub use paging::PageCursor;

use crate::Result;
use hubmirror_core::Message;
use serde::{Deserialize, Deserializer};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// The six per-account message kinds fetched during backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Casts,
    Reactions,
    Links,
    Signers,
    Verifications,
    UserData,
}

impl MessageKind {
    /// Every kind, in backfill order.
    pub const ALL: [MessageKind; 6] = [
        Self::Casts,
        Self::Reactions,
        Self::Links,
        Self::Signers,
        Self::Verifications,
        Self::UserData,
    ];

    /// HTTP API path for this kind.
    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Casts => "/v1/castsByFid",
            Self::Reactions => "/v1/reactionsByFid",
            Self::Links => "/v1/linksByFid",
            Self::Signers => "/v1/onChainSignersByFid",
            Self::Verifications => "/v1/verificationsByFid",
            Self::UserData => "/v1/userDataByFid",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Casts => "casts",
            Self::Reactions => "reactions",
            Self::Links => "links",
            Self::Signers => "signers",
            Self::Verifications => "verifications",
            Self::UserData => "user_data",
        }
    }
}

/// One page of an account's history.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Continuation token; `None` or empty means this kind is exhausted.
    pub next_page_token: Option<String>,
}

/// Live event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubEventType {
    MergeMessage,
    PruneMessage,
    RevokeMessage,
    /// Any other event (on-chain events, username proofs, unknown codes).
    Other(i64),
}

impl HubEventType {
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::MergeMessage,
            2 => Self::PruneMessage,
            3 => Self::RevokeMessage,
            other => Self::Other(other),
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "HUB_EVENT_TYPE_MERGE_MESSAGE" => Self::MergeMessage,
            "HUB_EVENT_TYPE_PRUNE_MESSAGE" => Self::PruneMessage,
            "HUB_EVENT_TYPE_REVOKE_MESSAGE" => Self::RevokeMessage,
            _ => Self::Other(-1),
        }
    }
}

impl<'de> Deserialize<'de> for HubEventType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Code(i64),
            Name(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Code(code) => Self::from_code(code),
            Raw::Name(name) => Self::from_name(&name),
        })
    }
}

/// Body of a merge/prune/revoke event. The message stays raw JSON until
/// the subscriber classifies the event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EventMessageBody {
    #[serde(default)]
    pub message: Option<serde_json::Value>,
}

/// One event from the live stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: HubEventType,
    #[serde(default)]
    pub merge_message_body: Option<EventMessageBody>,
    #[serde(default)]
    pub prune_message_body: Option<EventMessageBody>,
    #[serde(default)]
    pub revoke_message_body: Option<EventMessageBody>,
}

/// A live event stream.
///
/// Events arrive on a bounded channel fed by a background task. Closing
/// the stream (explicitly or by dropping it) stops that task.
pub struct EventStream {
    events: mpsc::Receiver<HubEvent>,
    task: Option<AbortHandle>,
}

impl EventStream {
    pub fn new(events: mpsc::Receiver<HubEvent>, task: Option<AbortHandle>) -> Self {
        Self { events, task }
    }

    /// A finite stream over already-known events.
    pub fn from_events(events: Vec<HubEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity covers every event.
            let _ = tx.try_send(event);
        }
        Self::new(rx, None)
    }

    /// Next event, or `None` once the stream has ended or been closed.
    pub async fn next(&mut self) -> Option<HubEvent> {
        self.events.recv().await
    }

    /// Stop the feeding task and refuse further events. Idempotent.
    pub fn close(&mut self) {
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Handle that closes the underlying connection from elsewhere.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.task.clone()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Client for a hub's RPC surface.
pub trait HubClient: Send + Sync + 'static {
    /// Identifies the hub; used as the subscription cursor key.
    fn source_url(&self) -> &str;

    /// Highest account id known to the hub (0 if none).
    fn max_account_id(&self) -> impl Future<Output = Result<u64>> + Send;

    /// One page of `fid`'s messages of `kind`, starting at `page_token`.
    fn messages_page(
        &self,
        fid: u64,
        kind: MessageKind,
        page_token: Option<String>,
    ) -> impl Future<Output = Result<MessagePage>> + Send;

    /// Live events with id >= `from_event_id` (start of stream if `None`).
    fn subscribe(
        &self,
        from_event_id: Option<u64>,
    ) -> impl Future<Output = Result<EventStream>> + Send;
}
