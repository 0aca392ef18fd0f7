//! HubClient over the hub's HTTP JSON API.
//!
//! Paged reads map directly onto `GET /v1/<kind>ByFid`. The live stream is a
//! poller task walking `GET /v1/events` from the requested id and feeding a
//! bounded channel; it backs off on RPC errors and keeps going from the last
//! delivered event. Events are decoded one by one, so a single malformed
//! event is skipped instead of stalling the feed.

use super::{EventStream, HubClient, HubEvent, MessageKind, MessagePage};
use crate::{Error, Result};
use hubmirror_core::Message;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default hub HTTP endpoint.
pub const DEFAULT_HUB_URL: &str = "http://localhost:2281";

/// Default messages per page.
pub const DEFAULT_PAGE_SIZE: u32 = 3000;

/// Configuration for the HTTP hub client.
#[derive(Debug, Clone)]
pub struct HttpHubConfig {
    /// Base URL, e.g. `http://localhost:2281`.
    pub base_url: String,
    pub page_size: u32,
    pub request_timeout: Duration,
    /// Wait between polls once the event feed is caught up.
    pub poll_interval: Duration,
    /// Upper bound for the error backoff.
    pub max_backoff: Duration,
    /// Events buffered between the poller and the subscriber.
    pub stream_buffer: usize,
}

impl Default for HttpHubConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_HUB_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            stream_buffer: 1024,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FidsResponse {
    #[serde(default)]
    fids: Vec<u64>,
}

/// Signer pages carry on-chain events rather than messages; those have no
/// place in the mirror and are left out of the struct.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<serde_json::Value>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsResponse {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    next_page_event_id: Option<u64>,
}

/// Hub identity and store size from `GET /v1/info`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub is_syncing: bool,
    #[serde(default)]
    pub db_stats: Option<DbStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbStats {
    #[serde(default)]
    pub num_messages: u64,
    #[serde(default)]
    pub num_fid_events: u64,
    #[serde(default)]
    pub num_fname_events: u64,
}

/// Decode a page of raw events.
///
/// Returns the decodable events and the highest id seen on any event,
/// including ones that failed to decode, so the poller moves past them.
fn decode_events(raw: Vec<Value>) -> (Vec<HubEvent>, Option<u64>) {
    let mut last_id = None;
    let events = raw
        .into_iter()
        .filter_map(|value| {
            let id = value.get("id").and_then(Value::as_u64);
            last_id = last_id.max(id);
            match serde_json::from_value::<HubEvent>(value) {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Skipping undecodable event {:?}: {}", id, e);
                    None
                }
            }
        })
        .collect();
    (events, last_id)
}

/// Where the next poll starts after a page whose highest id was `last_id`.
fn next_event_id(last_id: u64, next_page_event_id: Option<u64>) -> u64 {
    let after = last_id.saturating_add(1);
    next_page_event_id.map_or(after, |n| n.max(after))
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Decode a page of raw messages, skipping (and logging) malformed ones.
fn decode_messages(fid: u64, kind: MessageKind, raw: Vec<serde_json::Value>) -> Vec<Message> {
    raw.into_iter()
        .filter_map(|value| match Message::from_value(value) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::warn!("Skipping undecodable {} message for fid {}: {}", kind.as_str(), fid, e);
                None
            }
        })
        .collect()
}

/// HTTP JSON API hub client.
#[derive(Clone)]
pub struct HttpHubClient {
    http: reqwest::Client,
    config: HttpHubConfig,
}

impl HttpHubClient {
    pub fn new(mut config: HttpHubConfig) -> Result<Self> {
        let trimmed = config.base_url.trim_end_matches('/').to_string();
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(Error::Config(format!(
                "hub URL must start with http:// or https://: {}",
                config.base_url
            )));
        }
        config.base_url = trimmed;

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> &HttpHubConfig {
        &self.config
    }

    /// Fetch the hub's info including database stats.
    pub async fn hub_info(&self) -> Result<HubInfo> {
        self.get_json("/v1/info", &[("dbstats", "1".to_string())]).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let response = self.http.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HubStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn events_page(&self, from_event_id: Option<u64>) -> Result<EventsResponse> {
        let query: Vec<(&str, String)> = from_event_id
            .map(|id| ("from_event_id", id.to_string()))
            .into_iter()
            .collect();
        self.get_json("/v1/events", &query).await
    }

    /// Poll the event feed into `tx` until the receiver goes away.
    async fn poll_events(self, mut next_id: Option<u64>, tx: mpsc::Sender<HubEvent>) {
        let mut backoff = self.config.poll_interval;

        loop {
            if tx.is_closed() {
                return;
            }

            let page = match self.events_page(next_id).await {
                Ok(page) => {
                    backoff = self.config.poll_interval;
                    page
                }
                Err(e) => {
                    tracing::warn!(
                        "Event poll from {:?} failed, retrying in {:?}: {}",
                        next_id,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff, self.config.max_backoff);
                    continue;
                }
            };

            let (events, last_id) = decode_events(page.events);
            for event in events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            match last_id {
                Some(last) => next_id = Some(next_event_id(last, page.next_page_event_id)),
                None => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
    }
}

impl HubClient for HttpHubClient {
    fn source_url(&self) -> &str {
        &self.config.base_url
    }

    async fn max_account_id(&self) -> Result<u64> {
        let response: FidsResponse = self
            .get_json(
                "/v1/fids",
                &[("pageSize", "1".to_string()), ("reverse", "1".to_string())],
            )
            .await?;
        Ok(response.fids.first().copied().unwrap_or(0))
    }

    async fn messages_page(
        &self,
        fid: u64,
        kind: MessageKind,
        page_token: Option<String>,
    ) -> Result<MessagePage> {
        let mut query = vec![
            ("fid", fid.to_string()),
            ("pageSize", self.config.page_size.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let response: MessagesResponse = self.get_json(kind.endpoint(), &query).await?;
        Ok(MessagePage {
            messages: decode_messages(fid, kind, response.messages),
            next_page_token: response.next_page_token,
        })
    }

    async fn subscribe(&self, from_event_id: Option<u64>) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(self.config.stream_buffer.max(1));
        let task = tokio::spawn(self.clone().poll_events(from_event_id, tx));
        tracing::info!(
            "Subscribed to {} events from {:?}",
            self.config.base_url,
            from_event_id
        );
        Ok(EventStream::new(rx, Some(task.abort_handle())))
    }
}
