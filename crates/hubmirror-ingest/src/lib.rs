//! Hub replication engine.
//!
//! Mirrors a Farcaster hub's protocol messages into a relational store,
//! combining a one-time historical backfill with a continuous live
//! subscription.
//!
//! # Modules
//!
//! - [`hub`] - Hub RPC surface (paged history, live events) and its HTTP binding
//! - [`normalize`] - Protocol messages to storage operations
//! - [`store`] - SQLite schema and the `Store` trait
//! - [`gateway`] - Idempotent upserts with bounded retry
//! - [`backfill`] - Concurrent per-account history replay
//! - [`live`] - Subscriber, batcher and cursor-committing applier
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────────────┐
//!            │          HubClient           │
//!            └──────┬─────────────────┬─────┘
//!        pages      │                 │  events
//!                   ▼                 ▼
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │  BackfillScheduler   │   │   EventSubscriber    │
//! │ (N accounts at once) │   └──────────┬───────────┘
//! └──────────┬───────────┘              ▼
//!            │                ┌──────────────────────┐
//!            │                │  Batcher → Applier   │──► cursor
//!            │                └──────────┬───────────┘
//!            ▼                           ▼
//!          ┌──────────────────────────────────┐
//!          │ normalize → PersistenceGateway   │
//!          └────────────────┬─────────────────┘
//!                           ▼
//!                     ┌───────────┐
//!                     │  SQLite   │
//!                     └───────────┘
//! ```
//!
//! Both paths write through the same idempotent upserts, so they can run
//! side by side and replays never duplicate rows.

pub mod backfill;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod live;
pub mod normalize;
pub mod store;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

pub use backfill::{BackfillConfig, BackfillScheduler, BackfillStats};
pub use gateway::{GatewayConfig, PersistenceGateway};
pub use hub::{HttpHubClient, HttpHubConfig, HubClient, HubEvent, MessageKind, PageCursor};
pub use live::{BatcherConfig, LiveConfig, LivePipeline, LiveStats};
pub use normalize::{StoreOp, normalize};
pub use store::{SqliteStore, Store, StoreError, StoreErrorKind};
