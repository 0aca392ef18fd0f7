//! Core types and shared utilities for the hubmirror replication engine.
//!
//! This crate provides:
//! - Decoded hub protocol messages with a closed, typed body union
//! - Protocol enum lookup tables (message, reaction, cast, user-data kinds)
//! - Farcaster time and hash normalization helpers
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod message;
pub mod metrics;

pub use error::{Error, Result};
pub use message::{
    CastAddBody, CastId, CastRemoveBody, CastType, Embed, FARCASTER_EPOCH, LinkBody, Message,
    MessageBody, MessageType, ReactionBody, ReactionType, UserDataBody, UserDataType,
    VerificationAddBody, VerificationProtocol, VerificationRemoveBody, from_farcaster_time,
    normalize_hash,
};
