//! Hub protocol messages.
//!
//! A [`Message`] is the decoded form of one signed hub message: the envelope
//! (hash, author fid, timestamp) plus a [`MessageBody`], a closed tagged union
//! selected by the message's numeric kind code. Each variant carries its own
//! strongly-shaped payload, so downstream code never checks which body
//! field happens to be present.
//!
//! Enum-valued protocol fields arrive either as their numeric code or as the
//! protocol's `SCREAMING_CASE` name, depending on which hub API produced the
//! JSON. Both forms decode through the same lookup tables, and values missing
//! from a table map to a defined sentinel instead of failing.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Farcaster epoch: 2021-01-01 00:00:00 UTC.
///
/// Message timestamps are seconds since this instant.
pub const FARCASTER_EPOCH: i64 = 1_609_459_200;

/// Convert a protocol timestamp (seconds since [`FARCASTER_EPOCH`]) to UTC.
pub fn from_farcaster_time(timestamp: u64) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(timestamp).map_err(|_| Error::InvalidTimestamp(timestamp))?;
    FARCASTER_EPOCH
        .checked_add(secs)
        .and_then(|unix| DateTime::from_timestamp(unix, 0))
        .ok_or(Error::InvalidTimestamp(timestamp))
}

/// Normalize a hex hash to lowercase with a `0x` prefix.
///
/// The prefix is optional on input.
pub fn normalize_hash(value: &str) -> Result<String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);

    if digits.is_empty() {
        return Err(Error::InvalidHash {
            value: value.to_string(),
            reason: "empty",
        });
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidHash {
            value: value.to_string(),
            reason: "not hex",
        });
    }

    Ok(format!("0x{}", digits.to_ascii_lowercase()))
}

fn deserialize_hash<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    normalize_hash(&raw).map_err(serde::de::Error::custom)
}

// ═══════════════════════════════════════════════════════════════════════════
// Protocol enums
// ═══════════════════════════════════════════════════════════════════════════

/// A protocol enum decodable from its numeric code or its protocol name.
trait ProtocolEnum: Sized {
    fn from_code(code: i64) -> Self;
    fn from_name(name: &str) -> Self;
}

fn deserialize_protocol_enum<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: ProtocolEnum,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Code(i64),
        Name(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Code(code) => T::from_code(code),
        Raw::Name(name) => match name.parse::<i64>() {
            Ok(code) => T::from_code(code),
            Err(_) => T::from_name(&name),
        },
    })
}

macro_rules! protocol_enum {
    ($ty:ty) => {
        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                deserialize_protocol_enum(deserializer)
            }
        }
    };
}

/// Message kind code (`data.type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    None,
    CastAdd,
    CastRemove,
    ReactionAdd,
    ReactionRemove,
    LinkAdd,
    LinkRemove,
    VerificationAdd,
    VerificationRemove,
    SignerAdd,
    SignerRemove,
    UserDataAdd,
    UsernameProof,
    FrameAction,
    LinkCompactState,
    /// A code this build doesn't know about.
    Unknown(i64),
}

const MESSAGE_TYPES: [(MessageType, i64, &str); 15] = [
    (MessageType::None, 0, "MESSAGE_TYPE_NONE"),
    (MessageType::CastAdd, 1, "MESSAGE_TYPE_CAST_ADD"),
    (MessageType::CastRemove, 2, "MESSAGE_TYPE_CAST_REMOVE"),
    (MessageType::ReactionAdd, 3, "MESSAGE_TYPE_REACTION_ADD"),
    (MessageType::ReactionRemove, 4, "MESSAGE_TYPE_REACTION_REMOVE"),
    (MessageType::LinkAdd, 5, "MESSAGE_TYPE_LINK_ADD"),
    (MessageType::LinkRemove, 6, "MESSAGE_TYPE_LINK_REMOVE"),
    (MessageType::VerificationAdd, 7, "MESSAGE_TYPE_VERIFICATION_ADD_ETH_ADDRESS"),
    (MessageType::VerificationRemove, 8, "MESSAGE_TYPE_VERIFICATION_REMOVE"),
    (MessageType::SignerAdd, 9, "MESSAGE_TYPE_SIGNER_ADD"),
    (MessageType::SignerRemove, 10, "MESSAGE_TYPE_SIGNER_REMOVE"),
    (MessageType::UserDataAdd, 11, "MESSAGE_TYPE_USER_DATA_ADD"),
    (MessageType::UsernameProof, 12, "MESSAGE_TYPE_USERNAME_PROOF"),
    (MessageType::FrameAction, 13, "MESSAGE_TYPE_FRAME_ACTION"),
    (MessageType::LinkCompactState, 14, "MESSAGE_TYPE_LINK_COMPACT_STATE"),
];

impl MessageType {
    /// Numeric protocol code.
    pub fn code(self) -> i64 {
        if let Self::Unknown(code) = self {
            return code;
        }
        MESSAGE_TYPES
            .iter()
            .find(|(ty, _, _)| *ty == self)
            .map(|(_, code, _)| *code)
            .unwrap_or_default()
    }

    /// Protocol name, e.g. `MESSAGE_TYPE_CAST_ADD`.
    pub fn name(self) -> &'static str {
        MESSAGE_TYPES
            .iter()
            .find(|(ty, _, _)| *ty == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("MESSAGE_TYPE_UNKNOWN")
    }
}

impl ProtocolEnum for MessageType {
    fn from_code(code: i64) -> Self {
        MESSAGE_TYPES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(ty, _, _)| *ty)
            .unwrap_or(Self::Unknown(code))
    }

    fn from_name(name: &str) -> Self {
        // The address verification kind was renamed once multiple chains were supported.
        if name == "MESSAGE_TYPE_VERIFICATION_ADD_ADDRESS" {
            return Self::VerificationAdd;
        }
        MESSAGE_TYPES
            .iter()
            .find(|(_, _, n)| *n == name)
            .map(|(ty, _, _)| *ty)
            .unwrap_or(Self::Unknown(-1))
    }
}

protocol_enum!(MessageType);

/// Reaction kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReactionType {
    /// Sentinel for unset or unknown values.
    #[default]
    None,
    Like,
    Recast,
}

const REACTION_TYPES: [(ReactionType, i64, &str, &str); 3] = [
    (ReactionType::None, 0, "REACTION_TYPE_NONE", "none"),
    (ReactionType::Like, 1, "REACTION_TYPE_LIKE", "like"),
    (ReactionType::Recast, 2, "REACTION_TYPE_RECAST", "recast"),
];

impl ReactionType {
    /// Storage discriminant.
    pub fn as_str(self) -> &'static str {
        REACTION_TYPES
            .iter()
            .find(|(ty, ..)| *ty == self)
            .map(|(.., s)| *s)
            .unwrap_or("none")
    }
}

impl ProtocolEnum for ReactionType {
    fn from_code(code: i64) -> Self {
        REACTION_TYPES
            .iter()
            .find(|(_, c, ..)| *c == code)
            .map(|(ty, ..)| *ty)
            .unwrap_or_default()
    }

    fn from_name(name: &str) -> Self {
        REACTION_TYPES
            .iter()
            .find(|(_, _, n, _)| *n == name)
            .map(|(ty, ..)| *ty)
            .unwrap_or_default()
    }
}

protocol_enum!(ReactionType);

/// Cast length class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CastType {
    #[default]
    Cast,
    LongCast,
    TenKCast,
    /// Sentinel for unknown values.
    None,
}

const CAST_TYPES: [(CastType, i64, &str, &str); 3] = [
    (CastType::Cast, 0, "CAST", "cast"),
    (CastType::LongCast, 1, "LONG_CAST", "long_cast"),
    (CastType::TenKCast, 2, "TEN_K_CAST", "ten_k_cast"),
];

impl CastType {
    /// Storage discriminant.
    pub fn as_str(self) -> &'static str {
        CAST_TYPES
            .iter()
            .find(|(ty, ..)| *ty == self)
            .map(|(.., s)| *s)
            .unwrap_or("none")
    }
}

impl ProtocolEnum for CastType {
    fn from_code(code: i64) -> Self {
        CAST_TYPES
            .iter()
            .find(|(_, c, ..)| *c == code)
            .map(|(ty, ..)| *ty)
            .unwrap_or(Self::None)
    }

    fn from_name(name: &str) -> Self {
        CAST_TYPES
            .iter()
            .find(|(_, _, n, _)| *n == name)
            .map(|(ty, ..)| *ty)
            .unwrap_or(Self::None)
    }
}

protocol_enum!(CastType);

/// Profile field kind carried by a user-data message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UserDataType {
    #[default]
    None,
    Pfp,
    Display,
    Bio,
    Url,
    Username,
    Location,
    Twitter,
    Github,
    Banner,
    /// A code outside the table; kept so the raw record stays faithful.
    Other(i64),
}

const USER_DATA_TYPES: [(UserDataType, i64, &str); 10] = [
    (UserDataType::None, 0, "USER_DATA_TYPE_NONE"),
    (UserDataType::Pfp, 1, "USER_DATA_TYPE_PFP"),
    (UserDataType::Display, 2, "USER_DATA_TYPE_DISPLAY"),
    (UserDataType::Bio, 3, "USER_DATA_TYPE_BIO"),
    (UserDataType::Url, 5, "USER_DATA_TYPE_URL"),
    (UserDataType::Username, 6, "USER_DATA_TYPE_USERNAME"),
    (UserDataType::Location, 7, "USER_DATA_TYPE_LOCATION"),
    (UserDataType::Twitter, 8, "USER_DATA_TYPE_TWITTER"),
    (UserDataType::Github, 9, "USER_DATA_TYPE_GITHUB"),
    (UserDataType::Banner, 10, "USER_DATA_TYPE_BANNER"),
];

impl UserDataType {
    /// Numeric protocol code.
    pub fn code(self) -> i64 {
        if let Self::Other(code) = self {
            return code;
        }
        USER_DATA_TYPES
            .iter()
            .find(|(ty, ..)| *ty == self)
            .map(|(_, code, _)| *code)
            .unwrap_or_default()
    }

    /// Account column folded from this field, if any.
    pub fn account_field(self) -> Option<&'static str> {
        match self {
            Self::Pfp => Some("pfp_url"),
            Self::Display => Some("display_name"),
            Self::Bio => Some("bio"),
            Self::Url => Some("url"),
            Self::Username => Some("fname"),
            _ => None,
        }
    }
}

impl ProtocolEnum for UserDataType {
    fn from_code(code: i64) -> Self {
        USER_DATA_TYPES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(ty, ..)| *ty)
            .unwrap_or(Self::Other(code))
    }

    fn from_name(name: &str) -> Self {
        USER_DATA_TYPES
            .iter()
            .find(|(_, _, n)| *n == name)
            .map(|(ty, ..)| *ty)
            .unwrap_or_default()
    }
}

protocol_enum!(UserDataType);

/// Chain a verified address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VerificationProtocol {
    #[default]
    Ethereum,
    Solana,
    /// Sentinel for unknown values.
    None,
}

impl VerificationProtocol {
    /// Storage discriminant.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ethereum => "ethereum",
            Self::Solana => "solana",
            Self::None => "none",
        }
    }
}

impl ProtocolEnum for VerificationProtocol {
    fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Ethereum,
            1 => Self::Solana,
            _ => Self::None,
        }
    }

    fn from_name(name: &str) -> Self {
        match name {
            "PROTOCOL_ETHEREUM" => Self::Ethereum,
            "PROTOCOL_SOLANA" => Self::Solana,
            _ => Self::None,
        }
    }
}

protocol_enum!(VerificationProtocol);

// ═══════════════════════════════════════════════════════════════════════════
// Message bodies
// ═══════════════════════════════════════════════════════════════════════════

/// Reference to a cast by author and hash.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CastId {
    pub fid: u64,
    #[serde(deserialize_with = "deserialize_hash")]
    pub hash: String,
}

/// One embed of a cast: a URL or another cast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Embed {
    pub url: Option<String>,
    pub cast_id: Option<CastId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CastAddBody {
    pub text: String,
    pub mentions: Vec<u64>,
    pub mentions_positions: Vec<u32>,
    pub embeds: Vec<Embed>,
    pub parent_cast_id: Option<CastId>,
    pub parent_url: Option<String>,
    #[serde(rename = "type")]
    pub cast_type: CastType,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastRemoveBody {
    #[serde(deserialize_with = "deserialize_hash")]
    pub target_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReactionBody {
    #[serde(rename = "type")]
    pub reaction_type: ReactionType,
    pub target_cast_id: Option<CastId>,
    pub target_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkBody {
    #[serde(rename = "type")]
    pub link_type: String,
    pub target_fid: Option<u64>,
    pub display_timestamp: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationAddBody {
    pub address: String,
    #[serde(alias = "ethSignature")]
    pub claim_signature: String,
    pub block_hash: String,
    pub protocol: VerificationProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationRemoveBody {
    pub address: String,
    pub protocol: VerificationProtocol,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserDataBody {
    #[serde(rename = "type")]
    pub user_data_type: UserDataType,
    pub value: String,
}

/// Typed payload of a message, one variant per supported kind code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    CastAdd(CastAddBody),
    CastRemove(CastRemoveBody),
    ReactionAdd(ReactionBody),
    ReactionRemove(ReactionBody),
    LinkAdd(LinkBody),
    LinkRemove(LinkBody),
    VerificationAdd(VerificationAddBody),
    VerificationRemove(VerificationRemoveBody),
    UserDataAdd(UserDataBody),
    /// Kinds the mirror doesn't store (signers, proofs, unknown codes).
    Unsupported(MessageType),
}

impl MessageBody {
    /// Decode the body named by `message_type` out of the `data` fields.
    ///
    /// Only the field belonging to the given kind is consulted.
    fn decode(message_type: MessageType, fields: &mut Map<String, Value>) -> Result<Self> {
        use MessageType as T;

        Ok(match message_type {
            T::CastAdd => Self::CastAdd(take_body(fields, message_type, &["castAddBody"])?),
            T::CastRemove => {
                Self::CastRemove(take_body(fields, message_type, &["castRemoveBody"])?)
            }
            T::ReactionAdd => Self::ReactionAdd(take_body(fields, message_type, &["reactionBody"])?),
            T::ReactionRemove => {
                Self::ReactionRemove(take_body(fields, message_type, &["reactionBody"])?)
            }
            T::LinkAdd => Self::LinkAdd(take_body(fields, message_type, &["linkBody"])?),
            T::LinkRemove => Self::LinkRemove(take_body(fields, message_type, &["linkBody"])?),
            T::VerificationAdd => Self::VerificationAdd(take_body(
                fields,
                message_type,
                &["verificationAddAddressBody", "verificationAddEthAddressBody"],
            )?),
            T::VerificationRemove => Self::VerificationRemove(take_body(
                fields,
                message_type,
                &["verificationRemoveBody"],
            )?),
            T::UserDataAdd => Self::UserDataAdd(take_body(fields, message_type, &["userDataBody"])?),
            other => Self::Unsupported(other),
        })
    }
}

fn take_body<T: DeserializeOwned>(
    fields: &mut Map<String, Value>,
    message_type: MessageType,
    names: &[&'static str],
) -> Result<T> {
    for name in names {
        if let Some(value) = fields.remove(*name)
            && !value.is_null()
        {
            return Ok(serde_json::from_value(value)?);
        }
    }
    Err(Error::MissingBody {
        message_type: message_type.name(),
        field: names[0],
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Envelope
// ═══════════════════════════════════════════════════════════════════════════

/// A decoded hub message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    /// Normalized `0x`-prefixed content hash.
    pub hash: String,
    /// Author account id.
    pub fid: u64,
    /// Message timestamp.
    pub timestamp: DateTime<Utc>,
    /// Kind code as received.
    pub message_type: MessageType,
    /// Typed payload.
    pub body: MessageBody,
}

impl Message {
    /// Decode a message from a JSON value as served by the hub HTTP API.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

#[derive(Deserialize)]
struct RawMessage {
    data: Option<RawData>,
    #[serde(default)]
    hash: String,
}

#[derive(Deserialize)]
struct RawData {
    #[serde(rename = "type")]
    message_type: MessageType,
    fid: u64,
    timestamp: u64,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl TryFrom<RawMessage> for Message {
    type Error = Error;

    fn try_from(raw: RawMessage) -> Result<Self> {
        let hash = normalize_hash(&raw.hash)?;
        let mut data = raw.data.ok_or(Error::MissingData { hash: raw.hash })?;
        let body = MessageBody::decode(data.message_type, &mut data.fields)?;

        Ok(Self {
            hash,
            fid: data.fid,
            timestamp: from_farcaster_time(data.timestamp)?,
            message_type: data.message_type,
            body,
        })
    }
}
