//! MessageNormalizer: decoded hub messages to storage operations.
//!
//! Normalization is pure. Each message kind maps to zero or more
//! [`StoreOp`]s; kinds the mirror doesn't store map to none.
//!
//! - Adds write their full content on both create and update.
//! - Removes write only `deleted_at` on update, so content stored by an
//!   earlier add survives. A remove that arrives first still creates the row
//!   (keyed the same way) so the later add lands on a tombstoned row.
//! - Every reference to another entity (author, target account, parent cast,
//!   embedded cast, mention) becomes a [`Stub`].

mod op;

pub use op::{Fields, Key, Relation, Retraction, StoreOp, Stub, Table, Value};

use hubmirror_core::{
    CastAddBody, CastId, CastRemoveBody, LinkBody, Message, MessageBody, ReactionBody,
    UserDataBody, VerificationAddBody, VerificationRemoveBody,
};

/// Link type recorded when the protocol string is empty.
pub const LINK_TYPE_NONE: &str = "none";

/// Map a message to its storage operations.
pub fn normalize(message: &Message) -> Vec<StoreOp> {
    match &message.body {
        MessageBody::CastAdd(body) => vec![cast_add_op(message, body)],
        MessageBody::CastRemove(body) => vec![cast_remove_op(message, body)],
        MessageBody::ReactionAdd(body) => vec![reaction_op(message, body, false)],
        MessageBody::ReactionRemove(body) => vec![reaction_op(message, body, true)],
        MessageBody::LinkAdd(body) => vec![link_op(message, body, false)],
        MessageBody::LinkRemove(body) => vec![link_op(message, body, true)],
        MessageBody::VerificationAdd(body) => vec![verification_add_op(message, body)],
        MessageBody::VerificationRemove(body) => vec![verification_remove_op(message, body)],
        MessageBody::UserDataAdd(body) => user_data_ops(message, body),
        MessageBody::Unsupported(_) => Vec::new(),
    }
}

fn cast_stubs(cast: &CastId) -> [Stub; 2] {
    [
        Stub::Account { fid: cast.fid },
        Stub::Cast {
            hash: cast.hash.clone(),
            fid: cast.fid,
        },
    ]
}

fn json_array<T: serde::Serialize>(items: &[T]) -> Value {
    // Serializing plain strings and integers can't fail.
    Value::Text(serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string()))
}

fn cast_add_op(message: &Message, body: &CastAddBody) -> StoreOp {
    let embedded_urls: Vec<&str> = body
        .embeds
        .iter()
        .filter_map(|e| e.url.as_deref())
        .filter(|url| !url.is_empty())
        .collect();
    let embedded_casts: Vec<&CastId> = body.embeds.iter().filter_map(|e| e.cast_id.as_ref()).collect();
    let parent = body.parent_cast_id.as_ref();

    let fields: Fields = vec![
        ("fid", message.fid.into()),
        ("timestamp", message.timestamp.into()),
        ("text", body.text.as_str().into()),
        ("type", body.cast_type.as_str().into()),
        ("parent_hash", parent.map(|p| p.hash.clone()).into()),
        ("parent_fid", parent.map(|p| p.fid).into()),
        ("parent_url", body.parent_url.clone().into()),
        ("embedded_urls", json_array(embedded_urls.as_slice())),
        ("mentions_positions", json_array(body.mentions_positions.as_slice())),
    ];

    let mut stubs = vec![Stub::Account { fid: message.fid }];
    stubs.extend(parent.into_iter().flat_map(cast_stubs));
    stubs.extend(embedded_casts.iter().flat_map(|c| cast_stubs(c)));

    let mut relations: Vec<Relation> = embedded_casts
        .iter()
        .map(|c| Relation::CastEmbed {
            cast_hash: message.hash.clone(),
            embedded_hash: c.hash.clone(),
        })
        .collect();

    for (ordinal, &fid) in body.mentions.iter().enumerate() {
        if fid == 0 {
            continue;
        }
        stubs.push(Stub::Account { fid });
        relations.push(Relation::CastMention {
            cast_hash: message.hash.clone(),
            ordinal: ordinal as i64,
            fid,
            position: body.mentions_positions.get(ordinal).map(|&p| i64::from(p)),
        });
    }

    StoreOp::upsert(Table::Casts, Key::Hash(message.hash.clone()), fields)
        .with_stubs(stubs)
        .with_relations(relations)
}

fn cast_remove_op(message: &Message, body: &CastRemoveBody) -> StoreOp {
    StoreOp::tombstone(
        Table::Casts,
        Key::Hash(body.target_hash.clone()),
        vec![
            ("fid", message.fid.into()),
            ("timestamp", message.timestamp.into()),
        ],
        message.timestamp,
    )
    .with_stubs([Stub::Account { fid: message.fid }])
}

fn reaction_op(message: &Message, body: &ReactionBody, remove: bool) -> StoreOp {
    let target = body.target_cast_id.as_ref();
    let reaction_type = body.reaction_type.as_str();

    let fields: Fields = vec![
        ("fid", message.fid.into()),
        ("timestamp", message.timestamp.into()),
        ("type", reaction_type.into()),
        ("target_hash", target.map(|t| t.hash.clone()).into()),
        ("target_fid", target.map(|t| t.fid).into()),
        ("target_url", body.target_url.clone().into()),
    ];

    let mut stubs = vec![Stub::Account { fid: message.fid }];
    stubs.extend(target.into_iter().flat_map(cast_stubs));

    let natural_key = Retraction {
        table: Table::Reactions,
        matches: vec![
            ("fid", message.fid.into()),
            ("type", reaction_type.into()),
            ("target_hash", target.map(|t| t.hash.clone()).into()),
            ("target_url", body.target_url.clone().into()),
        ],
        at: message.timestamp,
    };
    superseding(Table::Reactions, message, fields, natural_key, remove).with_stubs(stubs)
}

fn link_op(message: &Message, body: &LinkBody, remove: bool) -> StoreOp {
    let link_type = if body.link_type.is_empty() {
        LINK_TYPE_NONE
    } else {
        body.link_type.as_str()
    };

    let display_timestamp = body
        .display_timestamp
        .and_then(|ts| hubmirror_core::from_farcaster_time(ts).ok());

    let fields: Fields = vec![
        ("fid", message.fid.into()),
        ("timestamp", message.timestamp.into()),
        ("type", link_type.into()),
        ("target_fid", body.target_fid.into()),
        ("display_timestamp", display_timestamp.into()),
    ];

    let mut stubs = vec![Stub::Account { fid: message.fid }];
    stubs.extend(body.target_fid.map(|fid| Stub::Account { fid }));

    let natural_key = Retraction {
        table: Table::Links,
        matches: vec![
            ("fid", message.fid.into()),
            ("type", link_type.into()),
            ("target_fid", body.target_fid.into()),
        ],
        at: message.timestamp,
    };
    superseding(Table::Links, message, fields, natural_key, remove).with_stubs(stubs)
}

fn verification_key(message: &Message, address: &str) -> Retraction {
    Retraction {
        table: Table::Verifications,
        matches: vec![("fid", message.fid.into()), ("address", address.into())],
        at: message.timestamp,
    }
}

fn verification_add_op(message: &Message, body: &VerificationAddBody) -> StoreOp {
    let fields: Fields = vec![
        ("fid", message.fid.into()),
        ("timestamp", message.timestamp.into()),
        ("address", body.address.as_str().into()),
        ("claim_signature", body.claim_signature.as_str().into()),
        ("block_hash", body.block_hash.as_str().into()),
        ("protocol", body.protocol.as_str().into()),
    ];
    let natural_key = verification_key(message, &body.address);
    superseding(Table::Verifications, message, fields, natural_key, false)
        .with_stubs([Stub::Account { fid: message.fid }])
}

fn verification_remove_op(message: &Message, body: &VerificationRemoveBody) -> StoreOp {
    let fields: Fields = vec![
        ("fid", message.fid.into()),
        ("timestamp", message.timestamp.into()),
        ("address", body.address.as_str().into()),
        ("protocol", body.protocol.as_str().into()),
    ];
    let natural_key = verification_key(message, &body.address);
    superseding(Table::Verifications, message, fields, natural_key, true)
        .with_stubs([Stub::Account { fid: message.fid }])
}

/// Add/remove pair keyed by message hash and matched by `natural_key`.
///
/// A remove tombstones older live rows of its key; an add picks up the
/// tombstone of a newer remove that was stored before it. Either arrival
/// order ends in the same rows.
fn superseding(
    table: Table,
    message: &Message,
    fields: Fields,
    natural_key: Retraction,
    remove: bool,
) -> StoreOp {
    let key = Key::Hash(message.hash.clone());
    if remove {
        StoreOp::tombstone(table, key, fields, message.timestamp).with_retraction(natural_key)
    } else {
        StoreOp::upsert(table, key, fields).with_inherited_tombstone(natural_key)
    }
}

fn user_data_ops(message: &Message, body: &UserDataBody) -> Vec<StoreOp> {
    let mut ops = Vec::with_capacity(2);

    if let Some(column) = body.user_data_type.account_field() {
        ops.push(StoreOp::upsert(
            Table::Accounts,
            Key::Fid(message.fid),
            vec![(column, body.value.as_str().into())],
        ));
    }

    ops.push(
        StoreOp::upsert(
            Table::ProfileUpdates,
            Key::Hash(message.hash.clone()),
            vec![
                ("fid", message.fid.into()),
                ("timestamp", message.timestamp.into()),
                ("type", body.user_data_type.code().into()),
                ("value", body.value.as_str().into()),
            ],
        )
        .with_stubs([Stub::Account { fid: message.fid }]),
    );

    ops
}
