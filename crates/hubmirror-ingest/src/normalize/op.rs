//! Storage-operation descriptors.
//!
//! A [`StoreOp`] says what one message means for the store without saying how
//! the store writes it: an upsert keyed by hash (or account id), the
//! placeholder rows that must exist first, relation rows to attach, and the
//! rows sharing its natural key that it retracts (removes) or inherits a
//! tombstone from (adds).

use chrono::{DateTime, Utc};

/// Tables a descriptor can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Accounts,
    Casts,
    Reactions,
    Links,
    Verifications,
    ProfileUpdates,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::Casts => "casts",
            Self::Reactions => "reactions",
            Self::Links => "links",
            Self::Verifications => "verifications",
            Self::ProfileUpdates => "profile_updates",
        }
    }

    /// Column holding the idempotency key.
    pub fn key_column(self) -> &'static str {
        match self {
            Self::Accounts => "fid",
            _ => "hash",
        }
    }
}

/// Idempotency key of the target row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Hash(String),
    Fid(u64),
}

impl Key {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Hash(hash) => Value::Text(hash.clone()),
            Self::Fid(fid) => Value::from(*fid),
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hash(hash) => f.write_str(hash),
            Self::Fid(fid) => write!(f, "fid {}", fid),
        }
    }
}

/// A column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    /// Stored as second-precision RFC 3339 text (`2021-01-01T00:00:00Z`),
    /// which sorts chronologically.
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Timestamp rendering used for storage and comparisons.
    pub fn timestamp_text(ts: &DateTime<Utc>) -> String {
        ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // Account ids and protocol timestamps fit comfortably in i64.
        Self::Integer(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Ordered `(column, value)` pairs.
pub type Fields = Vec<(&'static str, Value)>;

/// A placeholder row created if absent and left alone if present.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stub {
    Account { fid: u64 },
    Cast { hash: String, fid: u64 },
}

/// A row in a relation table attached to the descriptor's target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    /// A cast embedding another cast.
    CastEmbed {
        cast_hash: String,
        embedded_hash: String,
    },
    /// A cast mentioning an account, in mention order.
    CastMention {
        cast_hash: String,
        ordinal: i64,
        fid: u64,
        position: Option<i64>,
    },
}

/// Tombstone live rows of `table` that match every `(column, value)` pair and
/// are not newer than `at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retraction {
    pub table: Table,
    pub matches: Fields,
    pub at: DateTime<Utc>,
}

/// Idempotent storage operation derived from one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOp {
    pub table: Table,
    pub key: Key,
    /// Columns written when the row doesn't exist yet.
    pub create: Fields,
    /// Columns overwritten when it does. Empty means leave the row alone.
    pub update: Fields,
    /// Referenced rows to materialize first. Accounts sort before casts so a
    /// cast stub always finds its author.
    pub ensure_exists: Vec<Stub>,
    pub relations: Vec<Relation>,
    pub retraction: Option<Retraction>,
    /// For adds: rows of the same natural key tombstoned at or after `at`
    /// by a remove that arrived first. The target row takes the earliest
    /// such `deleted_at`.
    pub inherit_tombstone: Option<Retraction>,
}

impl StoreOp {
    /// Full-content upsert: the same fields on create and update.
    pub fn upsert(table: Table, key: Key, fields: Fields) -> Self {
        Self {
            table,
            key,
            update: fields.clone(),
            create: fields,
            ensure_exists: Vec::new(),
            relations: Vec::new(),
            retraction: None,
            inherit_tombstone: None,
        }
    }

    /// Tombstone: create with `fields` plus `deleted_at`, update only `deleted_at`.
    pub fn tombstone(table: Table, key: Key, mut fields: Fields, at: DateTime<Utc>) -> Self {
        fields.push(("deleted_at", Value::Timestamp(at)));
        Self {
            table,
            key,
            create: fields,
            update: vec![("deleted_at", Value::Timestamp(at))],
            ensure_exists: Vec::new(),
            relations: Vec::new(),
            retraction: None,
            inherit_tombstone: None,
        }
    }

    pub fn with_stubs(mut self, stubs: impl IntoIterator<Item = Stub>) -> Self {
        self.ensure_exists.extend(stubs);
        self.ensure_exists.sort();
        self.ensure_exists.dedup();
        self
    }

    pub fn with_relations(mut self, relations: Vec<Relation>) -> Self {
        self.relations = relations;
        self
    }

    pub fn with_retraction(mut self, retraction: Retraction) -> Self {
        self.retraction = Some(retraction);
        self
    }

    pub fn with_inherited_tombstone(mut self, natural_key: Retraction) -> Self {
        self.inherit_tombstone = Some(natural_key);
        self
    }

    /// Value of `column` in the create set.
    pub fn created(&self, column: &str) -> Option<&Value> {
        self.create
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn test_table_key_columns() {
        assert_eq!(Table::Accounts.key_column(), "fid");
        assert_eq!(Table::Casts.key_column(), "hash");
        assert_eq!(Table::ProfileUpdates.name(), "profile_updates");
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = Value::timestamp_text(&ts(1_609_459_200));
        let late = Value::timestamp_text(&ts(1_700_000_000));
        assert_eq!(early, "2021-01-01T00:00:00Z");
        assert!(early < late);
    }

    #[test]
    fn test_upsert_create_equals_update() {
        let op = StoreOp::upsert(
            Table::Casts,
            Key::Hash("0xabc".into()),
            vec![("text", "hello".into())],
        );
        assert_eq!(op.create, op.update);
        assert_eq!(op.created("text"), Some(&Value::Text("hello".into())));
    }

    #[test]
    fn test_tombstone_updates_only_deleted_at() {
        let op = StoreOp::tombstone(
            Table::Links,
            Key::Hash("0x01".into()),
            vec![("fid", 7u64.into())],
            ts(10),
        );
        assert_eq!(op.update, vec![("deleted_at", Value::Timestamp(ts(10)))]);
        assert_eq!(op.create.len(), 2);
    }

    #[test]
    fn test_stubs_deduplicated_accounts_first() {
        let op = StoreOp::upsert(Table::Reactions, Key::Hash("0x01".into()), Vec::new())
            .with_stubs([
                Stub::Cast {
                    hash: "0xabc".into(),
                    fid: 42,
                },
                Stub::Account { fid: 42 },
                Stub::Account { fid: 7 },
                Stub::Account { fid: 42 },
            ]);
        assert_eq!(
            op.ensure_exists,
            vec![
                Stub::Account { fid: 7 },
                Stub::Account { fid: 42 },
                Stub::Cast {
                    hash: "0xabc".into(),
                    fid: 42
                },
            ]
        );
    }

    #[test]
    fn test_option_value() {
        assert_eq!(Value::from(None::<String>), Value::Null);
        assert_eq!(Value::from(Some(5u64)), Value::Integer(5));
    }
}
