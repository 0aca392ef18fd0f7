//! SQLite implementation of [`Store`].

use super::rows::{AccountRow, CastRow, LinkRow, MentionRow, ReactionRow, VerificationRow};
use super::schema::init_schema;
use super::{Store, StoreError, StoreResult};
use crate::error::Result;
use crate::normalize::{Relation, Retraction, StoreOp, Stub, Table, Value};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction, params, params_from_iter};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Timestamp(ts) => ToSqlOutput::Owned(SqlValue::Text(Value::timestamp_text(ts))),
        })
    }
}

/// SQLite-backed mirror store.
///
/// One connection behind a mutex; writers from every pipeline stage queue on
/// it, and `busy_timeout` covers other processes holding the file.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(StoreError::from)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(StoreError::from)?;

        tracing::info!("Opened mirror database at {}", path.display());
        Ok(Self::with_connection(conn)?)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn account(&self, fid: u64) -> StoreResult<Option<AccountRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT fid, fname, display_name, pfp_url, bio, url, has_backfilled
                 FROM accounts WHERE fid = ?1",
                [fid as i64],
                |row| {
                    Ok(AccountRow {
                        fid: row.get::<_, i64>(0)? as u64,
                        fname: row.get(1)?,
                        display_name: row.get(2)?,
                        pfp_url: row.get(3)?,
                        bio: row.get(4)?,
                        url: row.get(5)?,
                        has_backfilled: row.get::<_, i64>(6)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn cast(&self, hash: &str) -> StoreResult<Option<CastRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT hash, fid, timestamp, text, type, parent_hash, parent_url,
                        embedded_urls, deleted_at
                 FROM casts WHERE hash = ?1",
                [hash],
                |row| {
                    Ok(CastRow {
                        hash: row.get(0)?,
                        fid: row.get::<_, i64>(1)? as u64,
                        timestamp: row.get(2)?,
                        text: row.get(3)?,
                        cast_type: row.get(4)?,
                        parent_hash: row.get(5)?,
                        parent_url: row.get(6)?,
                        embedded_urls: row.get(7)?,
                        deleted_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn reaction(&self, hash: &str) -> StoreResult<Option<ReactionRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT hash, fid, timestamp, type, target_hash, target_url, deleted_at
                 FROM reactions WHERE hash = ?1",
                [hash],
                |row| {
                    Ok(ReactionRow {
                        hash: row.get(0)?,
                        fid: row.get::<_, i64>(1)? as u64,
                        timestamp: row.get(2)?,
                        reaction_type: row.get(3)?,
                        target_hash: row.get(4)?,
                        target_url: row.get(5)?,
                        deleted_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn link(&self, hash: &str) -> StoreResult<Option<LinkRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT hash, fid, timestamp, type, target_fid, deleted_at
                 FROM links WHERE hash = ?1",
                [hash],
                |row| {
                    Ok(LinkRow {
                        hash: row.get(0)?,
                        fid: row.get::<_, i64>(1)? as u64,
                        timestamp: row.get(2)?,
                        link_type: row.get(3)?,
                        target_fid: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                        deleted_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn verification(&self, hash: &str) -> StoreResult<Option<VerificationRow>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT hash, fid, address, claim_signature, block_hash, protocol, deleted_at
                 FROM verifications WHERE hash = ?1",
                [hash],
                |row| {
                    Ok(VerificationRow {
                        hash: row.get(0)?,
                        fid: row.get::<_, i64>(1)? as u64,
                        address: row.get(2)?,
                        claim_signature: row.get(3)?,
                        block_hash: row.get(4)?,
                        protocol: row.get(5)?,
                        deleted_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Hashes of the casts embedded in `cast_hash`.
    pub fn embedded_casts(&self, cast_hash: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT embedded_hash FROM cast_embeds WHERE cast_hash = ?1 ORDER BY embedded_hash",
        )?;
        let hashes = stmt
            .query_map([cast_hash], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(hashes)
    }

    /// Accounts mentioned in `cast_hash`, in mention order.
    pub fn mentions(&self, cast_hash: &str) -> StoreResult<Vec<MentionRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT ordinal, fid, position FROM cast_mentions
             WHERE cast_hash = ?1 ORDER BY ordinal",
        )?;
        let mentions = stmt
            .query_map([cast_hash], |row| {
                Ok(MentionRow {
                    ordinal: row.get(0)?,
                    fid: row.get::<_, i64>(1)? as u64,
                    position: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(mentions)
    }

    /// Number of rows in a table, tombstoned ones included.
    pub fn count_rows(&self, table: Table) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", table.name()),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// =============================================================================
// Writes
// =============================================================================

fn upsert_sql(op: &StoreOp) -> String {
    let key_column = op.table.key_column();
    let columns: Vec<&str> = std::iter::once(key_column)
        .chain(op.create.iter().map(|(c, _)| *c))
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

    let on_conflict = if op.update.is_empty() {
        "DO NOTHING".to_string()
    } else {
        let assignments: Vec<String> = op
            .update
            .iter()
            .enumerate()
            .map(|(i, (c, _))| format!("{} = ?{}", c, columns.len() + i + 1))
            .collect();
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
        op.table.name(),
        columns.join(", "),
        placeholders.join(", "),
        key_column,
        on_conflict
    )
}

fn insert_relation(tx: &Transaction<'_>, relation: &Relation) -> rusqlite::Result<()> {
    match relation {
        Relation::CastEmbed {
            cast_hash,
            embedded_hash,
        } => {
            tx.execute(
                "INSERT INTO cast_embeds (cast_hash, embedded_hash) VALUES (?1, ?2)
                 ON CONFLICT DO NOTHING",
                params![cast_hash, embedded_hash],
            )?;
        }
        Relation::CastMention {
            cast_hash,
            ordinal,
            fid,
            position,
        } => {
            tx.execute(
                "INSERT INTO cast_mentions (cast_hash, ordinal, fid, position)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(cast_hash, ordinal) DO UPDATE SET
                    fid = excluded.fid,
                    position = excluded.position",
                params![cast_hash, ordinal, *fid as i64, position],
            )?;
        }
    }
    Ok(())
}

fn apply_retraction(tx: &Transaction<'_>, retraction: &Retraction) -> rusqlite::Result<usize> {
    let at = Value::Timestamp(retraction.at);
    let sql = format!(
        "UPDATE {} SET deleted_at = ?1
         WHERE deleted_at IS NULL AND timestamp <= ?1{}",
        retraction.table.name(),
        match_conditions(&retraction.matches, 2)
    );

    let values = std::iter::once(&at).chain(retraction.matches.iter().map(|(_, v)| v));
    tx.execute(&sql, params_from_iter(values))
}

fn match_conditions(matches: &[(&'static str, Value)], first: usize) -> String {
    matches
        .iter()
        .enumerate()
        .map(|(i, (c, _))| format!(" AND {} IS ?{}", c, i + first))
        .collect()
}

/// Give the target row the earliest tombstone of a matching row that is not
/// older than `natural_key.at`.
fn inherit_tombstone(
    tx: &Transaction<'_>,
    table: Table,
    key: &Value,
    natural_key: &Retraction,
) -> rusqlite::Result<usize> {
    let at = Value::Timestamp(natural_key.at);
    let sql = format!(
        "UPDATE {table} SET deleted_at = (
             SELECT MIN(deleted_at) FROM {table}
             WHERE deleted_at IS NOT NULL AND timestamp >= ?1{conditions}
         )
         WHERE {key_column} = ?2 AND deleted_at IS NULL AND EXISTS (
             SELECT 1 FROM {table}
             WHERE deleted_at IS NOT NULL AND timestamp >= ?1{conditions}
         )",
        table = table.name(),
        key_column = table.key_column(),
        conditions = match_conditions(&natural_key.matches, 3),
    );

    let values = [&at, key]
        .into_iter()
        .chain(natural_key.matches.iter().map(|(_, v)| v));
    tx.execute(&sql, params_from_iter(values))
}

impl Store for SqliteStore {
    fn ensure_stub(&self, stub: &Stub) -> StoreResult<()> {
        let conn = self.conn.lock();
        match stub {
            Stub::Account { fid } => {
                conn.execute(
                    "INSERT INTO accounts (fid) VALUES (?1) ON CONFLICT(fid) DO NOTHING",
                    [*fid as i64],
                )?;
            }
            Stub::Cast { hash, fid } => {
                conn.execute(
                    "INSERT INTO casts (hash, fid) VALUES (?1, ?2) ON CONFLICT(hash) DO NOTHING",
                    params![hash, *fid as i64],
                )?;
            }
        }
        Ok(())
    }

    fn upsert(&self, op: &StoreOp) -> StoreResult<()> {
        let sql = upsert_sql(op);
        let key = op.key.to_value();
        let values = std::iter::once(&key)
            .chain(op.create.iter().map(|(_, v)| v))
            .chain(op.update.iter().map(|(_, v)| v));

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(&sql, params_from_iter(values))?;

        for relation in &op.relations {
            insert_relation(&tx, relation)?;
        }
        if let Some(retraction) = &op.retraction {
            let retracted = apply_retraction(&tx, retraction)?;
            if retracted > 0 {
                tracing::debug!(
                    "Retracted {} {} row(s) superseded by {}",
                    retracted,
                    retraction.table.name(),
                    op.key
                );
            }
        }
        if let Some(natural_key) = &op.inherit_tombstone
            && inherit_tombstone(&tx, op.table, &key, natural_key)? > 0
        {
            tracing::debug!(
                "{} {} superseded by an earlier-stored remove",
                op.table.name(),
                op.key
            );
        }

        tx.commit()?;
        Ok(())
    }

    fn backfilled_accounts(&self) -> StoreResult<HashSet<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT fid FROM accounts WHERE has_backfilled = 1")?;
        let fids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|fid| fid as u64))
            .collect::<rusqlite::Result<HashSet<u64>>>()?;
        Ok(fids)
    }

    fn mark_backfilled(&self, fid: u64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO accounts (fid, has_backfilled) VALUES (?1, 1)
             ON CONFLICT(fid) DO UPDATE SET has_backfilled = 1",
            [fid as i64],
        )?;
        Ok(())
    }

    fn load_cursor(&self, source_url: &str) -> StoreResult<Option<u64>> {
        let conn = self.conn.lock();
        let id: Option<i64> = conn
            .query_row(
                "SELECT last_event_id FROM subscription_cursors WHERE source_url = ?1",
                [source_url],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(|v| v as u64))
    }

    fn commit_cursor(&self, source_url: &str, event_id: u64) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscription_cursors (source_url, last_event_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source_url) DO UPDATE SET
                last_event_id = MAX(last_event_id, excluded.last_event_id),
                updated_at = excluded.updated_at",
            params![source_url, event_id as i64, now],
        )?;
        Ok(())
    }
}
