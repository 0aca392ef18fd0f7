//! SQLite schema for the hub mirror.
//!
//! Every message-derived table is keyed by the message hash. Rows are never
//! deleted; removes set `deleted_at`. Timestamps are RFC 3339 text.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when making breaking changes.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema.
///
/// Creates all tables if they don't exist. Safe to call on every open.
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version < SCHEMA_VERSION {
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Get the current schema version (0 if not initialized).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Accounts: stubbed on first reference, profile folded in from user data
        CREATE TABLE IF NOT EXISTS accounts (
            fid INTEGER PRIMARY KEY,
            fname TEXT,
            display_name TEXT,
            pfp_url TEXT,
            bio TEXT,
            url TEXT,
            has_backfilled INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS casts (
            hash TEXT PRIMARY KEY,
            fid INTEGER NOT NULL REFERENCES accounts(fid),
            timestamp TEXT,
            text TEXT,
            type TEXT,
            parent_hash TEXT REFERENCES casts(hash),
            parent_fid INTEGER,
            parent_url TEXT,
            embedded_urls TEXT,
            mentions_positions TEXT,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS cast_embeds (
            cast_hash TEXT NOT NULL REFERENCES casts(hash),
            embedded_hash TEXT NOT NULL REFERENCES casts(hash),
            PRIMARY KEY (cast_hash, embedded_hash)
        );

        CREATE TABLE IF NOT EXISTS cast_mentions (
            cast_hash TEXT NOT NULL REFERENCES casts(hash),
            ordinal INTEGER NOT NULL,
            fid INTEGER NOT NULL REFERENCES accounts(fid),
            position INTEGER,
            PRIMARY KEY (cast_hash, ordinal)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            hash TEXT PRIMARY KEY,
            fid INTEGER NOT NULL REFERENCES accounts(fid),
            timestamp TEXT NOT NULL,
            type TEXT NOT NULL,
            target_hash TEXT REFERENCES casts(hash),
            target_fid INTEGER,
            target_url TEXT,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS links (
            hash TEXT PRIMARY KEY,
            fid INTEGER NOT NULL REFERENCES accounts(fid),
            timestamp TEXT NOT NULL,
            type TEXT NOT NULL,
            target_fid INTEGER REFERENCES accounts(fid),
            display_timestamp TEXT,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS verifications (
            hash TEXT PRIMARY KEY,
            fid INTEGER NOT NULL REFERENCES accounts(fid),
            timestamp TEXT NOT NULL,
            address TEXT NOT NULL,
            claim_signature TEXT,
            block_hash TEXT,
            protocol TEXT NOT NULL,
            deleted_at TEXT
        );

        -- Raw log of profile changes, independent of the folded account row
        CREATE TABLE IF NOT EXISTS profile_updates (
            hash TEXT PRIMARY KEY,
            fid INTEGER NOT NULL REFERENCES accounts(fid),
            timestamp TEXT NOT NULL,
            type INTEGER NOT NULL,
            value TEXT NOT NULL
        );

        -- Live subscription resume point, one per hub
        CREATE TABLE IF NOT EXISTS subscription_cursors (
            source_url TEXT PRIMARY KEY,
            last_event_id INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_casts_fid ON casts(fid);
        CREATE INDEX IF NOT EXISTS idx_casts_parent ON casts(parent_hash);
        CREATE INDEX IF NOT EXISTS idx_reactions_target ON reactions(target_hash);
        CREATE INDEX IF NOT EXISTS idx_reactions_fid_type ON reactions(fid, type);
        CREATE INDEX IF NOT EXISTS idx_links_fid_type ON links(fid, type, target_fid);
        CREATE INDEX IF NOT EXISTS idx_verifications_fid ON verifications(fid, address);
        CREATE INDEX IF NOT EXISTS idx_accounts_backfilled ON accounts(has_backfilled);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_init_schema_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for table in [
            "accounts",
            "casts",
            "cast_embeds",
            "cast_mentions",
            "reactions",
            "links",
            "verifications",
            "profile_updates",
            "subscription_cursors",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
