//! Versioned SQLite schema.
//!
//! Each entry of [`MIGRATIONS`] moves the schema up by one version and is
//! recorded in `schema_migrations` once applied.

use rusqlite::{params, Connection, Transaction};

use crate::error::{Result, StoreError};

/// Schema steps, oldest first. Version N is `MIGRATIONS[N - 1]`.
const MIGRATIONS: &[&str] = &[
    // v1: one ordered key-value table holding every namespace
    r#"
    CREATE TABLE kv (
        key TEXT PRIMARY KEY,             -- namespaced key, e.g. __group/<id>/
        value BLOB NOT NULL,              -- CBOR record
        updated_at INTEGER NOT NULL       -- local write time (Unix ms)
    );
    "#,
];

/// Current schema version.
pub const CURRENT_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring a database up to [`CURRENT_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );",
    )?;

    let found: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    if found > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {found} is newer than supported version {CURRENT_VERSION}"
        )));
    }
    if found == CURRENT_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for version in found + 1..=CURRENT_VERSION {
        step(&tx, version)?;
    }
    tx.commit()?;
    tracing::debug!(from = found, to = CURRENT_VERSION, "migrated sqlite schema");
    Ok(())
}

fn step(tx: &Transaction<'_>, version: u32) -> Result<()> {
    let sql = MIGRATIONS
        .get(version as usize - 1)
        .ok_or_else(|| StoreError::Migration(format!("no migration for version {version}")))?;
    tx.execute_batch(sql)?;
    tx.execute(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        params![version, now_millis()],
    )?;
    Ok(())
}

/// Wall-clock time in Unix milliseconds.
pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}
