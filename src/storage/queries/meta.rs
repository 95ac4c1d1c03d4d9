//! Key/value sync state.
//!
//! Failure counters, the failed-id list, migration flags and the reconcile
//! timestamp all live here so they commit with the pass that changed them.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use super::{fmt_ts, parse_ts};
use crate::storage::database::Result;

/// Consecutive failed passes.
pub const CONSECUTIVE_FAILURES: &str = "consecutive_failures";
/// Cumulative failed message ids, oldest first.
pub const FAILED_IDS: &str = "failed_ids";
/// Set once conversations carry the archive flag derived from inbox membership.
pub const ARCHIVE_MODEL_MIGRATED: &str = "archive_model_migrated";
/// Account address set the last alias fix-up ran against.
pub const ALIAS_SIGNATURE: &str = "alias_signature";
/// Last reconciler sweep.
pub const LAST_RECONCILE_AT: &str = "last_reconcile_at";

/// Reads a raw value.
pub fn get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM sync_meta WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

/// Writes a raw value.
pub fn set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        params![key, value, fmt_ts(&Utc::now())],
    )?;
    Ok(())
}

/// Reads a JSON value, or `None` if unset.
pub fn get_json<T: DeserializeOwned>(conn: &Connection, key: &str) -> Result<Option<T>> {
    match get(conn, key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Writes a JSON value.
pub fn set_json<T: Serialize>(conn: &Connection, key: &str, value: &T) -> Result<()> {
    set(conn, key, &serde_json::to_string(value)?)
}

/// Reads a counter, defaulting to zero.
pub fn get_u32(conn: &Connection, key: &str) -> Result<u32> {
    Ok(get(conn, key)?
        .and_then(|v| v.parse().ok())
        .unwrap_or_default())
}

/// Reads a boolean flag, defaulting to false.
pub fn get_flag(conn: &Connection, key: &str) -> Result<bool> {
    Ok(get(conn, key)?.as_deref() == Some("1"))
}

/// Sets a boolean flag.
pub fn set_flag(conn: &Connection, key: &str, value: bool) -> Result<()> {
    set(conn, key, if value { "1" } else { "0" })
}

/// Reads a timestamp.
pub fn get_ts(conn: &Connection, key: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(get(conn, key)?.as_deref().and_then(parse_ts))
}

/// Writes a timestamp.
pub fn set_ts(conn: &Connection, key: &str, value: &DateTime<Utc>) -> Result<()> {
    set(conn, key, &fmt_ts(value))
}
