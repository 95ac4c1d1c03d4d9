//! Account singleton operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{fmt_ts, opt_ts_column};
use crate::domain::{Account, HistoryCursor};
use crate::storage::database::{DatabaseError, Result};

/// Loads the account, if one has been stored.
pub fn get(conn: &Connection) -> Result<Option<Account>> {
    let row = conn
        .query_row(
            r#"
            SELECT email, aliases_json, history_id, last_successful_sync, installed_at
            FROM account WHERE id = 1
            "#,
            [],
            row_to_account,
        )
        .optional()?;

    match row {
        Some((mut account, aliases_json)) => {
            account.aliases = serde_json::from_str(&aliases_json)?;
            Ok(Some(account))
        }
        None => Ok(None),
    }
}

/// Stores the account identity. The cursor and install time are untouched.
pub fn save_identity(conn: &Connection, email: &str, aliases: &[String]) -> Result<()> {
    let aliases_json = serde_json::to_string(aliases)?;
    conn.execute(
        r#"
        INSERT INTO account (id, email, aliases_json, updated_at)
        VALUES (1, ?1, ?2, ?3)
        ON CONFLICT(id) DO UPDATE SET
            email = excluded.email,
            aliases_json = excluded.aliases_json,
            updated_at = excluded.updated_at
        "#,
        params![email, aliases_json, fmt_ts(&Utc::now())],
    )?;
    Ok(())
}

/// Records the install time. Only the first recorded value is kept.
pub fn record_install(conn: &Connection, installed_at: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE account SET installed_at = COALESCE(installed_at, ?1) WHERE id = 1",
        [fmt_ts(installed_at)],
    )?;
    Ok(())
}

/// Moves the cursor forward and stamps the successful sync.
///
/// The stored value becomes `max(stored, cursor)`; the effective cursor is
/// returned.
pub fn advance_cursor(
    conn: &Connection,
    cursor: HistoryCursor,
    synced_at: &DateTime<Utc>,
) -> Result<HistoryCursor> {
    let value = i64::try_from(cursor.0)
        .map_err(|_| DatabaseError::OutOfRange(format!("history cursor {}", cursor)))?;
    let stamp = fmt_ts(synced_at);
    let updated = conn.execute(
        r#"
        UPDATE account SET
            history_id = MAX(COALESCE(history_id, 0), ?1),
            last_successful_sync = ?2,
            updated_at = ?2
        WHERE id = 1
        "#,
        params![value, stamp],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound("account".to_string()));
    }

    let stored = conn.query_row("SELECT history_id FROM account WHERE id = 1", [], |row| {
        cursor_column(row, 0)
    })?;
    stored.ok_or_else(|| DatabaseError::NotFound("history cursor".to_string()))
}

fn cursor_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<HistoryCursor>> {
    let raw: Option<i64> = row.get(idx)?;
    raw.map(|id| {
        u64::try_from(id)
            .map(HistoryCursor)
            .map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, id))
    })
    .transpose()
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<(Account, String)> {
    Ok((
        Account {
            email: row.get(0)?,
            aliases: Vec::new(),
            history_cursor: cursor_column(row, 2)?,
            last_successful_sync: opt_ts_column(row, 3)?,
            installed_at: opt_ts_column(row, 4)?,
        },
        row.get(1)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::Duration;

    #[tokio::test]
    async fn identity_roundtrip_keeps_first_install_time() {
        let db = Database::open_in_memory().await.unwrap();
        let first = Utc::now() - Duration::days(3);

        let account = db
            .with_conn(move |conn| {
                save_identity(conn, "me@example.com", &["alias@example.com".into()])?;
                record_install(conn, &first)?;
                save_identity(conn, "me@example.com", &[])?;
                record_install(conn, &Utc::now())?;
                get(conn)
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(account.email, "me@example.com");
        assert!(account.aliases.is_empty());
        assert_eq!(account.history_cursor, None);
        assert_eq!(
            account.installed_at.map(|t| t.timestamp_millis()),
            Some(first.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let db = Database::open_in_memory().await.unwrap();

        let (a, b, c) = db
            .with_conn(|conn| {
                save_identity(conn, "me@example.com", &[])?;
                let a = advance_cursor(conn, HistoryCursor(100), &Utc::now())?;
                let b = advance_cursor(conn, HistoryCursor(40), &Utc::now())?;
                let c = advance_cursor(conn, HistoryCursor(150), &Utc::now())?;
                Ok((a, b, c))
            })
            .await
            .unwrap();

        assert_eq!(a, HistoryCursor(100));
        assert_eq!(b, HistoryCursor(100));
        assert_eq!(c, HistoryCursor(150));
    }

    #[tokio::test]
    async fn advance_without_account_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let result = db
            .with_conn(|conn| advance_cursor(conn, HistoryCursor(1), &Utc::now()))
            .await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }

    #[tokio::test]
    async fn cursor_beyond_sqlite_range_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();

        let (rejected, stored) = db
            .with_conn(|conn| {
                save_identity(conn, "me@example.com", &[])?;
                advance_cursor(conn, HistoryCursor(500), &Utc::now())?;
                let rejected = advance_cursor(conn, HistoryCursor(u64::MAX), &Utc::now());
                Ok((rejected, get(conn)?))
            })
            .await
            .unwrap();

        assert!(matches!(rejected, Err(DatabaseError::OutOfRange(_))));
        assert_eq!(stored.unwrap().history_cursor, Some(HistoryCursor(500)));
    }
}
