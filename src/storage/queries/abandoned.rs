//! Abandoned message records.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{fmt_ts, ts_column};
use crate::domain::{AbandonedSyncMessage, MessageId};
use crate::storage::database::Result;

/// Records an abandoned id. An existing record keeps its retry count.
pub fn upsert(conn: &Connection, id: &MessageId, reason: &str, at: &DateTime<Utc>) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO abandoned_messages (message_id, reason, abandoned_at, retry_count)
        VALUES (?1, ?2, ?3, 0)
        ON CONFLICT(message_id) DO UPDATE SET
            reason = excluded.reason,
            abandoned_at = excluded.abandoned_at
        "#,
        params![id.0, reason, fmt_ts(at)],
    )?;
    Ok(())
}

/// Bumps the retry count after a failed out-of-band retry.
pub fn record_retry_failure(conn: &Connection, id: &MessageId, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE abandoned_messages SET retry_count = retry_count + 1, reason = ?2 WHERE message_id = ?1",
        params![id.0, reason],
    )?;
    Ok(())
}

/// Removes a record once the message has been synced.
pub fn remove(conn: &Connection, id: &MessageId) -> Result<()> {
    conn.execute(
        "DELETE FROM abandoned_messages WHERE message_id = ?1",
        [&id.0],
    )?;
    Ok(())
}

/// Lists records, most recently abandoned first.
pub fn list(conn: &Connection) -> Result<Vec<AbandonedSyncMessage>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT message_id, reason, abandoned_at, retry_count
        FROM abandoned_messages
        ORDER BY abandoned_at DESC, message_id
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(AbandonedSyncMessage {
            message_id: MessageId(row.get(0)?),
            reason: row.get(1)?,
            abandoned_at: ts_column(row, 2)?,
            retry_count: row.get(3)?,
        })
    })?;
    let records: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(records?)
}

/// Counts records.
pub fn count(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("SELECT COUNT(*) FROM abandoned_messages", [], |row| {
        row.get(0)
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    #[tokio::test]
    async fn retry_count_survives_reabandon() {
        let db = Database::open_in_memory().await.unwrap();
        let id = MessageId::from("m1");

        let records = db
            .with_conn(move |conn| {
                upsert(conn, &id, "not found", &Utc::now())?;
                record_retry_failure(conn, &id, "still not found")?;
                upsert(conn, &id, "timeout", &Utc::now())?;
                list(conn)
            })
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].retry_count, 1);
        assert_eq!(records[0].reason, "timeout");
    }

    #[tokio::test]
    async fn remove_and_count() {
        let db = Database::open_in_memory().await.unwrap();

        let count_after = db
            .with_conn(|conn| {
                upsert(conn, &MessageId::from("a"), "x", &Utc::now())?;
                upsert(conn, &MessageId::from("b"), "x", &Utc::now())?;
                remove(conn, &MessageId::from("a"))?;
                count(conn)
            })
            .await
            .unwrap();

        assert_eq!(count_after, 1);
    }
}
