//! Conversation operations.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{fmt_ts, opt_ts_column, ts_column};
use crate::domain::{Conversation, ConversationId, ConversationRollup, MergeCandidate, ThreadLinkId};
use crate::storage::database::Result;

const SELECT_COLUMNS: &str = r#"
    SELECT id, participant_hash, thread_link_id, is_archived, is_pinned, is_muted,
           unread_count, message_count, snippet, last_message_at, created_at
    FROM conversations
"#;

/// Finds the conversation for an identity key.
///
/// If duplicates exist, the oldest wins so lookups stay deterministic until
/// a merge pass collapses them.
pub fn find_by_hash(conn: &Connection, participant_hash: &str) -> Result<Option<Conversation>> {
    let sql = format!(
        "{SELECT_COLUMNS} WHERE participant_hash = ?1 ORDER BY created_at ASC, id ASC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, [participant_hash], row_to_conversation)
        .optional()?)
}

/// Retrieves a conversation by id.
pub fn get(conn: &Connection, id: &ConversationId) -> Result<Option<Conversation>> {
    let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
    Ok(conn.query_row(&sql, [&id.0], row_to_conversation).optional()?)
}

/// Retrieves every conversation, oldest first.
pub fn get_all(conn: &Connection) -> Result<Vec<Conversation>> {
    let sql = format!("{SELECT_COLUMNS} ORDER BY created_at ASC, id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], row_to_conversation)?;
    let conversations: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(conversations?)
}

/// Inserts a new conversation.
pub fn insert(conn: &Connection, conversation: &Conversation) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO conversations (
            id, participant_hash, thread_link_id, is_archived, is_pinned, is_muted,
            unread_count, message_count, snippet, last_message_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            conversation.id.0,
            conversation.participant_hash,
            conversation.thread_link_id.as_ref().map(|t| &t.0),
            conversation.is_archived as i32,
            conversation.is_pinned as i32,
            conversation.is_muted as i32,
            conversation.unread_count,
            conversation.message_count,
            conversation.snippet,
            conversation.last_message_at.as_ref().map(fmt_ts),
            fmt_ts(&conversation.created_at),
        ],
    )?;
    Ok(())
}

/// Links participants to a conversation. Existing links are kept.
pub fn add_participants(conn: &Connection, id: &ConversationId, emails: &[String]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO conversation_participants (conversation_id, person_email) VALUES (?1, ?2)",
    )?;
    for email in emails {
        stmt.execute(params![id.0, email])?;
    }
    Ok(())
}

/// Unlinks participants from a conversation.
pub fn remove_participants(
    conn: &Connection,
    id: &ConversationId,
    emails: &[String],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "DELETE FROM conversation_participants WHERE conversation_id = ?1 AND person_email = ?2",
    )?;
    for email in emails {
        stmt.execute(params![id.0, email])?;
    }
    Ok(())
}

/// Participant emails of a conversation, sorted.
pub fn participants(conn: &Connection, id: &ConversationId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT person_email FROM conversation_participants WHERE conversation_id = ?1 ORDER BY person_email",
    )?;
    let rows = stmt.query_map([&id.0], |row| row.get(0))?;
    let emails: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(emails?)
}

/// Thread linkage of the oldest owned message.
pub fn first_thread_link(conn: &Connection, id: &ConversationId) -> Result<Option<ThreadLinkId>> {
    Ok(conn
        .query_row(
            "SELECT thread_link_id FROM messages WHERE conversation_id = ?1 ORDER BY date ASC, id ASC LIMIT 1",
            [&id.0],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(ThreadLinkId))
}

/// Rewrites the identity key.
pub fn set_participant_hash(
    conn: &Connection,
    id: &ConversationId,
    participant_hash: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET participant_hash = ?2 WHERE id = ?1",
        params![id.0, participant_hash],
    )?;
    Ok(())
}

/// Computes rollup values from the owned messages.
pub fn compute_rollup(conn: &Connection, id: &ConversationId) -> Result<ConversationRollup> {
    let (message_count, unread_count, inbox_count, last_message_at) = conn.query_row(
        r#"
        SELECT COUNT(*),
               COALESCE(SUM(CASE WHEN is_unread = 1 AND is_in_inbox = 1 THEN 1 ELSE 0 END), 0),
               COALESCE(SUM(is_in_inbox), 0),
               MAX(date)
        FROM messages WHERE conversation_id = ?1
        "#,
        [&id.0],
        |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
                opt_ts_column(row, 3)?,
            ))
        },
    )?;

    let latest = conn
        .query_row(
            r#"
            SELECT snippet, subject, is_newsletter FROM messages
            WHERE conversation_id = ?1
            ORDER BY date DESC, id DESC LIMIT 1
            "#,
            [&id.0],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i32>(2)? != 0,
                ))
            },
        )
        .optional()?;

    let snippet = latest.and_then(|(snippet, subject, is_newsletter)| {
        let text = if is_newsletter {
            subject.filter(|s| !s.trim().is_empty()).unwrap_or(snippet)
        } else {
            snippet
        };
        Some(text).filter(|t| !t.is_empty())
    });

    Ok(ConversationRollup {
        message_count,
        unread_count,
        snippet,
        last_message_at,
        is_archived: inbox_count == 0,
    })
}

/// Stores recomputed rollup values.
pub fn apply_rollup(conn: &Connection, id: &ConversationId, rollup: &ConversationRollup) -> Result<()> {
    conn.execute(
        r#"
        UPDATE conversations SET
            message_count = ?2, unread_count = ?3, snippet = ?4,
            last_message_at = ?5, is_archived = ?6
        WHERE id = ?1
        "#,
        params![
            id.0,
            rollup.message_count,
            rollup.unread_count,
            rollup.snippet,
            rollup.last_message_at.as_ref().map(fmt_ts),
            rollup.is_archived as i32,
        ],
    )?;
    Ok(())
}

/// Merge ranking data for a conversation.
pub fn merge_candidate(conn: &Connection, id: &ConversationId) -> Result<Option<MergeCandidate>> {
    Ok(conn
        .query_row(
            r#"
            SELECT c.id, c.created_at,
                   (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id)
            FROM conversations c WHERE c.id = ?1
            "#,
            [&id.0],
            |row| {
                Ok(MergeCandidate {
                    id: ConversationId(row.get(0)?),
                    created_at: ts_column(row, 1)?,
                    message_count: row.get(2)?,
                })
            },
        )
        .optional()?)
}

/// Moves every message and participant of `loser` onto `winner` and deletes
/// `loser`. User flags carry over.
pub fn absorb(conn: &Connection, winner: &ConversationId, loser: &ConversationId) -> Result<u32> {
    let moved = conn.execute(
        "UPDATE messages SET conversation_id = ?1 WHERE conversation_id = ?2",
        params![winner.0, loser.0],
    )?;
    conn.execute(
        r#"
        INSERT OR IGNORE INTO conversation_participants (conversation_id, person_email)
        SELECT ?1, person_email FROM conversation_participants WHERE conversation_id = ?2
        "#,
        params![winner.0, loser.0],
    )?;
    conn.execute(
        r#"
        UPDATE conversations SET
            is_pinned = MAX(is_pinned, (SELECT is_pinned FROM conversations WHERE id = ?2)),
            is_muted = MAX(is_muted, (SELECT is_muted FROM conversations WHERE id = ?2))
        WHERE id = ?1
        "#,
        params![winner.0, loser.0],
    )?;
    delete(conn, loser)?;
    Ok(moved as u32)
}

/// Deletes a conversation; participant links cascade.
pub fn delete(conn: &Connection, id: &ConversationId) -> Result<()> {
    conn.execute("DELETE FROM conversations WHERE id = ?1", [&id.0])?;
    Ok(())
}

/// Counts conversations.
pub fn count(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?)
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(row.get(0)?),
        participant_hash: row.get(1)?,
        thread_link_id: row.get::<_, Option<String>>(2)?.map(ThreadLinkId),
        is_archived: row.get::<_, i32>(3)? != 0,
        is_pinned: row.get::<_, i32>(4)? != 0,
        is_muted: row.get::<_, i32>(5)? != 0,
        unread_count: row.get(6)?,
        message_count: row.get(7)?,
        snippet: row.get(8)?,
        last_message_at: opt_ts_column(row, 9)?,
        created_at: ts_column(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::{Duration, Utc};

    fn new_conversation(id: &str, hash: &str, age_days: i64) -> Conversation {
        Conversation {
            id: ConversationId::from(id),
            participant_hash: hash.to_string(),
            thread_link_id: None,
            is_archived: false,
            is_pinned: false,
            is_muted: false,
            unread_count: 0,
            message_count: 0,
            snippet: None,
            last_message_at: None,
            created_at: Utc::now() - Duration::days(age_days),
        }
    }

    fn insert_message(
        conn: &Connection,
        id: &str,
        conversation: &str,
        minutes_ago: i64,
        unread: bool,
        inbox: bool,
    ) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO messages (id, conversation_id, thread_link_id, date, subject, snippet,
                                  sender_email, is_unread, is_in_inbox, is_newsletter)
            VALUES (?1, ?2, 't', ?3, 'Subject ' || ?1, 'Snippet ' || ?1, 'a@x.io', ?4, ?5, 0)
            "#,
            params![
                id,
                conversation,
                fmt_ts(&(Utc::now() - Duration::minutes(minutes_ago))),
                unread as i32,
                inbox as i32
            ],
        )?;
        Ok(())
    }

    #[tokio::test]
    async fn find_by_hash_prefers_oldest() {
        let db = Database::open_in_memory().await.unwrap();

        let found = db
            .with_conn(|conn| {
                insert(conn, &new_conversation("young", "h1", 1))?;
                insert(conn, &new_conversation("old", "h1", 5))?;
                find_by_hash(conn, "h1")
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(found.id.0, "old");
    }

    #[tokio::test]
    async fn rollup_counts_unread_in_inbox_only() {
        let db = Database::open_in_memory().await.unwrap();

        let rollup = db
            .with_conn(|conn| {
                insert(conn, &new_conversation("c1", "h1", 1))?;
                insert_message(conn, "m1", "c1", 30, true, true)?;
                insert_message(conn, "m2", "c1", 20, true, false)?;
                insert_message(conn, "m3", "c1", 10, false, true)?;
                compute_rollup(conn, &ConversationId::from("c1"))
            })
            .await
            .unwrap();

        assert_eq!(rollup.message_count, 3);
        assert_eq!(rollup.unread_count, 1);
        assert_eq!(rollup.snippet.as_deref(), Some("Snippet m3"));
        assert!(!rollup.is_archived);
    }

    #[tokio::test]
    async fn rollup_of_archived_newsletter_uses_subject() {
        let db = Database::open_in_memory().await.unwrap();

        let rollup = db
            .with_conn(|conn| {
                insert(conn, &new_conversation("c1", "h1", 1))?;
                insert_message(conn, "m1", "c1", 5, true, false)?;
                conn.execute("UPDATE messages SET is_newsletter = 1", [])?;
                compute_rollup(conn, &ConversationId::from("c1"))
            })
            .await
            .unwrap();

        assert_eq!(rollup.unread_count, 0);
        assert_eq!(rollup.snippet.as_deref(), Some("Subject m1"));
        assert!(rollup.is_archived);
    }

    #[tokio::test]
    async fn absorb_moves_messages_and_participants() {
        let db = Database::open_in_memory().await.unwrap();

        let (moved, participants, loser) = db
            .with_conn(|conn| {
                insert(conn, &new_conversation("a", "h", 1))?;
                insert(conn, &new_conversation("b", "h", 2))?;
                conn.execute_batch(
                    "INSERT INTO people (email) VALUES ('x@x.io'), ('y@x.io'), ('z@x.io')",
                )?;
                add_participants(conn, &"a".into(), &["x@x.io".into(), "y@x.io".into()])?;
                add_participants(conn, &"b".into(), &["y@x.io".into(), "z@x.io".into()])?;
                insert_message(conn, "m1", "a", 1, false, true)?;
                insert_message(conn, "m2", "a", 2, false, true)?;
                conn.execute("UPDATE conversations SET is_pinned = 1 WHERE id = 'a'", [])?;

                let moved = absorb(conn, &"b".into(), &"a".into())?;
                Ok((
                    moved,
                    participants(conn, &"b".into())?,
                    get(conn, &"a".into())?,
                ))
            })
            .await
            .unwrap();

        assert_eq!(moved, 2);
        assert_eq!(participants, vec!["x@x.io", "y@x.io", "z@x.io"]);
        assert!(loser.is_none());

        let winner = db
            .with_conn(|conn| get(conn, &"b".into()))
            .await
            .unwrap()
            .unwrap();
        assert!(winner.is_pinned);
    }
}
