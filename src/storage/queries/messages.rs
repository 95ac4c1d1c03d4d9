//! Message operations.
//!
//! The label set is the source of truth; `is_unread` and `is_in_inbox` are
//! projections rewritten whenever labels are written through [`write_labels`].

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{fmt_ts, opt_ts_column, placeholders, ts_column, MAX_IN_PARAMS};
use crate::domain::{
    system_labels, Address, Attachment, ConversationId, LabelId, Message, MessageId,
    MessageLabelState, ParticipantRole, ThreadLinkId,
};
use crate::storage::database::Result;

/// Returns the subset of `ids` stored locally, in one query per chunk.
pub fn existing_ids(conn: &Connection, ids: &[MessageId]) -> Result<HashSet<MessageId>> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(MAX_IN_PARAMS) {
        let sql = format!(
            "SELECT id FROM messages WHERE id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| &id.0)), |row| {
            row.get::<_, String>(0)
        })?;
        for id in rows {
            found.insert(MessageId(id?));
        }
    }
    Ok(found)
}

/// Loads the mutable label state of every stored message in `ids`.
///
/// Missing ids are simply absent from the map.
pub fn label_states(
    conn: &Connection,
    ids: &[MessageId],
) -> Result<HashMap<MessageId, MessageLabelState>> {
    let mut states = HashMap::new();
    for chunk in ids.chunks(MAX_IN_PARAMS) {
        let marks = placeholders(chunk.len());

        let sql = format!(
            "SELECT id, conversation_id, local_modified_at FROM messages WHERE id IN ({marks})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| &id.0)), |row| {
            Ok(MessageLabelState {
                id: MessageId(row.get(0)?),
                conversation_id: ConversationId(row.get(1)?),
                labels: BTreeSet::new(),
                local_modified_at: opt_ts_column(row, 2)?,
            })
        })?;
        for state in rows {
            let state = state?;
            states.insert(state.id.clone(), state);
        }

        let sql =
            format!("SELECT message_id, label_id FROM message_labels WHERE message_id IN ({marks})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter().map(|id| &id.0)), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for pair in rows {
            let (message_id, label_id) = pair?;
            if let Some(state) = states.get_mut(&MessageId(message_id)) {
                state.labels.insert(LabelId(label_id));
            }
        }
    }
    Ok(states)
}

/// Retrieves a message with its label set.
pub fn get(conn: &Connection, id: &MessageId) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            r#"
            SELECT id, conversation_id, thread_link_id, date, subject, snippet,
                   sender_email, sender_name, is_unread, is_in_inbox, is_newsletter,
                   local_modified_at
            FROM messages WHERE id = ?1
            "#,
            [&id.0],
            row_to_message,
        )
        .optional()?;

    match message {
        Some(mut message) => {
            message.labels = labels_of(conn, id)?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

/// Lists messages owned by a conversation, oldest first.
pub fn by_conversation(conn: &Connection, conversation_id: &ConversationId) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, conversation_id, thread_link_id, date, subject, snippet,
               sender_email, sender_name, is_unread, is_in_inbox, is_newsletter,
               local_modified_at
        FROM messages WHERE conversation_id = ?1
        ORDER BY date ASC, id ASC
        "#,
    )?;
    let rows = stmt.query_map([&conversation_id.0], row_to_message)?;
    let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;
    for message in &mut messages {
        message.labels = labels_of(conn, &message.id)?;
    }
    Ok(messages)
}

/// Returns the owning conversation of a message.
pub fn conversation_of(conn: &Connection, id: &MessageId) -> Result<Option<ConversationId>> {
    Ok(conn
        .query_row(
            "SELECT conversation_id FROM messages WHERE id = ?1",
            [&id.0],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(ConversationId))
}

/// Inserts a new message row and its labels.
pub fn insert(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO messages (
            id, conversation_id, thread_link_id, date, subject, snippet,
            sender_email, sender_name, is_newsletter, local_modified_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
        params![
            message.id.0,
            message.conversation_id.0,
            message.thread_link_id.0,
            fmt_ts(&message.date),
            message.subject,
            message.snippet,
            message.sender.email,
            message.sender.name,
            message.is_newsletter as i32,
            message.local_modified_at.as_ref().map(fmt_ts),
        ],
    )?;
    write_labels(conn, &message.id, &message.labels)
}

/// Overwrites the remote-owned content fields of an existing message.
///
/// Ownership, labels and the local edit marker are left alone.
pub fn update_content(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        r#"
        UPDATE messages SET
            thread_link_id = ?2, date = ?3, subject = ?4, snippet = ?5,
            sender_email = ?6, sender_name = ?7, is_newsletter = ?8
        WHERE id = ?1
        "#,
        params![
            message.id.0,
            message.thread_link_id.0,
            fmt_ts(&message.date),
            message.subject,
            message.snippet,
            message.sender.email,
            message.sender.name,
            message.is_newsletter as i32,
        ],
    )?;
    Ok(())
}

/// Replaces the label set and rewrites the projections.
pub fn write_labels(conn: &Connection, id: &MessageId, labels: &BTreeSet<LabelId>) -> Result<()> {
    conn.execute("DELETE FROM message_labels WHERE message_id = ?1", [&id.0])?;
    let mut stmt =
        conn.prepare("INSERT INTO message_labels (message_id, label_id) VALUES (?1, ?2)")?;
    for label in labels {
        stmt.execute(params![id.0, label.0])?;
    }
    conn.execute(
        "UPDATE messages SET is_unread = ?2, is_in_inbox = ?3 WHERE id = ?1",
        params![
            id.0,
            labels.contains(&system_labels::unread()) as i32,
            labels.contains(&system_labels::inbox()) as i32,
        ],
    )?;
    Ok(())
}

/// Sets or clears the pending local edit marker.
pub fn set_local_modified(
    conn: &Connection,
    id: &MessageId,
    at: Option<&DateTime<Utc>>,
) -> Result<()> {
    conn.execute(
        "UPDATE messages SET local_modified_at = ?2 WHERE id = ?1",
        params![id.0, at.map(fmt_ts)],
    )?;
    Ok(())
}

/// Applies a user edit: changes labels and marks the message as locally
/// modified so remote state does not clobber it until it is confirmed or
/// goes stale.
pub fn apply_local_edit(
    conn: &Connection,
    id: &MessageId,
    add: &[LabelId],
    remove: &[LabelId],
    at: &DateTime<Utc>,
) -> Result<Option<ConversationId>> {
    let Some(conversation_id) = conversation_of(conn, id)? else {
        return Ok(None);
    };
    let mut labels = labels_of(conn, id)?;
    labels.extend(add.iter().cloned());
    for label in remove {
        labels.remove(label);
    }
    write_labels(conn, id, &labels)?;
    set_local_modified(conn, id, Some(at))?;
    Ok(Some(conversation_id))
}

/// Replaces the participant links of a message.
pub fn replace_participants(
    conn: &Connection,
    id: &MessageId,
    participants: &[(String, ParticipantRole)],
) -> Result<()> {
    conn.execute(
        "DELETE FROM message_participants WHERE message_id = ?1",
        [&id.0],
    )?;
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO message_participants (message_id, person_email, role) VALUES (?1, ?2, ?3)",
    )?;
    for (email, role) in participants {
        stmt.execute(params![id.0, email, role.as_str()])?;
    }
    Ok(())
}

/// Replaces the attachment metadata of a message.
pub fn replace_attachments(
    conn: &Connection,
    id: &MessageId,
    attachments: &[Attachment],
) -> Result<()> {
    conn.execute("DELETE FROM attachments WHERE message_id = ?1", [&id.0])?;
    let mut stmt = conn.prepare(
        r#"
        INSERT OR REPLACE INTO attachments
            (message_id, part_id, filename, mime_type, size_bytes, remote_attachment_id)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )?;
    for attachment in attachments {
        stmt.execute(params![
            id.0,
            attachment.part_id,
            attachment.filename,
            attachment.mime_type,
            attachment.size_bytes as i64,
            attachment.remote_attachment_id,
        ])?;
    }
    Ok(())
}

/// Lists attachment metadata of a message.
pub fn attachments_of(conn: &Connection, id: &MessageId) -> Result<Vec<Attachment>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT part_id, filename, mime_type, size_bytes, remote_attachment_id
        FROM attachments WHERE message_id = ?1 ORDER BY part_id
        "#,
    )?;
    let rows = stmt.query_map([&id.0], |row| {
        Ok(Attachment {
            part_id: row.get(0)?,
            filename: row.get(1)?,
            mime_type: row.get(2)?,
            size_bytes: row.get::<_, i64>(3)? as u64,
            remote_attachment_id: row.get(4)?,
        })
    })?;
    let attachments: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(attachments?)
}

/// Lists participant emails of a message with their roles.
pub fn participants_of(conn: &Connection, id: &MessageId) -> Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT person_email, role FROM message_participants WHERE message_id = ?1 ORDER BY role, person_email",
    )?;
    let rows = stmt.query_map([&id.0], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let participants: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(participants?)
}

/// Deletes a message and its links. Returns the former owner, if it existed.
pub fn delete(conn: &Connection, id: &MessageId) -> Result<Option<ConversationId>> {
    let owner = conversation_of(conn, id)?;
    if owner.is_some() {
        conn.execute("DELETE FROM messages WHERE id = ?1", [&id.0])?;
    }
    Ok(owner)
}

/// Most recent local message ids, newest first.
pub fn recent_ids(conn: &Connection, limit: usize) -> Result<Vec<MessageId>> {
    let mut stmt = conn.prepare("SELECT id FROM messages ORDER BY date DESC, id LIMIT ?1")?;
    let rows = stmt.query_map([limit as i64], |row| row.get::<_, String>(0))?;
    let ids: std::result::Result<Vec<_>, _> = rows.collect();
    Ok(ids?.into_iter().map(MessageId).collect())
}

/// Counts stored messages.
pub fn count(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
}

fn labels_of(conn: &Connection, id: &MessageId) -> Result<BTreeSet<LabelId>> {
    let mut stmt = conn.prepare("SELECT label_id FROM message_labels WHERE message_id = ?1")?;
    let rows = stmt.query_map([&id.0], |row| row.get::<_, String>(0))?;
    let mut labels = BTreeSet::new();
    for label in rows {
        labels.insert(LabelId(label?));
    }
    Ok(labels)
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get(0)?),
        conversation_id: ConversationId(row.get(1)?),
        thread_link_id: ThreadLinkId(row.get(2)?),
        date: ts_column(row, 3)?,
        subject: row.get(4)?,
        snippet: row.get(5)?,
        sender: Address {
            email: row.get(6)?,
            name: row.get(7)?,
        },
        is_unread: row.get::<_, i32>(8)? != 0,
        is_in_inbox: row.get::<_, i32>(9)? != 0,
        is_newsletter: row.get::<_, i32>(10)? != 0,
        labels: BTreeSet::new(),
        local_modified_at: opt_ts_column(row, 11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use pretty_assertions::assert_eq;

    fn conversation(conn: &Connection, id: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO conversations (id, participant_hash, created_at) VALUES (?1, ?1, '2024-01-01T00:00:00.000Z')",
            [id],
        )?;
        Ok(())
    }

    fn message(id: &str, conversation_id: &str, labels: &[&str]) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from(conversation_id),
            thread_link_id: ThreadLinkId::from("t1"),
            date: Utc::now(),
            subject: Some("Hello".into()),
            snippet: "hi".into(),
            sender: Address::new("ann@example.com"),
            is_unread: false,
            is_in_inbox: false,
            is_newsletter: false,
            labels: labels.iter().map(|l| LabelId::from(*l)).collect(),
            local_modified_at: None,
        }
    }

    #[tokio::test]
    async fn insert_projects_system_labels() {
        let db = Database::open_in_memory().await.unwrap();

        let stored = db
            .with_conn(|conn| {
                conversation(conn, "c1")?;
                insert(conn, &message("m1", "c1", &["INBOX", "UNREAD", "Label_1"]))?;
                get(conn, &MessageId::from("m1"))
            })
            .await
            .unwrap()
            .unwrap();

        assert!(stored.is_unread);
        assert!(stored.is_in_inbox);
        assert_eq!(stored.labels.len(), 3);
    }

    #[tokio::test]
    async fn label_states_are_batched_and_skip_missing() {
        let db = Database::open_in_memory().await.unwrap();

        let states = db
            .with_conn(|conn| {
                conversation(conn, "c1")?;
                insert(conn, &message("m1", "c1", &["INBOX"]))?;
                insert(conn, &message("m2", "c1", &[]))?;
                label_states(
                    conn,
                    &[
                        MessageId::from("m1"),
                        MessageId::from("m2"),
                        MessageId::from("missing"),
                    ],
                )
            })
            .await
            .unwrap();

        assert_eq!(states.len(), 2);
        assert!(states[&MessageId::from("m1")]
            .labels
            .contains(&LabelId::from("INBOX")));
        assert!(states[&MessageId::from("m2")].labels.is_empty());
    }

    #[tokio::test]
    async fn local_edit_marks_message() {
        let db = Database::open_in_memory().await.unwrap();
        let now = Utc::now();

        let (owner, stored) = db
            .with_conn(move |conn| {
                conversation(conn, "c1")?;
                insert(conn, &message("m1", "c1", &["INBOX", "UNREAD"]))?;
                let owner = apply_local_edit(
                    conn,
                    &MessageId::from("m1"),
                    &[],
                    &[LabelId::from("UNREAD")],
                    &now,
                )?;
                Ok((owner, get(conn, &MessageId::from("m1"))?))
            })
            .await
            .unwrap();

        let stored = stored.unwrap();
        assert_eq!(owner, Some(ConversationId::from("c1")));
        assert!(!stored.is_unread);
        assert!(stored.is_in_inbox);
        assert_eq!(
            stored.local_modified_at.map(|t| t.timestamp_millis()),
            Some(now.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn delete_cascades_links() {
        let db = Database::open_in_memory().await.unwrap();

        let (owner, labels_left, again) = db
            .with_conn(|conn| {
                conversation(conn, "c1")?;
                insert(conn, &message("m1", "c1", &["INBOX"]))?;
                let owner = delete(conn, &MessageId::from("m1"))?;
                let labels_left: i64 =
                    conn.query_row("SELECT COUNT(*) FROM message_labels", [], |r| r.get(0))?;
                let again = delete(conn, &MessageId::from("m1"))?;
                Ok((owner, labels_left, again))
            })
            .await
            .unwrap();

        assert_eq!(owner, Some(ConversationId::from("c1")));
        assert_eq!(labels_left, 0);
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn existing_ids_chunks_large_inputs() {
        let db = Database::open_in_memory().await.unwrap();

        let found = db
            .with_conn(|conn| {
                conversation(conn, "c1")?;
                insert(conn, &message("m7", "c1", &[]))?;
                let ids: Vec<MessageId> = (0..1200)
                    .map(|i| MessageId(format!("m{}", i)))
                    .collect();
                existing_ids(conn, &ids)
            })
            .await
            .unwrap();

        assert_eq!(found, HashSet::from([MessageId::from("m7")]));
    }
}
