//! SQL schema definitions as const strings.
//!
//! Contains the complete SQLite schema of the local mailbox mirror.

/// SQL to create the account singleton.
pub const CREATE_ACCOUNT: &str = r#"
CREATE TABLE IF NOT EXISTS account (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    email TEXT NOT NULL,
    aliases_json TEXT NOT NULL DEFAULT '[]',
    history_id INTEGER,
    last_successful_sync TEXT,
    installed_at TEXT,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the labels table.
pub const CREATE_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS labels (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_system INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the people table.
pub const CREATE_PEOPLE: &str = r#"
CREATE TABLE IF NOT EXISTS people (
    email TEXT PRIMARY KEY,
    display_name TEXT
)
"#;

/// SQL to create the conversations table.
pub const CREATE_CONVERSATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    participant_hash TEXT NOT NULL,
    thread_link_id TEXT,
    is_archived INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    is_muted INTEGER NOT NULL DEFAULT 0,
    unread_count INTEGER NOT NULL DEFAULT 0,
    message_count INTEGER NOT NULL DEFAULT 0,
    snippet TEXT,
    last_message_at TEXT,
    created_at TEXT NOT NULL
)
"#;

/// SQL to create conversation indexes.
pub const CREATE_CONVERSATION_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_conversations_hash ON conversations(participant_hash);
CREATE INDEX IF NOT EXISTS idx_conversations_last ON conversations(last_message_at DESC)
"#;

/// SQL to create the conversation participant links.
pub const CREATE_CONVERSATION_PARTICIPANTS: &str = r#"
CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    person_email TEXT NOT NULL REFERENCES people(email),
    PRIMARY KEY (conversation_id, person_email)
)
"#;

/// SQL to create the messages table.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    thread_link_id TEXT NOT NULL,
    date TEXT NOT NULL,
    subject TEXT,
    snippet TEXT NOT NULL DEFAULT '',
    sender_email TEXT NOT NULL,
    sender_name TEXT,
    is_unread INTEGER NOT NULL DEFAULT 0,
    is_in_inbox INTEGER NOT NULL DEFAULT 0,
    is_newsletter INTEGER NOT NULL DEFAULT 0,
    local_modified_at TEXT
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date DESC)
"#;

/// SQL to create the message label links.
pub const CREATE_MESSAGE_LABELS: &str = r#"
CREATE TABLE IF NOT EXISTS message_labels (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    label_id TEXT NOT NULL,
    PRIMARY KEY (message_id, label_id)
)
"#;

/// SQL to create the message participant links.
pub const CREATE_MESSAGE_PARTICIPANTS: &str = r#"
CREATE TABLE IF NOT EXISTS message_participants (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    person_email TEXT NOT NULL REFERENCES people(email),
    role TEXT NOT NULL,
    PRIMARY KEY (message_id, person_email, role)
)
"#;

/// SQL to create the attachments table.
pub const CREATE_ATTACHMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    part_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    remote_attachment_id TEXT,
    PRIMARY KEY (message_id, part_id)
)
"#;

/// SQL to create the abandoned message records.
pub const CREATE_ABANDONED_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS abandoned_messages (
    message_id TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    abandoned_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the sync key/value state.
pub const CREATE_SYNC_META: &str = r#"
CREATE TABLE IF NOT EXISTS sync_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// Returns all migrations in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_ACCOUNT,
        CREATE_LABELS,
        CREATE_PEOPLE,
        CREATE_CONVERSATIONS,
        CREATE_CONVERSATION_INDEXES,
        CREATE_CONVERSATION_PARTICIPANTS,
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_MESSAGE_LABELS,
        CREATE_MESSAGE_PARTICIPANTS,
        CREATE_ATTACHMENTS,
        CREATE_ABANDONED_MESSAGES,
        CREATE_SYNC_META,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_parents_before_children() {
        let migrations = all_migrations();
        let position = |sql: &str| migrations.iter().position(|m| *m == sql).unwrap();

        assert!(position(CREATE_CONVERSATIONS) < position(CREATE_MESSAGES));
        assert!(position(CREATE_MESSAGES) < position(CREATE_MESSAGE_LABELS));
        assert!(position(CREATE_PEOPLE) < position(CREATE_CONVERSATION_PARTICIPANTS));
    }

    #[test]
    fn child_links_cascade() {
        for sql in [
            CREATE_CONVERSATION_PARTICIPANTS,
            CREATE_MESSAGE_LABELS,
            CREATE_MESSAGE_PARTICIPANTS,
            CREATE_ATTACHMENTS,
        ] {
            assert!(sql.contains("ON DELETE CASCADE"));
        }
    }

    #[test]
    fn statements_are_idempotent() {
        for sql in all_migrations() {
            assert!(sql.contains("IF NOT EXISTS"));
        }
    }
}
