//! Message domain types.
//!
//! Represents individual mail messages mirrored from the remote service.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConversationId, LabelId, MessageId, ThreadLinkId};

/// Maximum length of a cleaned preview snippet, in characters.
pub const SNIPPET_MAX_CHARS: usize = 200;

/// A mirrored mail message.
///
/// Created on the first successful upsert of a remote fetch and updated in
/// place afterwards. Owned by exactly one [`Conversation`](super::Conversation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Remote-assigned identifier.
    pub id: MessageId,
    /// Conversation owning this message.
    pub conversation_id: ConversationId,
    /// Remote thread linkage.
    pub thread_link_id: ThreadLinkId,
    /// Date the message was received by the remote service.
    pub date: DateTime<Utc>,
    /// Subject line.
    pub subject: Option<String>,
    /// Cleaned preview text.
    pub snippet: String,
    /// Sender address.
    pub sender: Address,
    /// Projection of the unread label.
    pub is_unread: bool,
    /// Projection of the inbox label.
    pub is_in_inbox: bool,
    /// Whether the sender was classified as a newsletter/bulk sender.
    pub is_newsletter: bool,
    /// Full label set, including the projected system labels.
    pub labels: BTreeSet<LabelId>,
    /// Set whenever a local edit has not yet been confirmed by the remote.
    pub local_modified_at: Option<DateTime<Utc>>,
}

/// Mutable label state of a message, as loaded for delta processing.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageLabelState {
    /// Message identifier.
    pub id: MessageId,
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// Current label set.
    pub labels: BTreeSet<LabelId>,
    /// Pending local edit timestamp.
    pub local_modified_at: Option<DateTime<Utc>>,
}

/// An email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Email address.
    pub email: String,
    /// Display name (e.g., "Jane Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Returns the normalized form of the email, used as identity key.
    pub fn normalized_email(&self) -> String {
        super::normalize_email(&self.email)
    }

    /// Returns the display representation of this address.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Role of a participant on a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Sender.
    From,
    /// Primary recipient.
    To,
    /// Carbon copy recipient.
    Cc,
    /// Blind carbon copy recipient.
    Bcc,
}

impl ParticipantRole {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::To => "to",
            Self::Cc => "cc",
            Self::Bcc => "bcc",
        }
    }
}

/// Attachment metadata. Content is fetched out of band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Part identifier, unique within the message.
    pub part_id: String,
    /// Original filename.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Remote handle used to download the content.
    pub remote_attachment_id: Option<String>,
}

/// Cleans remote preview text for display.
///
/// Decodes the handful of HTML entities the remote emits in snippets,
/// collapses whitespace and truncates to [`SNIPPET_MAX_CHARS`].
pub fn clean_snippet(raw: &str) -> String {
    let decoded = raw
        .replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&");

    let collapsed = decoded.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() > SNIPPET_MAX_CHARS {
        collapsed.chars().take(SNIPPET_MAX_CHARS).collect()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display_with_name() {
        let addr = Address::with_name("test@example.com", "Test User");
        assert_eq!(addr.display(), "Test User <test@example.com>");
    }

    #[test]
    fn address_normalized_email() {
        let addr = Address::new("  Alice@Example.COM ");
        assert_eq!(addr.normalized_email(), "alice@example.com");
    }

    #[test]
    fn clean_snippet_decodes_and_collapses() {
        let cleaned = clean_snippet("Hi  there,\n\n&quot;quoted&quot; &amp; more&#39;s");
        assert_eq!(cleaned, "Hi there, \"quoted\" & more's");
    }

    #[test]
    fn clean_snippet_truncates() {
        let long = "a".repeat(SNIPPET_MAX_CHARS + 50);
        assert_eq!(clean_snippet(&long).chars().count(), SNIPPET_MAX_CHARS);
    }

    #[test]
    fn participant_role_storage_names() {
        assert_eq!(ParticipantRole::From.as_str(), "from");
        assert_eq!(ParticipantRole::Bcc.as_str(), "bcc");
    }
}
