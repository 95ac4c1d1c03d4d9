//! Remote mail service trait definition.
//!
//! This module defines the [`RemoteMailClient`] trait, the RPC boundary the
//! sync engine consumes: message listing/search, per-message fetch, the
//! cursor-based history delta feed, and profile/label/alias metadata.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    system_labels, Address, Alias, Attachment, HistoryCursor, Label, LabelId, MessageId, Profile,
    ThreadLinkId,
};

/// Result type alias for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors surfaced by the remote boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// The call did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Server-side failure.
    #[error("server error ({0})")]
    ServerError(u16),

    /// Authentication failed or credentials expired.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The history cursor is too old for the delta feed.
    #[error("history cursor expired")]
    CursorExpired,

    /// Connection loss, DNS failure and other transport errors.
    #[error("network error: {0}")]
    Network(String),

    /// The remote answered with something we cannot interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Returns true for transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout | Self::ServerError(_) | Self::Network(_)
        )
    }

    /// Server-suggested delay before the next attempt.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(std::time::Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// How much of a message to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    /// Headers, labels, snippet and attachment metadata.
    Full,
    /// Labels and headers only.
    Metadata,
}

impl MessageFormat {
    /// Wire name of the format.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Metadata => "metadata",
        }
    }
}

/// A message as returned by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Remote message id.
    pub id: MessageId,
    /// Remote thread linkage.
    pub thread_id: ThreadLinkId,
    /// Labels currently applied.
    pub label_ids: Vec<LabelId>,
    /// Remote preview text.
    pub snippet: String,
    /// Receive time.
    pub internal_date: DateTime<Utc>,
    /// Sender.
    pub from: Option<Address>,
    /// Primary recipients.
    pub to: Vec<Address>,
    /// Carbon copy recipients.
    pub cc: Vec<Address>,
    /// Blind carbon copy recipients (only visible on sent mail).
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: Option<String>,
    /// Whether a List-Unsubscribe header was present.
    pub list_unsubscribe: bool,
    /// Attachment metadata.
    pub attachments: Vec<Attachment>,
}

impl RemoteMessage {
    /// Returns true if the label is applied.
    pub fn has_label(&self, label: &str) -> bool {
        self.label_ids.iter().any(|l| l.0 == label)
    }

    /// Classifies bulk/newsletter senders.
    pub fn is_newsletter(&self) -> bool {
        if self.list_unsubscribe || self.has_label(system_labels::CATEGORY_PROMOTIONS) {
            return true;
        }
        self.from
            .as_ref()
            .and_then(|a| a.email.split('@').next().map(str::to_lowercase))
            .map(|local| {
                ["noreply", "no-reply", "donotreply", "newsletter", "news", "mailer"]
                    .iter()
                    .any(|p| local == *p || local.starts_with(&format!("{}+", p)))
            })
            .unwrap_or(false)
    }
}

/// A page of message ids from the list/search endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListPage {
    /// Matching ids.
    pub ids: Vec<MessageId>,
    /// Token for the next page, if any.
    pub next_page_token: Option<String>,
}

/// A single change reported by the history feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryRecord {
    /// A message appeared in the mailbox.
    MessageAdded {
        /// Added message.
        message_id: MessageId,
        /// Labels at the time of the addition.
        label_ids: Vec<LabelId>,
    },
    /// A message was permanently deleted.
    MessageDeleted {
        /// Deleted message.
        message_id: MessageId,
    },
    /// Labels were applied to a message.
    LabelsAdded {
        /// Affected message.
        message_id: MessageId,
        /// Applied labels.
        label_ids: Vec<LabelId>,
    },
    /// Labels were removed from a message.
    LabelsRemoved {
        /// Affected message.
        message_id: MessageId,
        /// Removed labels.
        label_ids: Vec<LabelId>,
    },
}

impl HistoryRecord {
    /// The message this record refers to.
    pub fn message_id(&self) -> &MessageId {
        match self {
            Self::MessageAdded { message_id, .. }
            | Self::MessageDeleted { message_id }
            | Self::LabelsAdded { message_id, .. }
            | Self::LabelsRemoved { message_id, .. } => message_id,
        }
    }
}

/// A page of the history feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    /// Records in remote order.
    pub records: Vec<HistoryRecord>,
    /// Cursor of the mailbox as of this page.
    pub cursor: HistoryCursor,
    /// Token for the next page, if any.
    pub next_page_token: Option<String>,
}

/// Trait for the remote mail service.
///
/// All methods are async and return [`Result`] so callers can classify
/// failures with [`RemoteError::is_retryable`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteMailClient: Send + Sync {
    /// Lists message ids matching a search query.
    async fn list_messages(&self, query: &str, page_token: Option<String>)
        -> Result<MessageListPage>;

    /// Fetches a single message.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::NotFound`] if the message no longer exists.
    async fn get_message(&self, id: &MessageId, format: MessageFormat) -> Result<RemoteMessage>;

    /// Lists history records after `start`.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CursorExpired`] when `start` is too old.
    async fn list_history(
        &self,
        start: HistoryCursor,
        page_token: Option<String>,
    ) -> Result<HistoryPage>;

    /// Fetches the account profile and its current cursor.
    async fn get_profile(&self) -> Result<Profile>;

    /// Fetches all labels.
    async fn list_labels(&self) -> Result<Vec<Label>>;

    /// Fetches the send-as aliases.
    async fn list_aliases(&self) -> Result<Vec<Alias>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message_from(email: &str) -> RemoteMessage {
        RemoteMessage {
            id: MessageId::from("m1"),
            thread_id: ThreadLinkId::from("t1"),
            label_ids: vec![LabelId::from("INBOX")],
            snippet: String::new(),
            internal_date: Utc::now(),
            from: Some(Address::new(email)),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: None,
            list_unsubscribe: false,
            attachments: vec![],
        }
    }

    #[test]
    fn retryable_classification() {
        assert!(RemoteError::Timeout.is_retryable());
        assert!(RemoteError::ServerError(503).is_retryable());
        assert!(RemoteError::Network("dns".into()).is_retryable());
        assert!(RemoteError::RateLimited {
            retry_after_secs: None
        }
        .is_retryable());

        assert!(!RemoteError::Authentication("expired".into()).is_retryable());
        assert!(!RemoteError::NotFound("m1".into()).is_retryable());
        assert!(!RemoteError::CursorExpired.is_retryable());
        assert!(!RemoteError::InvalidResponse("bad json".into()).is_retryable());
    }

    #[test]
    fn retry_after_only_for_rate_limits() {
        let limited = RemoteError::RateLimited {
            retry_after_secs: Some(7),
        };
        assert_eq!(limited.retry_after(), Some(std::time::Duration::from_secs(7)));
        assert_eq!(RemoteError::Timeout.retry_after(), None);
    }

    #[test]
    fn newsletter_classification() {
        assert!(message_from("noreply@shop.example").is_newsletter());
        assert!(message_from("news+weekly@paper.example").is_newsletter());
        assert!(!message_from("alice@example.com").is_newsletter());

        let mut unsub = message_from("alice@example.com");
        unsub.list_unsubscribe = true;
        assert!(unsub.is_newsletter());
    }

    #[test]
    fn history_record_message_id() {
        let record = HistoryRecord::LabelsRemoved {
            message_id: MessageId::from("m9"),
            label_ids: vec![LabelId::from("INBOX")],
        };
        assert_eq!(record.message_id().0, "m9");
    }

    #[test]
    fn history_record_serialization() {
        let record = HistoryRecord::MessageDeleted {
            message_id: MessageId::from("m2"),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"type\":\"message_deleted\""));
    }

    #[test]
    fn remote_error_display() {
        assert_eq!(
            RemoteError::Authentication("token expired".to_string()).to_string(),
            "authentication failed: token expired"
        );
        assert!(RemoteError::CursorExpired.to_string().contains("expired"));
    }
}
