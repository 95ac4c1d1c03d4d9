//! Label domain types.
//!
//! Represents remote labels. A few system labels get first-class boolean
//! projections on [`Message`](super::Message).

use serde::{Deserialize, Serialize};

use super::LabelId;

/// A remote label (folder or tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Remote-assigned identifier.
    pub id: LabelId,
    /// Display name of the label.
    pub name: String,
    /// Whether this is a system label (INBOX, UNREAD, etc.).
    pub is_system: bool,
}

/// Well-known system label IDs.
pub mod system_labels {
    use super::LabelId;

    /// Inbox membership.
    pub const INBOX: &str = "INBOX";
    /// Unread state.
    pub const UNREAD: &str = "UNREAD";
    /// Spam folder.
    pub const SPAM: &str = "SPAM";
    /// Trash folder.
    pub const TRASH: &str = "TRASH";
    /// Sent mail.
    pub const SENT: &str = "SENT";
    /// Drafts.
    pub const DRAFT: &str = "DRAFT";
    /// Starred.
    pub const STARRED: &str = "STARRED";
    /// Bulk/promotional category.
    pub const CATEGORY_PROMOTIONS: &str = "CATEGORY_PROMOTIONS";

    /// Returns the inbox label ID.
    pub fn inbox() -> LabelId {
        LabelId::from(INBOX)
    }

    /// Returns the unread label ID.
    pub fn unread() -> LabelId {
        LabelId::from(UNREAD)
    }

    /// Returns the spam label ID.
    pub fn spam() -> LabelId {
        LabelId::from(SPAM)
    }

    /// Returns true for ids the remote reserves for itself.
    pub fn is_system(id: &str) -> bool {
        matches!(
            id,
            INBOX | UNREAD | SPAM | TRASH | SENT | DRAFT | STARRED | "IMPORTANT" | "CHAT"
        ) || id.starts_with("CATEGORY_")
    }
}
