//! Conversation domain types.
//!
//! A conversation groups messages by participant identity rather than by the
//! remote thread linkage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConversationId, ThreadLinkId};

/// A locally derived conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Surrogate identifier.
    pub id: ConversationId,
    /// Identity key: hash over the non-account participant set.
    pub participant_hash: String,
    /// Thread linkage the identity fell back to, if any.
    pub thread_link_id: Option<ThreadLinkId>,
    /// Whether no owned message is in the inbox.
    pub is_archived: bool,
    /// Pinned by the user.
    pub is_pinned: bool,
    /// Muted by the user.
    pub is_muted: bool,
    /// Rollup: unread messages that are in the inbox.
    pub unread_count: u32,
    /// Rollup: owned message count.
    pub message_count: u32,
    /// Rollup: preview of the most recent message.
    pub snippet: Option<String>,
    /// Rollup: newest message date.
    pub last_message_at: Option<DateTime<Utc>>,
    /// When the conversation was first created locally.
    pub created_at: DateTime<Utc>,
}

/// Rollup values recomputed from owned messages.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationRollup {
    /// Owned message count.
    pub message_count: u32,
    /// Unread messages with the inbox label.
    pub unread_count: u32,
    /// Snippet of the newest message, or its subject for newsletters.
    pub snippet: Option<String>,
    /// Newest message date.
    pub last_message_at: Option<DateTime<Utc>>,
    /// True when no owned message carries the inbox label.
    pub is_archived: bool,
}

/// Candidate summary used to pick a merge winner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeCandidate {
    /// Conversation id.
    pub id: ConversationId,
    /// Number of owned messages.
    pub message_count: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl MergeCandidate {
    /// Picks the deterministic merge winner: most messages, then oldest
    /// creation, then lowest id.
    pub fn winner(candidates: &[MergeCandidate]) -> Option<&MergeCandidate> {
        candidates.iter().min_by(|a, b| {
            b.message_count
                .cmp(&a.message_count)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        })
    }
}
