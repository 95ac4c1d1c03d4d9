//! Conversation identity, find-or-create, merge and rollups.
//!
//! A conversation is identified by a hash over the sorted, normalized set of
//! participant addresses that do not belong to the account. Messages with no
//! other participant (self-to-self mail) fall back to the remote thread link.

use std::collections::BTreeSet;

use chrono::Utc;
use ring::digest;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::domain::{
    normalize_email, AccountIdentity, Conversation, ConversationId, MergeCandidate, ThreadLinkId,
};
use crate::storage::queries::conversations;
use crate::storage::Result;

/// Prefix of identity keys derived from thread linkage.
const THREAD_KEY_PREFIX: &str = "thread:";

/// Computes the identity key of a participant set.
///
/// `participants` must already exclude account addresses. Returns `None`
/// only when there are no participants and no thread linkage.
pub fn participant_hash(participants: &[String], thread: Option<&ThreadLinkId>) -> Option<String> {
    let normalized: BTreeSet<String> = participants
        .iter()
        .map(|p| normalize_email(p))
        .filter(|p| !p.is_empty())
        .collect();

    if normalized.is_empty() {
        return thread.map(|t| format!("{}{}", THREAD_KEY_PREFIX, t.0));
    }

    let joined = normalized.into_iter().collect::<Vec<_>>().join("\n");
    let hash = digest::digest(&digest::SHA256, joined.as_bytes());
    Some(hash.as_ref().iter().map(|b| format!("{:02x}", b)).collect())
}

/// Finds, creates and merges conversations.
#[derive(Debug, Clone)]
pub struct ConversationResolver {
    identity: AccountIdentity,
}

/// Result of a rollup recompute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollupSummary {
    /// Conversations whose rollups were rewritten.
    pub updated: usize,
    /// Conversations deleted because they no longer own messages.
    pub deleted: usize,
}

impl ConversationResolver {
    /// Creates a resolver for the account identity.
    pub fn new(identity: AccountIdentity) -> Self {
        Self { identity }
    }

    /// Account addresses excluded from identities.
    pub fn identity(&self) -> &AccountIdentity {
        &self.identity
    }

    /// Normalized, sorted, de-duplicated non-account participants.
    pub fn identity_participants<'a>(
        &self,
        addresses: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        addresses
            .into_iter()
            .map(normalize_email)
            .filter(|email| !email.is_empty() && !self.identity.owns(email))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns the conversation for `participants`, creating it on a miss.
    ///
    /// `participants` are the identity participants of the message; people
    /// rows for them must already exist.
    pub fn find_or_create(
        &self,
        conn: &Connection,
        participants: &[String],
        thread: &ThreadLinkId,
    ) -> Result<ConversationId> {
        let fallback = participants.is_empty();
        let hash = participant_hash(participants, Some(thread))
            .unwrap_or_else(|| format!("{}{}", THREAD_KEY_PREFIX, thread.0));

        if let Some(existing) = conversations::find_by_hash(conn, &hash)? {
            conversations::add_participants(conn, &existing.id, participants)?;
            return Ok(existing.id);
        }

        let conversation = Conversation {
            id: ConversationId::generate(),
            participant_hash: hash,
            thread_link_id: fallback.then(|| thread.clone()),
            is_archived: false,
            is_pinned: false,
            is_muted: false,
            unread_count: 0,
            message_count: 0,
            snippet: None,
            last_message_at: None,
            created_at: Utc::now(),
        };
        conversations::insert(conn, &conversation)?;
        conversations::add_participants(conn, &conversation.id, participants)?;
        debug!(conversation_id = %conversation.id, participants = participants.len(), "created conversation");
        Ok(conversation.id)
    }

    /// Merges conversations that share an identity into one survivor.
    ///
    /// The winner is the one with the most messages, then the oldest, then
    /// the lowest id, so repeated runs converge on the same survivor.
    pub fn merge(&self, conn: &Connection, ids: &[ConversationId]) -> Result<Option<ConversationId>> {
        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(candidate) = conversations::merge_candidate(conn, id)? {
                candidates.push(candidate);
            }
        }

        let Some(winner) = MergeCandidate::winner(&candidates).map(|w| w.id.clone()) else {
            return Ok(None);
        };

        for loser in candidates.iter().filter(|c| c.id != winner) {
            let moved = conversations::absorb(conn, &winner, &loser.id)?;
            info!(winner = %winner, loser = %loser.id, moved, "merged conversations");
        }
        Ok(Some(winner))
    }

    /// Recomputes rollups for exactly `ids`, deleting emptied conversations.
    pub fn recompute_rollups(&self, conn: &Connection, ids: &[ConversationId]) -> Result<RollupSummary> {
        let mut summary = RollupSummary::default();
        for id in ids {
            if conversations::get(conn, id)?.is_none() {
                continue;
            }
            let rollup = conversations::compute_rollup(conn, id)?;
            if rollup.message_count == 0 {
                conversations::delete(conn, id)?;
                summary.deleted += 1;
            } else {
                conversations::apply_rollup(conn, id, &rollup)?;
                summary.updated += 1;
            }
        }
        debug!(updated = summary.updated, deleted = summary.deleted, "rollups recomputed");
        Ok(summary)
    }
}
