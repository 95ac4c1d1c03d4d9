//! Remote message to local entity conversion and idempotent upsert.
//!
//! A message id is created once and updated in place on every later
//! delivery. Remote content always overwrites; remote labels go through the
//! conflict policy. Conversation ownership of an existing message never
//! changes here.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use super::conflict::ConflictPolicy;
use super::conversation_service::ConversationResolver;
use crate::domain::{
    clean_snippet, system_labels, Address, ConversationId, Message, MessageId, ParticipantRole,
    Person,
};
use crate::providers::mail::RemoteMessage;
use crate::storage::queries::{messages, people};
use crate::storage::Result;

/// Outcome of upserting one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Owning conversation.
    pub conversation_id: ConversationId,
    /// True if the message row was created.
    pub created: bool,
    /// True if remote labels were skipped in favour of a fresh local edit.
    pub kept_local_labels: bool,
}

/// Outcome of upserting a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertBatchOutcome {
    /// Rows created.
    pub created: usize,
    /// Rows updated in place.
    pub updated: usize,
    /// Messages whose remote labels lost to a local edit.
    pub kept_local: usize,
    /// Conversations touched.
    pub touched: BTreeSet<ConversationId>,
    /// Messages that carry attachments.
    pub with_attachments: Vec<MessageId>,
}

/// Writes remote messages into the store.
#[derive(Debug, Clone)]
pub struct MessageUpserter {
    resolver: ConversationResolver,
    policy: ConflictPolicy,
}

impl MessageUpserter {
    /// Creates an upserter.
    pub fn new(resolver: ConversationResolver, policy: ConflictPolicy) -> Self {
        Self { resolver, policy }
    }

    /// Upserts every message of a batch in order.
    pub fn upsert_batch(
        &self,
        conn: &Connection,
        remotes: &[RemoteMessage],
        sync_start: DateTime<Utc>,
    ) -> Result<UpsertBatchOutcome> {
        let mut outcome = UpsertBatchOutcome::default();
        for remote in remotes {
            let result = self.upsert(conn, remote, sync_start, Utc::now())?;
            if result.created {
                outcome.created += 1;
            } else {
                outcome.updated += 1;
            }
            if result.kept_local_labels {
                outcome.kept_local += 1;
            }
            if !remote.attachments.is_empty() {
                outcome.with_attachments.push(remote.id.clone());
            }
            outcome.touched.insert(result.conversation_id);
        }
        Ok(outcome)
    }

    /// Creates or updates one message and its participants, labels and
    /// attachments.
    pub fn upsert(
        &self,
        conn: &Connection,
        remote: &RemoteMessage,
        sync_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let participants = participant_links(remote);
        for (address, _) in &participants {
            people::upsert(conn, &Person::new(&address.email, address.name.as_deref()))?;
        }

        let existing = messages::get(conn, &remote.id)?;
        let outcome = match existing {
            Some(existing) => {
                let message = to_message(remote, existing.conversation_id.clone());
                messages::update_content(conn, &message)?;

                let decision = self.policy.decide(existing.local_modified_at, sync_start, now);
                if decision.applies_remote() {
                    messages::write_labels(conn, &remote.id, &message.labels)?;
                    if decision.clears_marker() {
                        messages::set_local_modified(conn, &remote.id, None)?;
                    }
                } else {
                    debug!(message_id = %remote.id, "remote labels skipped, local edit pending");
                }

                UpsertOutcome {
                    conversation_id: existing.conversation_id,
                    created: false,
                    kept_local_labels: !decision.applies_remote(),
                }
            }
            None => {
                let identity_participants = self
                    .resolver
                    .identity_participants(participants.iter().map(|(a, _)| a.email.as_str()));
                let conversation_id =
                    self.resolver
                        .find_or_create(conn, &identity_participants, &remote.thread_id)?;
                messages::insert(conn, &to_message(remote, conversation_id.clone()))?;

                UpsertOutcome {
                    conversation_id,
                    created: true,
                    kept_local_labels: false,
                }
            }
        };

        let links: Vec<(String, ParticipantRole)> = participants
            .iter()
            .map(|(address, role)| (address.normalized_email(), *role))
            .collect();
        messages::replace_participants(conn, &remote.id, &links)?;
        messages::replace_attachments(conn, &remote.id, &remote.attachments)?;

        Ok(outcome)
    }
}

/// Every address on the message with its role, blank addresses dropped.
fn participant_links(remote: &RemoteMessage) -> Vec<(Address, ParticipantRole)> {
    let from = remote
        .from
        .iter()
        .map(|a| (a.clone(), ParticipantRole::From));
    let to = remote.to.iter().map(|a| (a.clone(), ParticipantRole::To));
    let cc = remote.cc.iter().map(|a| (a.clone(), ParticipantRole::Cc));
    let bcc = remote.bcc.iter().map(|a| (a.clone(), ParticipantRole::Bcc));

    from.chain(to)
        .chain(cc)
        .chain(bcc)
        .filter(|(a, _)| !a.normalized_email().is_empty())
        .collect()
}

/// Builds the local message entity from a remote message.
fn to_message(remote: &RemoteMessage, conversation_id: ConversationId) -> Message {
    let labels: BTreeSet<_> = remote.label_ids.iter().cloned().collect();
    Message {
        id: remote.id.clone(),
        conversation_id,
        thread_link_id: remote.thread_id.clone(),
        date: remote.internal_date,
        subject: remote.subject.clone(),
        snippet: clean_snippet(&remote.snippet),
        sender: remote
            .from
            .as_ref()
            .map(|a| Address {
                email: a.normalized_email(),
                name: a.name.clone(),
            })
            .unwrap_or_else(|| Address::new("")),
        is_unread: labels.contains(&system_labels::unread()),
        is_in_inbox: labels.contains(&system_labels::inbox()),
        is_newsletter: remote.is_newsletter(),
        labels,
        local_modified_at: None,
    }
}
