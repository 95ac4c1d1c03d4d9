//! Delta history interpretation.
//!
//! Records are applied in feed order after the batch's new messages have
//! been fetched and stored. Deletions are unconditional. Label changes go
//! through the conflict policy; label changes for messages that are not
//! stored locally are skipped and left for the reconciler.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tracing::debug;

use super::conflict::ConflictPolicy;
use crate::domain::{system_labels, ConversationId, MessageId};
use crate::providers::mail::HistoryRecord;
use crate::storage::queries::messages;
use crate::storage::Result;

/// Counts and touched conversations of one application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryOutcome {
    /// Messages deleted.
    pub deleted: usize,
    /// Label changes written.
    pub labels_applied: usize,
    /// Label changes skipped because a fresh local edit wins.
    pub skipped_conflict: usize,
    /// Label changes skipped because the message is not stored.
    pub skipped_missing: usize,
    /// Conversations whose messages changed.
    pub touched: BTreeSet<ConversationId>,
}

/// Applies history records against the store.
#[derive(Debug, Clone)]
pub struct HistoryProcessor {
    policy: ConflictPolicy,
}

impl HistoryProcessor {
    /// Creates a processor.
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// Ids added in this batch that need fetching, in feed order.
    ///
    /// Spam additions and ids deleted later in the same batch are dropped.
    /// Ids already stored are filtered separately with one batched lookup.
    pub fn collect_additions(records: &[HistoryRecord]) -> Vec<MessageId> {
        let mut additions: Vec<(usize, &MessageId)> = Vec::new();
        let mut last_deleted: std::collections::HashMap<&MessageId, usize> =
            std::collections::HashMap::new();

        for (position, record) in records.iter().enumerate() {
            match record {
                HistoryRecord::MessageAdded {
                    message_id,
                    label_ids,
                } => {
                    if label_ids.iter().any(|l| l.0 == system_labels::SPAM) {
                        debug!(message_id = %message_id, "skipping spam addition");
                        continue;
                    }
                    additions.push((position, message_id));
                }
                HistoryRecord::MessageDeleted { message_id } => {
                    last_deleted.insert(message_id, position);
                }
                _ => {}
            }
        }

        let mut seen = HashSet::new();
        additions
            .into_iter()
            .filter(|(position, id)| {
                !matches!(last_deleted.get(id), Some(deleted_at) if deleted_at > position)
            })
            .filter(|(_, id)| seen.insert(*id))
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Applies deletions and label changes in feed order.
    ///
    /// Local state for every referenced id is loaded with one batched query.
    pub fn apply(
        &self,
        conn: &Connection,
        records: &[HistoryRecord],
        sync_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<HistoryOutcome> {
        let ids: Vec<MessageId> = records
            .iter()
            .map(|r| r.message_id().clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut states = messages::label_states(conn, &ids)?;
        let mut dirty: BTreeSet<MessageId> = BTreeSet::new();
        let mut cleared: HashSet<MessageId> = HashSet::new();
        let mut outcome = HistoryOutcome::default();

        for record in records {
            match record {
                HistoryRecord::MessageAdded { .. } => {}
                HistoryRecord::MessageDeleted { message_id } => {
                    if let Some(state) = states.remove(message_id) {
                        messages::delete(conn, message_id)?;
                        dirty.remove(message_id);
                        outcome.deleted += 1;
                        outcome.touched.insert(state.conversation_id);
                    }
                }
                HistoryRecord::LabelsAdded {
                    message_id,
                    label_ids,
                }
                | HistoryRecord::LabelsRemoved {
                    message_id,
                    label_ids,
                } => {
                    let Some(state) = states.get_mut(message_id) else {
                        debug!(message_id = %message_id, "label change for unknown message skipped");
                        outcome.skipped_missing += 1;
                        continue;
                    };

                    let decision = self.policy.decide(state.local_modified_at, sync_start, now);
                    if !decision.applies_remote() {
                        debug!(message_id = %message_id, "label change skipped, local edit pending");
                        outcome.skipped_conflict += 1;
                        continue;
                    }
                    if decision.clears_marker() {
                        state.local_modified_at = None;
                        cleared.insert(message_id.clone());
                    }

                    if matches!(record, HistoryRecord::LabelsAdded { .. }) {
                        state.labels.extend(label_ids.iter().cloned());
                    } else {
                        for label in label_ids {
                            state.labels.remove(label);
                        }
                    }
                    dirty.insert(message_id.clone());
                    outcome.labels_applied += 1;
                    outcome.touched.insert(state.conversation_id.clone());
                }
            }
        }

        for id in &dirty {
            if let Some(state) = states.get(id) {
                messages::write_labels(conn, id, &state.labels)?;
                if cleared.contains(id) {
                    messages::set_local_modified(conn, id, None)?;
                }
            }
        }

        debug!(
            deleted = outcome.deleted,
            applied = outcome.labels_applied,
            skipped_conflict = outcome.skipped_conflict,
            skipped_missing = outcome.skipped_missing,
            "history applied"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Address, LabelId, ThreadLinkId};
    use crate::services::conversation_service::ConversationResolver;
    use crate::services::message_upserter::MessageUpserter;
    use crate::domain::AccountIdentity;
    use crate::providers::mail::RemoteMessage;
    use crate::storage::Database;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn id(raw: &str) -> MessageId {
        MessageId::from(raw)
    }

    fn labels(raw: &[&str]) -> Vec<LabelId> {
        raw.iter().map(|l| LabelId::from(*l)).collect()
    }

    fn added(raw: &str, label_ids: &[&str]) -> HistoryRecord {
        HistoryRecord::MessageAdded {
            message_id: id(raw),
            label_ids: labels(label_ids),
        }
    }

    fn remote(raw: &str, label_ids: &[&str]) -> RemoteMessage {
        RemoteMessage {
            id: id(raw),
            thread_id: ThreadLinkId::from("t"),
            label_ids: labels(label_ids),
            snippet: "s".into(),
            internal_date: Utc::now(),
            from: Some(Address::new("ann@x.io")),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: None,
            list_unsubscribe: false,
            attachments: vec![],
        }
    }

    async fn seeded(messages: Vec<RemoteMessage>) -> Database {
        let db = Database::open_in_memory().await.unwrap();
        let upserter = MessageUpserter::new(
            ConversationResolver::new(AccountIdentity::new("me@example.com", &[])),
            ConflictPolicy::default(),
        );
        db.with_conn(move |conn| {
            upserter.upsert_batch(conn, &messages, Utc::now() - Duration::hours(1))?;
            Ok(())
        })
        .await
        .unwrap();
        db
    }

    #[test]
    fn additions_skip_spam_and_later_deletes() {
        let records = vec![
            added("m1", &["INBOX"]),
            added("spam", &["SPAM"]),
            added("m2", &["INBOX"]),
            HistoryRecord::MessageDeleted { message_id: id("m2") },
            added("m1", &["INBOX"]),
            HistoryRecord::MessageDeleted { message_id: id("m3") },
            added("m3", &[]),
        ];

        assert_eq!(
            HistoryProcessor::collect_additions(&records),
            vec![id("m1"), id("m3")]
        );
    }

    #[tokio::test]
    async fn label_changes_apply_in_order() {
        let db = seeded(vec![remote("m1", &["INBOX", "UNREAD"])]).await;
        let processor = HistoryProcessor::new(ConflictPolicy::default());

        let (outcome, stored) = db
            .with_conn(move |conn| {
                let records = vec![
                    HistoryRecord::LabelsRemoved {
                        message_id: id("m1"),
                        label_ids: labels(&["UNREAD"]),
                    },
                    HistoryRecord::LabelsAdded {
                        message_id: id("m1"),
                        label_ids: labels(&["STARRED"]),
                    },
                    HistoryRecord::LabelsRemoved {
                        message_id: id("m1"),
                        label_ids: labels(&["INBOX"]),
                    },
                    HistoryRecord::LabelsAdded {
                        message_id: id("unknown"),
                        label_ids: labels(&["INBOX"]),
                    },
                ];
                let outcome = processor.apply(conn, &records, Utc::now(), Utc::now())?;
                Ok((outcome, messages::get(conn, &id("m1"))?))
            })
            .await
            .unwrap();

        let stored = stored.unwrap();
        assert_eq!(outcome.labels_applied, 3);
        assert_eq!(outcome.skipped_missing, 1);
        assert_eq!(outcome.touched.len(), 1);
        assert!(!stored.is_unread);
        assert!(!stored.is_in_inbox);
        assert_eq!(stored.labels, labels(&["STARRED"]).into_iter().collect());
    }

    #[tokio::test]
    async fn deletion_is_unconditional_and_later_changes_skip() {
        let db = seeded(vec![remote("m1", &["INBOX"])]).await;
        let processor = HistoryProcessor::new(ConflictPolicy::default());

        let (outcome, stored) = db
            .with_conn(move |conn| {
                messages::apply_local_edit(conn, &id("m1"), &labels(&["STARRED"]), &[], &Utc::now())?;
                let records = vec![
                    HistoryRecord::MessageDeleted { message_id: id("m1") },
                    HistoryRecord::LabelsAdded {
                        message_id: id("m1"),
                        label_ids: labels(&["UNREAD"]),
                    },
                ];
                let outcome =
                    processor.apply(conn, &records, Utc::now() - Duration::seconds(5), Utc::now())?;
                Ok((outcome, messages::get(conn, &id("m1"))?))
            })
            .await
            .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.skipped_missing, 1);
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn fresh_local_edit_blocks_label_change() {
        let db = seeded(vec![remote("m1", &["INBOX", "UNREAD"])]).await;
        let processor = HistoryProcessor::new(ConflictPolicy::default());

        let (outcome, stored) = db
            .with_conn(move |conn| {
                let now = Utc::now();
                messages::apply_local_edit(conn, &id("m1"), &[], &labels(&["UNREAD"]), &now)?;
                let records = vec![HistoryRecord::LabelsAdded {
                    message_id: id("m1"),
                    label_ids: labels(&["UNREAD"]),
                }];
                let outcome = processor.apply(conn, &records, now - Duration::seconds(1), now)?;
                Ok((outcome, messages::get(conn, &id("m1"))?))
            })
            .await
            .unwrap();

        assert_eq!(outcome.skipped_conflict, 1);
        assert!(!stored.unwrap().is_unread);
    }
}
