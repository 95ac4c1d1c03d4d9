//! Periodic sweep correcting drift the delta feed missed.
//!
//! Two checks run inside the incremental pass's unit of work:
//!
//! 1. A direct list query over a recent window finds ids that exist remotely
//!    but were never stored, and fetches them.
//! 2. The most recent stored messages are re-fetched as metadata and their
//!    inbox and unread bits compared to the remote; mismatches are corrected
//!    under the same conflict policy as every other remote write.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::conflict::ConflictPolicy;
use super::error::Result;
use super::fetcher::FailedFetch;
use super::pipeline::{after_query, PassContext, PassPipeline};
use crate::config::SyncSettings;
use crate::domain::{system_labels, ConversationId, LabelId, MessageId};
use crate::providers::mail::{MessageFormat, RemoteError, RemoteMessage};
use crate::storage::queries::{messages, meta};
use crate::storage::{self, UnitOfWork};

/// What a sweep found and fixed.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Ids the window query returned.
    pub listed: usize,
    /// Missing messages fetched and stored.
    pub recovered: usize,
    /// Missing messages that could not be fetched.
    pub failed: Vec<FailedFetch>,
    /// Messages whose labels were compared.
    pub labels_checked: usize,
    /// Messages whose inbox or unread state was corrected.
    pub labels_corrected: usize,
    /// Corrections skipped because a local edit is pending.
    pub skipped_conflict: usize,
    /// Messages deleted because the remote no longer has them.
    pub deleted: usize,
}

#[derive(Debug, Default)]
struct LabelFix {
    checked: usize,
    corrected: usize,
    skipped_conflict: usize,
    deleted: usize,
    touched: BTreeSet<ConversationId>,
}

/// Runs the sweep.
#[derive(Debug, Clone)]
pub struct Reconciler {
    window: Duration,
    max_messages: usize,
    label_check_limit: usize,
    interval: Duration,
    policy: ConflictPolicy,
}

impl Reconciler {
    /// Creates a reconciler from sync settings.
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            window: Duration::hours(settings.reconcile_window_hours.max(1)),
            max_messages: settings.reconcile_max_messages,
            label_check_limit: settings.reconcile_label_check_limit,
            interval: Duration::seconds(settings.reconcile_interval_secs as i64),
            policy: ConflictPolicy::new(settings.conflict_staleness()),
        }
    }

    /// True if the last sweep is older than the interval.
    pub fn is_due(&self, conn: &Connection, now: DateTime<Utc>) -> storage::Result<bool> {
        Ok(match meta::get_ts(conn, meta::LAST_RECONCILE_AT)? {
            Some(last) => now - last >= self.interval,
            None => true,
        })
    }

    /// Runs both checks and stamps the sweep time.
    pub async fn run(
        &self,
        pipeline: &PassPipeline,
        uow: &UnitOfWork,
        ctx: &PassContext,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();

        let query = after_query(Utc::now() - self.window);
        let listed = pipeline
            .list_ids(ctx, &query, Some(self.max_messages))
            .await?;
        outcome.listed = listed.len();

        let lookup = listed.clone();
        let present = uow
            .run(move |conn| messages::existing_ids(conn, &lookup))
            .await?;
        let missing: Vec<MessageId> = listed
            .into_iter()
            .filter(|id| !present.contains(id))
            .collect();

        if !missing.is_empty() {
            info!(count = missing.len(), "reconciler found messages missing locally");
            let ingest = pipeline
                .ingest(uow, ctx, &missing, MessageFormat::Full, (0.85, 0.9))
                .await?;
            outcome.recovered = ingest.stored;
            outcome.failed = ingest.failed;
        }

        if ctx.is_cancelled() {
            return Ok(outcome);
        }

        let limit = self.label_check_limit;
        let recent = uow
            .run(move |conn| messages::recent_ids(conn, limit))
            .await?;
        if !recent.is_empty() {
            let report = pipeline
                .fetcher()
                .fetch_batch(&recent, MessageFormat::Metadata, &ctx.cancel)
                .await;

            let gone: Vec<MessageId> = report
                .failed
                .iter()
                .filter(|f| matches!(f.error, RemoteError::NotFound(_)))
                .map(|f| f.id.clone())
                .collect();
            let other_failures = report.failed.len() - gone.len();
            if other_failures > 0 {
                warn!(count = other_failures, "label check skipped some messages");
            }

            let policy = self.policy;
            let sync_start = ctx.sync_start;
            let fetched = report.fetched;
            let fix = uow
                .run(move |conn| correct_labels(conn, &policy, &fetched, &gone, sync_start))
                .await?;

            outcome.labels_checked = fix.checked;
            outcome.labels_corrected = fix.corrected;
            outcome.skipped_conflict = fix.skipped_conflict;
            outcome.deleted = fix.deleted;
            ctx.tracker.record_all(fix.touched);
        }

        uow.run(|conn| meta::set_ts(conn, meta::LAST_RECONCILE_AT, &Utc::now()))
            .await?;

        debug!(
            listed = outcome.listed,
            recovered = outcome.recovered,
            checked = outcome.labels_checked,
            corrected = outcome.labels_corrected,
            deleted = outcome.deleted,
            "reconcile sweep finished"
        );
        Ok(outcome)
    }
}

/// Compares inbox and unread bits and writes corrections.
fn correct_labels(
    conn: &Connection,
    policy: &ConflictPolicy,
    remotes: &[RemoteMessage],
    gone: &[MessageId],
    sync_start: DateTime<Utc>,
) -> storage::Result<LabelFix> {
    let mut fix = LabelFix::default();

    for id in gone {
        if let Some(owner) = messages::delete(conn, id)? {
            fix.deleted += 1;
            fix.touched.insert(owner);
        }
    }

    let ids: Vec<MessageId> = remotes.iter().map(|r| r.id.clone()).collect();
    let mut states = messages::label_states(conn, &ids)?;
    let now = Utc::now();

    for remote in remotes {
        let Some(state) = states.get_mut(&remote.id) else {
            continue;
        };
        fix.checked += 1;

        let wanted: HashMap<LabelId, bool> = [
            (system_labels::inbox(), remote.has_label(system_labels::INBOX)),
            (system_labels::unread(), remote.has_label(system_labels::UNREAD)),
        ]
        .into_iter()
        .collect();
        let drifted = wanted
            .iter()
            .any(|(label, on)| state.labels.contains(label) != *on);
        if !drifted {
            continue;
        }

        let decision = policy.decide(state.local_modified_at, sync_start, now);
        if !decision.applies_remote() {
            fix.skipped_conflict += 1;
            continue;
        }

        for (label, on) in wanted {
            if on {
                state.labels.insert(label);
            } else {
                state.labels.remove(&label);
            }
        }
        messages::write_labels(conn, &remote.id, &state.labels)?;
        if decision.clears_marker() {
            messages::set_local_modified(conn, &remote.id, None)?;
        }
        debug!(message_id = %remote.id, "corrected label drift");
        fix.corrected += 1;
        fix.touched.insert(state.conversation_id.clone());
    }

    Ok(fix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchSettings;
    use crate::domain::{AccountIdentity, Address, ThreadLinkId};
    use crate::providers::mail::{MessageListPage, MockRemoteMailClient};
    use crate::services::fetcher::BoundedFetcher;
    use crate::services::progress::ProgressReporter;
    use crate::storage::Database;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn remote_message(id: &str, labels: &[&str]) -> RemoteMessage {
        RemoteMessage {
            id: MessageId::from(id),
            thread_id: ThreadLinkId::from("t1"),
            label_ids: labels.iter().map(|l| LabelId::from(*l)).collect(),
            snippet: "hello".into(),
            internal_date: Utc::now(),
            from: Some(Address::new("ann@x.io")),
            to: vec![Address::new("me@example.com")],
            cc: vec![],
            bcc: vec![],
            subject: None,
            list_unsubscribe: false,
            attachments: vec![],
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            reconcile_interval_secs: 300,
            ..SyncSettings::default()
        }
    }

    #[tokio::test]
    async fn due_after_interval() {
        let db = Database::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(&settings());

        let (never, fresh, later) = db
            .with_conn(move |conn| {
                let now = Utc::now();
                let never = reconciler.is_due(conn, now)?;
                meta::set_ts(conn, meta::LAST_RECONCILE_AT, &now)?;
                let fresh = reconciler.is_due(conn, now + Duration::seconds(10))?;
                let later = reconciler.is_due(conn, now + Duration::minutes(6))?;
                Ok((never, fresh, later))
            })
            .await
            .unwrap();

        assert!(never);
        assert!(!fresh);
        assert!(later);
    }

    #[tokio::test]
    async fn sweep_recovers_missing_and_corrects_drift() {
        let mut remote = MockRemoteMailClient::new();
        remote.expect_list_messages().returning(|_, _| {
            Ok(MessageListPage {
                ids: vec![MessageId::from("stored"), MessageId::from("missing")],
                next_page_token: None,
            })
        });
        remote.expect_get_message().returning(|id, _| match id.0.as_str() {
            "missing" => Ok(remote_message("missing", &["INBOX"])),
            // Archived and read remotely, still in inbox and unread locally.
            "stored" => Ok(remote_message("stored", &[])),
            _ => Err(RemoteError::NotFound(id.0.clone())),
        });

        let fetch = FetchSettings {
            max_attempts: 1,
            ..FetchSettings::default()
        };
        let pipeline = PassPipeline::new(
            BoundedFetcher::new(Arc::new(remote), &fetch),
            AccountIdentity::new("me@example.com", &[]),
            &settings(),
        );
        let db = Database::open_in_memory().await.unwrap();
        let seed = pipeline.upserter().clone();
        db.with_conn(move |conn| {
            seed.upsert_batch(
                conn,
                &[
                    remote_message("stored", &["INBOX", "UNREAD"]),
                    remote_message("deleted-remotely", &["INBOX"]),
                ],
                Utc::now() - Duration::hours(1),
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let ctx = PassContext::new(CancellationToken::new(), ProgressReporter::channel());
        let mut uow = db.begin_unit().await.unwrap();
        let outcome = Reconciler::new(&settings())
            .run(&pipeline, &uow, &ctx)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        assert_eq!(outcome.listed, 2);
        assert_eq!(outcome.recovered, 1);
        assert_eq!(outcome.labels_corrected, 1);
        assert_eq!(outcome.deleted, 1);
        assert!(!ctx.tracker.is_empty());

        let (stored, gone, stamped) = db
            .with_conn(|conn| {
                Ok((
                    messages::get(conn, &MessageId::from("stored"))?,
                    messages::get(conn, &MessageId::from("deleted-remotely"))?,
                    meta::get_ts(conn, meta::LAST_RECONCILE_AT)?,
                ))
            })
            .await
            .unwrap();
        let stored = stored.unwrap();
        assert!(!stored.is_in_inbox);
        assert!(!stored.is_unread);
        assert!(gone.is_none());
        assert!(stamped.is_some());
    }
}
