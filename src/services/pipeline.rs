//! Building blocks shared by every sync orchestration.
//!
//! A pass runs inside one [`UnitOfWork`]: remote data is fetched in batches,
//! written through the open transaction, and the touched conversations are
//! recorded. [`PassPipeline::finalize`] recomputes rollups for exactly those,
//! lets the failure tracker decide on the cursor, and commits with retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::ConflictPolicy;
use super::conversation_service::{ConversationResolver, RollupSummary};
use super::error::{Result, SyncError};
use super::failure_tracker::{CursorDecision, FailureTracker};
use super::fetcher::{retry_with_backoff, BoundedFetcher, FailedFetch};
use super::message_upserter::MessageUpserter;
use super::modification_tracker::ModificationTracker;
use super::progress::ProgressReporter;
use crate::config::SyncSettings;
use crate::domain::{AccountIdentity, HistoryCursor, MessageId};
use crate::providers::mail::{MessageFormat, RemoteMailClient, RemoteMessage};
use crate::storage::queries::account;
use crate::storage::UnitOfWork;

/// Follow-up work for messages with attachments, run outside the pass.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AttachmentQueue: Send + Sync {
    /// Queues attachment downloads for the given messages.
    async fn enqueue(&self, ids: Vec<MessageId>);
}

/// Queue that only logs; used when no downloader is wired in.
#[derive(Debug, Default, Clone)]
pub struct LoggingAttachmentQueue;

#[async_trait]
impl AttachmentQueue for LoggingAttachmentQueue {
    async fn enqueue(&self, ids: Vec<MessageId>) {
        debug!(count = ids.len(), "attachment follow-up requested");
    }
}

/// Hands attachment work to the queue without waiting for it.
pub fn spawn_attachment_follow_up(queue: Arc<dyn AttachmentQueue>, ids: Vec<MessageId>) {
    if ids.is_empty() {
        return;
    }
    tokio::spawn(async move {
        queue.enqueue(ids).await;
    });
}

/// State every step of a pass shares.
#[derive(Debug, Clone)]
pub struct PassContext {
    /// When the pass started; the conflict policy compares edits to it.
    pub sync_start: DateTime<Utc>,
    /// Fires when the pass should stop.
    pub cancel: CancellationToken,
    /// Progress sink.
    pub progress: ProgressReporter,
    /// Conversations modified so far.
    pub tracker: ModificationTracker,
}

impl PassContext {
    /// Creates a context starting now.
    pub fn new(cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self {
            sync_start: Utc::now(),
            cancel,
            progress,
            tracker: ModificationTracker::new(),
        }
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of fetching and storing a set of ids.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// Messages stored.
    pub stored: usize,
    /// Messages still failing after the bulk retry.
    pub failed: Vec<FailedFetch>,
    /// Stored messages that carry attachments.
    pub with_attachments: Vec<MessageId>,
    /// True if cancellation cut the ingest short.
    pub cancelled: bool,
}

impl IngestOutcome {
    /// Failures as `(id, reason)` pairs for the failure tracker.
    pub fn failure_reasons(&self) -> Vec<(MessageId, String)> {
        self.failed
            .iter()
            .map(|f| (f.id.clone(), f.error.to_string()))
            .collect()
    }
}

/// How the cursor is treated when a pass finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// Advance only if the failure tracker allows it.
    Tracked(HistoryCursor),
    /// Advance regardless of failures; clears failure state.
    Unconditional(HistoryCursor),
    /// Leave the cursor alone.
    Hold,
}

/// What finalization did.
#[derive(Debug, Clone)]
pub struct Finalized {
    /// Rollup recompute counts.
    pub rollups: RollupSummary,
    /// The failure tracker's verdict, when it was consulted.
    pub decision: Option<CursorDecision>,
    /// Stored cursor after commit.
    pub cursor_after: Option<HistoryCursor>,
    /// True if this pass wrote the cursor.
    pub advanced: bool,
}

/// Fetch, store and commit machinery for one pass.
#[derive(Clone)]
pub struct PassPipeline {
    fetcher: BoundedFetcher,
    upserter: MessageUpserter,
    resolver: ConversationResolver,
    failures: FailureTracker,
    settings: SyncSettings,
}

impl PassPipeline {
    /// Builds a pipeline for the account identity.
    pub fn new(fetcher: BoundedFetcher, identity: AccountIdentity, settings: &SyncSettings) -> Self {
        let resolver = ConversationResolver::new(identity);
        let policy = ConflictPolicy::new(settings.conflict_staleness());
        Self {
            fetcher,
            upserter: MessageUpserter::new(resolver.clone(), policy),
            resolver,
            failures: FailureTracker::new(settings),
            settings: settings.clone(),
        }
    }

    /// The fetcher used for message downloads.
    pub fn fetcher(&self) -> &BoundedFetcher {
        &self.fetcher
    }

    /// Shared upserter.
    pub fn upserter(&self) -> &MessageUpserter {
        &self.upserter
    }

    /// Shared resolver.
    pub fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    /// Failure tracker.
    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    /// Sync settings.
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Remote client.
    pub fn remote(&self) -> &Arc<dyn RemoteMailClient> {
        self.fetcher.remote()
    }

    /// Lists every id matching `query`, stopping at `limit` if given.
    ///
    /// Cancellation stops pagination and returns what was listed so far.
    pub async fn list_ids(
        &self,
        ctx: &PassContext,
        query: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageId>> {
        list_ids(&self.fetcher, ctx, query, limit).await
    }

    /// Fetches `ids` in batches and upserts each batch as it arrives.
    ///
    /// Retryable failures get one bulk retry after the main loop. Progress
    /// moves across `span` as batches complete.
    pub async fn ingest(
        &self,
        uow: &UnitOfWork,
        ctx: &PassContext,
        ids: &[MessageId],
        format: MessageFormat,
        span: (f32, f32),
    ) -> Result<IngestOutcome> {
        let mut outcome = IngestOutcome::default();
        if ids.is_empty() {
            return Ok(outcome);
        }

        let batch_size = self.settings.batch_size.max(1);
        let total = ids.len();
        let mut done = 0usize;

        for batch in ids.chunks(batch_size) {
            if ctx.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            let report = self.fetcher.fetch_batch(batch, format, &ctx.cancel).await;
            if !report.skipped.is_empty() {
                outcome.cancelled = true;
            }
            outcome.failed.extend(report.failed);
            self.store(uow, ctx, report.fetched, &mut outcome).await?;

            done += batch.len();
            let fraction = span.0 + (span.1 - span.0) * (done as f32 / total as f32);
            ctx.progress
                .report(fraction, format!("Synced {} of {} messages", done, total));
        }

        if outcome.cancelled {
            return Ok(outcome);
        }

        let (permanent, retryable): (Vec<_>, Vec<_>) =
            outcome.failed.drain(..).partition(FailedFetch::is_permanent);
        outcome.failed = permanent;
        if !retryable.is_empty() {
            info!(count = retryable.len(), "retrying failed fetches");
            let retry_ids: Vec<MessageId> = retryable.into_iter().map(|f| f.id).collect();
            let report = self.fetcher.fetch_batch(&retry_ids, format, &ctx.cancel).await;
            if !report.skipped.is_empty() {
                outcome.cancelled = true;
            }
            outcome.failed.extend(report.failed);
            self.store(uow, ctx, report.fetched, &mut outcome).await?;
        }

        if !outcome.failed.is_empty() {
            warn!(failed = outcome.failed.len(), "messages still failing after retry");
        }
        Ok(outcome)
    }

    async fn store(
        &self,
        uow: &UnitOfWork,
        ctx: &PassContext,
        fetched: Vec<RemoteMessage>,
        outcome: &mut IngestOutcome,
    ) -> Result<()> {
        if fetched.is_empty() {
            return Ok(());
        }
        let upserter = self.upserter.clone();
        let sync_start = ctx.sync_start;
        let batch = uow
            .run(move |conn| upserter.upsert_batch(conn, &fetched, sync_start))
            .await?;

        outcome.stored += batch.created + batch.updated;
        outcome.with_attachments.extend(batch.with_attachments);
        ctx.tracker.record_all(batch.touched);
        Ok(())
    }

    /// Recomputes rollups, decides on the cursor and commits.
    pub async fn finalize(
        &self,
        uow: &mut UnitOfWork,
        ctx: &PassContext,
        failures: Vec<(MessageId, String)>,
        mode: CursorMode,
    ) -> Result<Finalized> {
        let touched = ctx.tracker.drain_all();
        let resolver = self.resolver.clone();
        let tracker = self.failures.clone();

        let finalized = uow
            .run(move |conn| {
                let now = Utc::now();
                let rollups = resolver.recompute_rollups(conn, &touched)?;

                let (decision, target) = match mode {
                    CursorMode::Tracked(cursor) => {
                        let decision = tracker.should_advance_cursor(conn, &failures, &now)?;
                        let target = decision.advances().then_some(cursor);
                        (Some(decision), target)
                    }
                    CursorMode::Unconditional(cursor) => {
                        tracker.reset(conn)?;
                        (None, Some(cursor))
                    }
                    CursorMode::Hold => (None, None),
                };

                let cursor_after = match target {
                    Some(cursor) => Some(account::advance_cursor(conn, cursor, &now)?),
                    None => account::get(conn)?.and_then(|a| a.history_cursor),
                };

                Ok(Finalized {
                    rollups,
                    decision,
                    cursor_after,
                    advanced: target.is_some(),
                })
            })
            .await?;

        commit_with_retry(uow, &self.settings).await?;
        Ok(finalized)
    }
}

/// Paginates the list endpoint with retries.
pub async fn list_ids(
    fetcher: &BoundedFetcher,
    ctx: &PassContext,
    query: &str,
    limit: Option<usize>,
) -> Result<Vec<MessageId>> {
    let remote = fetcher.remote().clone();
    let mut ids = Vec::new();
    let mut page_token: Option<String> = None;

    loop {
        if ctx.is_cancelled() {
            break;
        }
        let token = page_token.take();
        let page = retry_with_backoff(fetcher.policy(), &ctx.cancel, "list_messages", || {
            remote.list_messages(query, token.clone())
        })
        .await?;

        ids.extend(page.ids);
        if let Some(limit) = limit {
            if ids.len() >= limit {
                ids.truncate(limit);
                break;
            }
        }
        match page.next_page_token {
            Some(next) => page_token = Some(next),
            None => break,
        }
    }

    debug!(query, count = ids.len(), "listed message ids");
    Ok(ids)
}

/// Commits, retrying with doubling delay. Rolls back if every attempt fails.
pub async fn commit_with_retry(uow: &mut UnitOfWork, settings: &SyncSettings) -> Result<()> {
    let max_attempts = settings.commit_max_attempts.max(1);
    let mut delay = Duration::from_millis(settings.commit_base_delay_ms);
    let mut attempt = 1;

    loop {
        match uow.commit().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < max_attempts => {
                warn!(attempt, error = %e, "commit failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => {
                if let Err(rollback) = uow.rollback().await {
                    warn!(error = %rollback, "rollback after failed commit also failed");
                }
                return Err(SyncError::CommitFailed {
                    attempts: attempt,
                    source: e,
                });
            }
        }
    }
}

/// Rolls the unit of work back if the pass failed before committing.
pub(crate) async fn finish_unit<T>(uow: &mut UnitOfWork, result: Result<T>) -> Result<T> {
    if result.is_err() && uow.is_active() {
        if let Err(e) = uow.rollback().await {
            warn!(error = %e, "rollback of failed pass failed");
        }
    }
    result
}

/// Search query for messages received after `since`.
pub fn after_query(since: DateTime<Utc>) -> String {
    format!("after:{}", since.timestamp().max(0))
}
