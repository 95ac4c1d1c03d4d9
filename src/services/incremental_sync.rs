//! Delta sync from the stored cursor, with recovery when the cursor expired.

use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use super::conflict::ConflictPolicy;
use super::error::{Result, SyncError};
use super::failure_tracker::CursorDecision;
use super::fetcher::{retry_with_backoff, BoundedFetcher};
use super::history_processor::HistoryProcessor;
use super::initial_sync::{fetch_account_snapshot, AccountSnapshot};
use super::pipeline::{
    after_query, finish_unit, spawn_attachment_follow_up, AttachmentQueue, CursorMode,
    PassContext, PassPipeline,
};
use super::progress::{PassKind, PassReport};
use super::reconciler::Reconciler;
use crate::config::SyncSettings;
use crate::domain::{Account, AccountIdentity, HistoryCursor, MessageId};
use crate::providers::mail::{HistoryRecord, MessageFormat, RemoteError};
use crate::storage::queries::{abandoned, account, messages};
use crate::storage::{Database, UnitOfWork};

/// Every record since a cursor, and the cursor to advance to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryDelta {
    /// Records in feed order across all pages.
    pub records: Vec<HistoryRecord>,
    /// Highest cursor reported by any page.
    pub cursor: HistoryCursor,
    /// Pages read.
    pub pages: usize,
}

/// Runs incremental and recovery passes.
#[derive(Clone)]
pub struct IncrementalSync {
    fetcher: BoundedFetcher,
    settings: SyncSettings,
    reconciler: Reconciler,
    attachments: Arc<dyn AttachmentQueue>,
}

impl IncrementalSync {
    /// Creates the orchestrator.
    pub fn new(
        fetcher: BoundedFetcher,
        settings: SyncSettings,
        attachments: Arc<dyn AttachmentQueue>,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(&settings),
            fetcher,
            settings,
            attachments,
        }
    }

    /// Applies every change since the stored cursor.
    ///
    /// Falls back to [`IncrementalSync::recover`] when there is no cursor or
    /// the remote reports it expired.
    pub async fn run(&self, db: &Database, ctx: &PassContext) -> Result<PassReport> {
        let started = Instant::now();
        let stored = db
            .with_conn(account::get)
            .await?
            .ok_or(SyncError::AccountNotInitialized)?;

        let Some(cursor) = stored.history_cursor else {
            info!("no history cursor stored, running recovery");
            return self.recover(db, ctx, stored).await;
        };

        ctx.progress.report(0.0, "Checking for changes");
        let delta = match self.collect_history(ctx, cursor).await {
            Ok(delta) => delta,
            Err(SyncError::Remote(RemoteError::CursorExpired)) | Err(SyncError::CursorExpired) => {
                warn!(cursor = %cursor, "history cursor expired, running recovery");
                return self.recover(db, ctx, stored).await;
            }
            Err(e) => return Err(e),
        };
        ctx.progress.report(0.1, format!("{} changes", delta.records.len()));

        let mut uow = db.begin_unit().await?;
        let result = self.run_in(&mut uow, ctx, &stored, delta).await;
        let (mut report, with_attachments) = finish_unit(&mut uow, result).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        spawn_attachment_follow_up(self.attachments.clone(), with_attachments);
        Ok(report)
    }

    /// Reads every history page after `cursor`.
    pub async fn collect_history(
        &self,
        ctx: &PassContext,
        cursor: HistoryCursor,
    ) -> Result<HistoryDelta> {
        let remote = self.fetcher.remote().clone();
        let mut delta = HistoryDelta {
            records: Vec::new(),
            cursor,
            pages: 0,
        };
        let mut page_token: Option<String> = None;

        loop {
            if delta.pages >= self.settings.history_max_pages {
                return Err(RemoteError::InvalidResponse(format!(
                    "history feed exceeded {} pages",
                    self.settings.history_max_pages
                ))
                .into());
            }
            let token = page_token.take();
            let page = retry_with_backoff(self.fetcher.policy(), &ctx.cancel, "list_history", || {
                remote.list_history(cursor, token.clone())
            })
            .await?;

            delta.pages += 1;
            delta.cursor = delta.cursor.max(page.cursor);
            delta.records.extend(page.records);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        info!(
            pages = delta.pages,
            records = delta.records.len(),
            from = %cursor,
            to = %delta.cursor,
            "history collected"
        );
        Ok(delta)
    }

    async fn run_in(
        &self,
        uow: &mut UnitOfWork,
        ctx: &PassContext,
        stored: &Account,
        delta: HistoryDelta,
    ) -> Result<(PassReport, Vec<MessageId>)> {
        let mut report = PassReport::new(PassKind::Incremental);
        report.cursor_before = stored.history_cursor;
        let pipeline = PassPipeline::new(self.fetcher.clone(), stored.identity(), &self.settings);

        let candidates = HistoryProcessor::collect_additions(&delta.records);
        let lookup = candidates.clone();
        let present = uow
            .run(move |conn| messages::existing_ids(conn, &lookup))
            .await?;
        let additions: Vec<MessageId> = candidates
            .into_iter()
            .filter(|id| !present.contains(id))
            .collect();

        let ingest = pipeline
            .ingest(uow, ctx, &additions, MessageFormat::Full, (0.1, 0.7))
            .await?;
        report.fetched = ingest.stored;
        let mut failures = ingest.failure_reasons();
        let mut with_attachments = ingest.with_attachments;
        let mut cancelled = ingest.cancelled || ctx.is_cancelled();

        if !cancelled {
            let processor =
                HistoryProcessor::new(ConflictPolicy::new(self.settings.conflict_staleness()));
            let sync_start = ctx.sync_start;
            let records = delta.records;
            let applied = uow
                .run(move |conn| processor.apply(conn, &records, sync_start, Utc::now()))
                .await?;
            report.deleted += applied.deleted;
            report.label_changes += applied.labels_applied;
            ctx.tracker.record_all(applied.touched);
            ctx.progress.report(0.8, "Changes applied");

            let reconciler = self.reconciler.clone();
            let due = uow
                .run(move |conn| reconciler.is_due(conn, Utc::now()))
                .await?;
            if due {
                let sweep = self.reconciler.run(&pipeline, uow, ctx).await?;
                report.fetched += sweep.recovered;
                report.deleted += sweep.deleted;
                report.label_changes += sweep.labels_corrected;
                failures.extend(sweep.failed.iter().map(|f| (f.id.clone(), f.error.to_string())));
                cancelled = ctx.is_cancelled();
            }
        }

        report.failed = failures.iter().map(|(id, _)| id.clone()).collect();
        let mode = if cancelled {
            CursorMode::Hold
        } else {
            CursorMode::Tracked(delta.cursor)
        };
        ctx.progress.report(0.9, "Saving");
        let finalized = pipeline.finalize(uow, ctx, failures, mode).await?;

        report.rollups = finalized.rollups.updated;
        report.cursor_after = finalized.cursor_after;
        report.cursor_advanced = finalized.advanced;
        report.cancelled = cancelled;
        if let Some(CursorDecision::AdvanceAfterAbandoning { abandoned }) = finalized.decision {
            report.abandoned = abandoned;
        }
        if !cancelled {
            ctx.progress.report(1.0, "Up to date");
        }

        with_attachments.sort();
        with_attachments.dedup();
        info!(
            fetched = report.fetched,
            deleted = report.deleted,
            label_changes = report.label_changes,
            failed = report.failed.len(),
            cursor_advanced = report.cursor_advanced,
            "incremental sync finished"
        );
        Ok((report, with_attachments))
    }

    /// Re-lists and refetches a bounded window, then adopts a fresh cursor.
    ///
    /// The fresh cursor is captured before listing so changes made while the
    /// window is refetched are replayed by the next delta pass. The cursor
    /// advances even if fetches failed; those ids are abandoned directly.
    pub async fn recover(
        &self,
        db: &Database,
        ctx: &PassContext,
        stored: Account,
    ) -> Result<PassReport> {
        let started = Instant::now();
        ctx.progress.report(0.0, "Resynchronizing");
        let snapshot = fetch_account_snapshot(&self.fetcher, ctx).await?;

        let mut uow = db.begin_unit().await?;
        let result = self.recover_in(&mut uow, ctx, stored, snapshot).await;
        let (mut report, with_attachments) = finish_unit(&mut uow, result).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        spawn_attachment_follow_up(self.attachments.clone(), with_attachments);
        Ok(report)
    }

    /// Advancing unconditionally resets the failure tracker without abandoning
    /// its tracked ids; those are re-listed by the recovery window instead.
    async fn recover_in(
        &self,
        uow: &mut UnitOfWork,
        ctx: &PassContext,
        stored: Account,
        snapshot: AccountSnapshot,
    ) -> Result<(PassReport, Vec<MessageId>)> {
        let mut report = PassReport::new(PassKind::Recovery);
        report.cursor_before = stored.history_cursor;

        let email = snapshot.profile.email.clone();
        let aliases = snapshot.aliases.clone();
        uow.run(move |conn| account::save_identity(conn, &email, &aliases))
            .await?;
        let identity = AccountIdentity::new(&snapshot.profile.email, &snapshot.aliases);
        let pipeline = PassPipeline::new(self.fetcher.clone(), identity, &self.settings);

        let since = match (stored.last_successful_sync, stored.installed_at) {
            (Some(last), _) => last - Duration::seconds(self.settings.recovery_buffer_secs),
            (None, Some(installed)) => installed,
            (None, None) => Utc::now() - Duration::days(self.settings.recovery_fallback_days),
        };
        let ids = pipeline.list_ids(ctx, &after_query(since), None).await?;
        info!(count = ids.len(), since = %since, "recovery listed messages");

        let ingest = pipeline
            .ingest(uow, ctx, &ids, MessageFormat::Full, (0.1, 0.9))
            .await?;
        report.fetched = ingest.stored;
        report.failed = ingest.failed.iter().map(|f| f.id.clone()).collect();

        let cancelled = ingest.cancelled || ctx.is_cancelled();
        let mode = if cancelled {
            CursorMode::Hold
        } else {
            let reasons: Vec<(MessageId, String)> = ingest
                .failed
                .iter()
                .map(|f| (f.id.clone(), format!("recovery: {}", f.error)))
                .collect();
            if !reasons.is_empty() {
                uow.run(move |conn| {
                    let now = Utc::now();
                    for (id, reason) in &reasons {
                        abandoned::upsert(conn, id, reason, &now)?;
                    }
                    Ok(())
                })
                .await?;
                report.abandoned = report.failed.clone();
            }
            CursorMode::Unconditional(snapshot.profile.cursor)
        };

        let finalized = pipeline.finalize(uow, ctx, Vec::new(), mode).await?;
        report.rollups = finalized.rollups.updated;
        report.cursor_after = finalized.cursor_after;
        report.cursor_advanced = finalized.advanced;
        report.cancelled = cancelled;
        if !cancelled {
            ctx.progress.report(1.0, "Resynchronized");
        }

        info!(
            fetched = report.fetched,
            abandoned = report.abandoned.len(),
            cursor = ?report.cursor_after,
            "recovery sync finished"
        );
        Ok((report, ingest.with_attachments))
    }
}
