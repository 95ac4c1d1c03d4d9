//! Full backfill of the mailbox.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use super::cleanup_service::CleanupService;
use super::error::Result;
use super::failure_tracker::CursorDecision;
use super::fetcher::{retry_with_backoff, BoundedFetcher};
use super::pipeline::{
    after_query, finish_unit, spawn_attachment_follow_up, AttachmentQueue, CursorMode,
    PassContext, PassPipeline,
};
use super::progress::{PassKind, PassReport};
use crate::config::SyncSettings;
use crate::domain::{normalize_email, Account, Alias, Label, MessageId, Profile};
use crate::providers::mail::MessageFormat;
use crate::storage::queries::{account, labels, meta};
use crate::storage::{Database, DatabaseError, UnitOfWork};

/// Remote account state captured before anything is listed.
pub(crate) struct AccountSnapshot {
    pub profile: Profile,
    pub aliases: Vec<String>,
}

/// Fetches profile and aliases with retries.
pub(crate) async fn fetch_account_snapshot(
    fetcher: &BoundedFetcher,
    ctx: &PassContext,
) -> Result<AccountSnapshot> {
    let remote = fetcher.remote().clone();
    let profile = retry_with_backoff(fetcher.policy(), &ctx.cancel, "get_profile", || {
        remote.get_profile()
    })
    .await?;
    let aliases: Vec<Alias> = retry_with_backoff(fetcher.policy(), &ctx.cancel, "list_aliases", || {
        remote.list_aliases()
    })
    .await?;

    let primary = normalize_email(&profile.email);
    let mut alias_emails: Vec<String> = aliases
        .iter()
        .map(|a| normalize_email(&a.email))
        .filter(|a| !a.is_empty() && *a != primary)
        .collect();
    alias_emails.sort();
    alias_emails.dedup();

    Ok(AccountSnapshot {
        profile,
        aliases: alias_emails,
    })
}

/// Runs the initial sync.
#[derive(Clone)]
pub struct InitialSync {
    fetcher: BoundedFetcher,
    settings: SyncSettings,
    attachments: Arc<dyn AttachmentQueue>,
}

impl InitialSync {
    /// Creates the orchestrator.
    pub fn new(
        fetcher: BoundedFetcher,
        settings: SyncSettings,
        attachments: Arc<dyn AttachmentQueue>,
    ) -> Self {
        Self {
            fetcher,
            settings,
            attachments,
        }
    }

    /// Backfills everything received since install, minus a buffer.
    ///
    /// Writes happen in one unit of work. On error it is rolled back; on
    /// cancellation what was stored is committed without the cursor.
    pub async fn run(
        &self,
        db: &Database,
        ctx: &PassContext,
        installed_at: Option<DateTime<Utc>>,
    ) -> Result<PassReport> {
        let started = Instant::now();
        ctx.progress.report(0.0, "Fetching account");

        let snapshot = fetch_account_snapshot(&self.fetcher, ctx).await?;
        let remote = self.fetcher.remote().clone();
        let remote_labels: Vec<Label> =
            retry_with_backoff(self.fetcher.policy(), &ctx.cancel, "list_labels", || {
                remote.list_labels()
            })
            .await?;

        let mut uow = db.begin_unit().await?;
        let result = self
            .run_in(&mut uow, ctx, snapshot, remote_labels, installed_at)
            .await;
        let (mut report, with_attachments) = finish_unit(&mut uow, result).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        spawn_attachment_follow_up(self.attachments.clone(), with_attachments);
        Ok(report)
    }

    async fn run_in(
        &self,
        uow: &mut UnitOfWork,
        ctx: &PassContext,
        snapshot: AccountSnapshot,
        remote_labels: Vec<Label>,
        installed_at: Option<DateTime<Utc>>,
    ) -> Result<(PassReport, Vec<MessageId>)> {
        let mut report = PassReport::new(PassKind::Initial);
        let cursor = snapshot.profile.cursor;

        let email = snapshot.profile.email.clone();
        let aliases = snapshot.aliases.clone();
        let stored: Account = uow
            .run(move |conn| {
                let before = account::get(conn)?.and_then(|a| a.history_cursor);
                account::save_identity(conn, &email, &aliases)?;
                if let Some(at) = installed_at {
                    account::record_install(conn, &at)?;
                }
                labels::upsert_all(conn, &remote_labels)?;
                let mut stored = account::get(conn)?
                    .ok_or_else(|| DatabaseError::NotFound("account".into()))?;
                stored.history_cursor = before;
                Ok(stored)
            })
            .await?;
        report.cursor_before = stored.history_cursor;

        let pipeline = PassPipeline::new(self.fetcher.clone(), stored.identity(), &self.settings);

        let cleanup = CleanupService::new(pipeline.resolver().clone());
        let cleaned = uow.run(move |conn| cleanup.run(conn)).await?;
        report.merged += cleaned.merged;
        ctx.tracker.record_all(cleaned.touched);

        let since = match stored.installed_at {
            Some(at) => at - Duration::seconds(self.settings.install_buffer_secs),
            None => Utc::now() - Duration::days(self.settings.initial_fallback_days),
        };
        ctx.progress.report(0.05, "Listing messages");
        let ids = pipeline.list_ids(ctx, &after_query(since), None).await?;
        info!(count = ids.len(), since = %since, "initial sync listed messages");
        ctx.progress.report(0.1, format!("Found {} messages", ids.len()));

        let ingest = pipeline
            .ingest(uow, ctx, &ids, MessageFormat::Full, (0.1, 0.9))
            .await?;
        report.fetched = ingest.stored;
        report.failed = ingest.failed.iter().map(|f| f.id.clone()).collect();

        let cancelled = ingest.cancelled || ctx.is_cancelled();
        let mode = if cancelled {
            CursorMode::Hold
        } else {
            // A full backfill counts as a reconcile sweep.
            uow.run(|conn| meta::set_ts(conn, meta::LAST_RECONCILE_AT, &Utc::now()))
                .await?;
            CursorMode::Tracked(cursor)
        };
        ctx.progress.report(0.9, "Saving");
        let finalized = pipeline
            .finalize(uow, ctx, ingest.failure_reasons(), mode)
            .await?;

        report.rollups = finalized.rollups.updated;
        report.cursor_after = finalized.cursor_after;
        report.cursor_advanced = finalized.advanced;
        report.cancelled = cancelled;
        if let Some(CursorDecision::AdvanceAfterAbandoning { abandoned }) = finalized.decision {
            report.abandoned = abandoned;
        }
        if !cancelled {
            ctx.progress.report(1.0, "Sync complete");
        }

        info!(
            fetched = report.fetched,
            failed = report.failed.len(),
            cursor_advanced = report.cursor_advanced,
            cancelled,
            "initial sync finished"
        );
        Ok((report, ingest.with_attachments))
    }
}
