//! Sync coordinator.
//!
//! The [`SyncCoordinator`] is the entry point of the engine. It guarantees
//! that at most one pass runs at a time, owns the cancellation token of the
//! running pass, and broadcasts [`SyncEvent`]s to subscribers.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::error::{Result, SyncError};
use super::failure_tracker::FailureTracker;
use super::fetcher::BoundedFetcher;
use super::incremental_sync::IncrementalSync;
use super::initial_sync::InitialSync;
use super::pipeline::{
    finish_unit, AttachmentQueue, CursorMode, LoggingAttachmentQueue, PassContext, PassPipeline,
};
use super::progress::{PassKind, PassReport, ProgressReporter, SyncEvent};
use crate::config::{Settings, SyncSettings};
use crate::domain::{AbandonedSyncMessage, MessageId};
use crate::providers::mail::{MessageFormat, RemoteMailClient};
use crate::storage::queries::{abandoned, account, messages};
use crate::storage::{Database, UnitOfWork};

/// Status of the last pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No pass has run since startup.
    Never,
    /// A pass is running.
    InProgress,
    /// The last pass committed.
    Success,
    /// The last pass was cancelled.
    Cancelled,
    /// The last pass failed.
    Failed,
}

/// Result of asking for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another pass was already running; nothing was done.
    Skipped,
    /// The pass committed.
    Completed(PassReport),
    /// The pass stopped early on request.
    Cancelled(PassReport),
}

#[derive(Debug)]
struct Running {
    kind: PassKind,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct CoordinatorState {
    running: Option<Running>,
    last_status: SyncStatus,
    last_report: Option<PassReport>,
}

/// Clears the running slot when the pass ends, however it ends.
struct PassGuard {
    state: Arc<Mutex<CoordinatorState>>,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        lock(&self.state).running = None;
    }
}

fn lock(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Single-flight entry point for every sync pass.
///
/// # Example
///
/// ```ignore
/// let coordinator = SyncCoordinator::new(db, remote, &settings);
/// let mut events = coordinator.subscribe();
///
/// coordinator.perform_initial_sync(Some(installed_at)).await?;
/// coordinator.perform_incremental_sync().await?;
/// ```
pub struct SyncCoordinator {
    db: Database,
    fetcher: BoundedFetcher,
    settings: SyncSettings,
    initial: InitialSync,
    incremental: IncrementalSync,
    state: Arc<Mutex<CoordinatorState>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    /// Creates a coordinator that logs attachment follow-ups.
    pub fn new(db: Database, remote: Arc<dyn RemoteMailClient>, settings: &Settings) -> Self {
        Self::with_attachment_queue(db, remote, settings, Arc::new(LoggingAttachmentQueue))
    }

    /// Creates a coordinator handing attachment work to `attachments`.
    pub fn with_attachment_queue(
        db: Database,
        remote: Arc<dyn RemoteMailClient>,
        settings: &Settings,
        attachments: Arc<dyn AttachmentQueue>,
    ) -> Self {
        let fetcher = BoundedFetcher::new(remote, &settings.fetch);
        let events = ProgressReporter::channel();
        Self {
            initial: InitialSync::new(fetcher.clone(), settings.sync.clone(), attachments.clone()),
            incremental: IncrementalSync::new(fetcher.clone(), settings.sync.clone(), attachments),
            db,
            fetcher,
            settings: settings.sync.clone(),
            state: Arc::new(Mutex::new(CoordinatorState {
                running: None,
                last_status: SyncStatus::Never,
                last_report: None,
            })),
            events: events.sender(),
        }
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Runs a full backfill.
    ///
    /// `installed_at` bounds how far back the backfill reaches; only the
    /// first value ever supplied is kept.
    pub async fn perform_initial_sync(
        &self,
        installed_at: Option<DateTime<Utc>>,
    ) -> Result<SyncOutcome> {
        self.run_pass(PassKind::Initial, |ctx| async move {
            self.initial.run(&self.db, &ctx, installed_at).await
        })
        .await
    }

    /// Applies the delta since the stored cursor, recovering if it expired.
    pub async fn perform_incremental_sync(&self) -> Result<SyncOutcome> {
        self.run_pass(PassKind::Incremental, |ctx| async move {
            self.incremental.run(&self.db, &ctx).await
        })
        .await
    }

    /// Fetches abandoned messages again. The cursor is not touched.
    pub async fn retry_abandoned(&self) -> Result<SyncOutcome> {
        self.run_pass(PassKind::RetryAbandoned, |ctx| async move {
            self.retry_abandoned_pass(&ctx).await
        })
        .await
    }

    /// Requests cancellation of the running pass.
    ///
    /// Returns false if nothing was running.
    pub fn cancel_sync(&self) -> bool {
        match &lock(&self.state).running {
            Some(running) => {
                info!(kind = %running.kind, "cancelling sync");
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// True while a pass runs.
    pub fn is_syncing(&self) -> bool {
        lock(&self.state).running.is_some()
    }

    /// Status of the running or last pass.
    pub fn status(&self) -> SyncStatus {
        let state = lock(&self.state);
        if state.running.is_some() {
            SyncStatus::InProgress
        } else {
            state.last_status
        }
    }

    /// The running pass and when it started.
    pub fn running_pass(&self) -> Option<(PassKind, DateTime<Utc>)> {
        lock(&self.state)
            .running
            .as_ref()
            .map(|r| (r.kind, r.started_at))
    }

    /// Report of the last pass that finished.
    pub fn last_report(&self) -> Option<PassReport> {
        lock(&self.state).last_report.clone()
    }

    /// Messages sync gave up on.
    pub async fn abandoned_messages(&self) -> Result<Vec<AbandonedSyncMessage>> {
        Ok(self.db.with_conn(abandoned::list).await?)
    }

    /// Number of abandoned messages.
    pub async fn abandoned_count(&self) -> Result<u32> {
        Ok(self.db.with_conn(abandoned::count).await?)
    }

    /// When a pass last advanced the cursor.
    pub async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .db
            .with_conn(account::get)
            .await?
            .and_then(|a| a.last_successful_sync))
    }

    /// Failed passes in a row.
    pub async fn consecutive_failures(&self) -> Result<u32> {
        Ok(self
            .db
            .with_conn(|conn| FailureTracker::consecutive_failures(conn))
            .await?)
    }

    fn try_begin(&self, kind: PassKind) -> Option<(PassGuard, CancellationToken)> {
        let mut state = lock(&self.state);
        if let Some(running) = &state.running {
            debug!(requested = %kind, running = %running.kind, "sync already running, skipping");
            return None;
        }
        let cancel = CancellationToken::new();
        state.running = Some(Running {
            kind,
            started_at: Utc::now(),
            cancel: cancel.clone(),
        });
        Some((
            PassGuard {
                state: self.state.clone(),
            },
            cancel,
        ))
    }

    async fn run_pass<F, Fut>(&self, kind: PassKind, pass: F) -> Result<SyncOutcome>
    where
        F: FnOnce(PassContext) -> Fut,
        Fut: Future<Output = Result<PassReport>>,
    {
        let Some((_guard, cancel)) = self.try_begin(kind) else {
            return Ok(SyncOutcome::Skipped);
        };

        let ctx = PassContext::new(cancel, ProgressReporter::new(self.events.clone()));
        info!(kind = %kind, "sync started");
        ctx.progress.emit(SyncEvent::Started(kind));

        let result = match pass(ctx.clone()).await {
            // Interrupted remote calls surface their last error; report the cancel.
            Err(SyncError::Remote(_)) if ctx.is_cancelled() => Err(SyncError::Cancelled),
            other => other,
        };

        let (status, outcome) = match result {
            Ok(report) if report.cancelled => {
                ctx.progress.emit(SyncEvent::Cancelled(report.clone()));
                (SyncStatus::Cancelled, Ok(SyncOutcome::Cancelled(report)))
            }
            Ok(report) => {
                ctx.progress.emit(SyncEvent::Completed(report.clone()));
                (SyncStatus::Success, Ok(SyncOutcome::Completed(report)))
            }
            Err(SyncError::Cancelled) => {
                let mut report = PassReport::new(kind);
                report.cancelled = true;
                ctx.progress.emit(SyncEvent::Cancelled(report.clone()));
                (SyncStatus::Cancelled, Ok(SyncOutcome::Cancelled(report)))
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "sync failed");
                ctx.progress.emit(SyncEvent::Failed {
                    kind,
                    status: e.status_text(),
                    error: e.to_string(),
                });
                (SyncStatus::Failed, Err(e))
            }
        };

        let mut state = lock(&self.state);
        state.last_status = status;
        if let Ok(SyncOutcome::Completed(report) | SyncOutcome::Cancelled(report)) = &outcome {
            state.last_report = Some(report.clone());
        }
        outcome
    }

    async fn retry_abandoned_pass(&self, ctx: &PassContext) -> Result<PassReport> {
        let started = std::time::Instant::now();
        let stored = self
            .db
            .with_conn(account::get)
            .await?
            .ok_or(SyncError::AccountNotInitialized)?;
        let pending: Vec<MessageId> = self
            .db
            .with_conn(abandoned::list)
            .await?
            .into_iter()
            .map(|a| a.message_id)
            .collect();

        let mut report = PassReport::new(PassKind::RetryAbandoned);
        report.cursor_before = stored.history_cursor;
        report.cursor_after = stored.history_cursor;
        if pending.is_empty() {
            return Ok(report);
        }

        let pipeline = PassPipeline::new(self.fetcher.clone(), stored.identity(), &self.settings);
        let mut uow = self.db.begin_unit().await?;
        let result = retry_in(&pipeline, &mut uow, ctx, pending, report).await;
        let mut report = finish_unit(&mut uow, result).await?;
        report.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }
}

async fn retry_in(
    pipeline: &PassPipeline,
    uow: &mut UnitOfWork,
    ctx: &PassContext,
    pending: Vec<MessageId>,
    mut report: PassReport,
) -> Result<PassReport> {
    info!(count = pending.len(), "retrying abandoned messages");
    let ingest = pipeline
        .ingest(uow, ctx, &pending, MessageFormat::Full, (0.0, 0.9))
        .await?;
    report.fetched = ingest.stored;
    report.failed = ingest.failed.iter().map(|f| f.id.clone()).collect();
    report.cancelled = ingest.cancelled || ctx.is_cancelled();

    let reasons = ingest.failure_reasons();
    uow.run(move |conn| {
        let present = messages::existing_ids(conn, &pending)?;
        for id in pending.iter().filter(|id| present.contains(*id)) {
            abandoned::remove(conn, id)?;
        }
        for (id, reason) in &reasons {
            abandoned::record_retry_failure(conn, id, reason)?;
        }
        Ok(())
    })
    .await?;

    let finalized = pipeline.finalize(uow, ctx, Vec::new(), CursorMode::Hold).await?;
    report.rollups = finalized.rollups.updated;
    if !report.cancelled {
        ctx.progress.report(1.0, "Retry complete");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HistoryCursor, Profile};
    use crate::providers::mail::MockRemoteMailClient;
    use std::time::Duration;

    async fn coordinator(remote: MockRemoteMailClient) -> SyncCoordinator {
        let db = Database::open_in_memory().await.unwrap();
        SyncCoordinator::new(db, Arc::new(remote), &Settings::default())
    }

    #[tokio::test]
    async fn incremental_without_account_fails() {
        let coordinator = coordinator(MockRemoteMailClient::new()).await;
        let mut events = coordinator.subscribe();

        let result = coordinator.perform_incremental_sync().await;

        assert!(matches!(result, Err(SyncError::AccountNotInitialized)));
        assert_eq!(coordinator.status(), SyncStatus::Failed);
        assert!(!coordinator.is_syncing());
        assert!(matches!(events.recv().await, Ok(SyncEvent::Started(PassKind::Incremental))));
        assert!(matches!(events.recv().await, Ok(SyncEvent::Failed { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_pass_is_skipped_while_one_runs() {
        let mut remote = MockRemoteMailClient::new();
        remote.expect_get_profile().returning(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Profile {
                email: "me@example.com".into(),
                cursor: HistoryCursor(5),
            })
        });
        remote.expect_list_aliases().returning(|| Ok(vec![]));
        remote.expect_list_labels().returning(|| Ok(vec![]));
        remote.expect_list_messages().returning(|_, _| Ok(Default::default()));

        let coordinator = Arc::new(coordinator(remote).await);
        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.perform_initial_sync(None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = coordinator.perform_initial_sync(None).await.unwrap();
        assert_eq!(second, SyncOutcome::Skipped);

        let first = first.await.unwrap().unwrap();
        match first {
            SyncOutcome::Completed(report) => {
                assert!(report.cursor_advanced);
                assert_eq!(report.cursor_after, Some(HistoryCursor(5)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(coordinator.status(), SyncStatus::Success);
    }

    #[tokio::test]
    async fn cancel_without_running_pass_is_noop() {
        let coordinator = coordinator(MockRemoteMailClient::new()).await;
        assert!(!coordinator.cancel_sync());
        assert_eq!(coordinator.status(), SyncStatus::Never);
    }
}
