//! Pass reports and progress events.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{HistoryCursor, MessageId};

/// Capacity of the event channel. Slow subscribers lag rather than block.
const EVENT_CHANNEL_SIZE: usize = 100;

/// Which orchestration ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    /// Full backfill.
    Initial,
    /// Delta feed pass.
    Incremental,
    /// Windowed refetch after the cursor expired.
    Recovery,
    /// Manual retry of abandoned messages.
    RetryAbandoned,
}

impl std::fmt::Display for PassKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Incremental => "incremental",
            Self::Recovery => "recovery",
            Self::RetryAbandoned => "retry_abandoned",
        };
        f.write_str(name)
    }
}

/// Summary of a finished or cancelled pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassReport {
    /// Pass kind.
    pub kind: PassKind,
    /// Messages fetched and upserted.
    pub fetched: usize,
    /// Messages still failing at the end of the pass.
    pub failed: Vec<MessageId>,
    /// Messages deleted locally.
    pub deleted: usize,
    /// Label changes written from the remote.
    pub label_changes: usize,
    /// Conversations merged away.
    pub merged: usize,
    /// Conversations whose rollups were recomputed.
    pub rollups: usize,
    /// Ids moved to the abandoned list by this pass.
    pub abandoned: Vec<MessageId>,
    /// Stored cursor when the pass began.
    pub cursor_before: Option<HistoryCursor>,
    /// Stored cursor after commit.
    pub cursor_after: Option<HistoryCursor>,
    /// Whether this pass wrote the cursor.
    pub cursor_advanced: bool,
    /// Whether the pass stopped early on request.
    pub cancelled: bool,
    /// Wall time.
    pub duration_ms: u64,
}

impl PassReport {
    /// An empty report for a pass of `kind`.
    pub fn new(kind: PassKind) -> Self {
        Self {
            kind,
            fetched: 0,
            failed: Vec::new(),
            deleted: 0,
            label_changes: 0,
            merged: 0,
            rollups: 0,
            abandoned: Vec::new(),
            cursor_before: None,
            cursor_after: None,
            cursor_advanced: false,
            cancelled: false,
            duration_ms: 0,
        }
    }
}

/// Event emitted by the sync coordinator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A pass started.
    Started(PassKind),
    /// Progress within the running pass.
    Progress {
        /// Fraction done in `[0, 1]`, never decreasing within a pass.
        fraction: f32,
        /// Short status line.
        status: String,
    },
    /// A pass committed.
    Completed(PassReport),
    /// A pass stopped early and committed what it had.
    Cancelled(PassReport),
    /// A pass failed and rolled back.
    Failed {
        /// Pass kind.
        kind: PassKind,
        /// Short status line.
        status: String,
        /// Full error text.
        error: String,
    },
}

/// Sends progress for one pass.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: broadcast::Sender<SyncEvent>,
    // f32 bits of the last fraction sent.
    last: Arc<AtomicU32>,
}

impl ProgressReporter {
    /// Creates a reporter with its own channel.
    pub fn channel() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self::new(sender)
    }

    /// Creates a reporter on an existing channel.
    pub fn new(sender: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            sender,
            last: Arc::new(AtomicU32::new(0f32.to_bits())),
        }
    }

    /// The underlying channel.
    pub fn sender(&self) -> broadcast::Sender<SyncEvent> {
        self.sender.clone()
    }

    /// Subscribes to events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Reports progress. Values are clamped and never move backwards.
    pub fn report(&self, fraction: f32, status: impl Into<String>) {
        let requested = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
                Some(f32::from_bits(bits).max(requested).to_bits())
            })
            .map(f32::from_bits)
            .unwrap_or(requested);
        let fraction = previous.max(requested);

        let _ = self.sender.send(SyncEvent::Progress {
            fraction,
            status: status.into(),
        });
    }

    /// Last fraction reported.
    pub fn fraction(&self) -> f32 {
        f32::from_bits(self.last.load(Ordering::SeqCst))
    }

    /// Sends a non-progress event.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped_and_monotonic() {
        let reporter = ProgressReporter::channel();
        let mut rx = reporter.subscribe();

        reporter.report(0.5, "halfway");
        reporter.report(0.2, "behind");
        reporter.report(7.0, "over");

        let fractions: Vec<f32> = std::iter::from_fn(|| match rx.try_recv() {
            Ok(SyncEvent::Progress { fraction, .. }) => Some(fraction),
            _ => None,
        })
        .collect();
        assert_eq!(fractions, vec![0.5, 0.5, 1.0]);
        assert_eq!(reporter.fraction(), 1.0);
    }

    #[test]
    fn pass_kind_names() {
        assert_eq!(PassKind::RetryAbandoned.to_string(), "retry_abandoned");
    }
}
