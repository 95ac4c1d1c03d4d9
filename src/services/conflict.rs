//! Local-versus-remote conflict policy.
//!
//! A message carries `local_modified_at` while a user edit has not been
//! confirmed by the remote. Remote label state is applied unless that edit
//! happened after the pass started and is still fresh.

use chrono::{DateTime, Duration, Utc};

/// What to do with a remote label change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// No pending local edit blocks the change.
    ApplyRemote,
    /// A pending edit existed but went stale; apply and clear the marker.
    ApplyOverStaleEdit,
    /// A fresh local edit wins; skip the remote change.
    KeepLocal,
}

impl ConflictDecision {
    /// True if the remote change should be written.
    pub fn applies_remote(self) -> bool {
        !matches!(self, Self::KeepLocal)
    }

    /// True if the local edit marker should be cleared.
    pub fn clears_marker(self) -> bool {
        matches!(self, Self::ApplyOverStaleEdit)
    }
}

/// The single staleness rule used by every remote write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictPolicy {
    staleness: Duration,
}

impl ConflictPolicy {
    /// Creates a policy with the given staleness window.
    pub fn new(staleness: Duration) -> Self {
        Self { staleness }
    }

    /// Staleness window.
    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Decides between a pending local edit and remote state.
    pub fn decide(
        &self,
        local_modified_at: Option<DateTime<Utc>>,
        sync_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> ConflictDecision {
        let Some(modified) = local_modified_at else {
            return ConflictDecision::ApplyRemote;
        };
        if modified <= sync_start {
            return ConflictDecision::ApplyRemote;
        }
        // Absolute age, so a future-dated marker from clock skew still expires.
        let age = if now >= modified {
            now - modified
        } else {
            modified - now
        };
        if age > self.staleness {
            ConflictDecision::ApplyOverStaleEdit
        } else {
            ConflictDecision::KeepLocal
        }
    }
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(30))
    }
}
