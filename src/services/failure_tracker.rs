//! Cross-pass failure accounting.
//!
//! A pass that leaves message fetches failing withholds the cursor so the
//! same delta is replayed next time. After `max_consecutive_failures` such
//! passes the accumulated ids are abandoned and the cursor moves on, so one
//! poisoned message cannot stall sync forever.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SyncSettings;
use crate::domain::MessageId;
use crate::storage::queries::{abandoned, messages, meta};
use crate::storage::Result;

/// A failed id as persisted between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TrackedFailure {
    id: MessageId,
    reason: String,
}

/// Whether the pass may move the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorDecision {
    /// No failures outstanding.
    Advance,
    /// Failures exceeded the limit; these ids were abandoned.
    AdvanceAfterAbandoning {
        /// Ids written to the abandoned list.
        abandoned: Vec<MessageId>,
    },
    /// Keep the old cursor so the delta is replayed.
    Withhold {
        /// Failed passes in a row, including this one.
        consecutive_failures: u32,
    },
}

impl CursorDecision {
    /// True if the cursor may be written.
    pub fn advances(&self) -> bool {
        !matches!(self, Self::Withhold { .. })
    }
}

/// Persists failure state in the sync metadata table.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    max_consecutive_failures: u32,
    max_tracked_ids: usize,
}

impl FailureTracker {
    /// Creates a tracker from sync settings.
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            max_consecutive_failures: settings.max_consecutive_failures.max(1),
            max_tracked_ids: settings.max_tracked_failed_ids.max(1),
        }
    }

    /// Records this pass's failures and decides whether the cursor moves.
    ///
    /// Must run inside the pass's unit of work so the counter commits with
    /// the data it describes.
    pub fn should_advance_cursor(
        &self,
        conn: &Connection,
        failures: &[(MessageId, String)],
        now: &DateTime<Utc>,
    ) -> Result<CursorDecision> {
        if failures.is_empty() {
            self.reset(conn)?;
            return Ok(CursorDecision::Advance);
        }

        let consecutive = meta::get_u32(conn, meta::CONSECUTIVE_FAILURES)?.saturating_add(1);
        let mut tracked: Vec<TrackedFailure> =
            meta::get_json(conn, meta::FAILED_IDS)?.unwrap_or_default();

        for (id, reason) in failures {
            tracked.retain(|t| &t.id != id);
            tracked.push(TrackedFailure {
                id: id.clone(),
                reason: reason.clone(),
            });
        }
        if tracked.len() > self.max_tracked_ids {
            let excess = tracked.len() - self.max_tracked_ids;
            tracked.drain(..excess);
        }

        if consecutive < self.max_consecutive_failures {
            meta::set(conn, meta::CONSECUTIVE_FAILURES, &consecutive.to_string())?;
            meta::set_json(conn, meta::FAILED_IDS, &tracked)?;
            warn!(
                consecutive,
                failed = failures.len(),
                tracked = tracked.len(),
                "withholding cursor after fetch failures"
            );
            return Ok(CursorDecision::Withhold {
                consecutive_failures: consecutive,
            });
        }

        // Ids that made it in through another path are no longer missing.
        let ids: Vec<MessageId> = tracked.iter().map(|t| t.id.clone()).collect();
        let present = messages::existing_ids(conn, &ids)?;
        let mut abandoned_ids = Vec::new();
        for failure in tracked.into_iter().filter(|t| !present.contains(&t.id)) {
            abandoned::upsert(conn, &failure.id, &failure.reason, now)?;
            abandoned_ids.push(failure.id);
        }
        self.reset(conn)?;

        info!(
            consecutive,
            abandoned = abandoned_ids.len(),
            "abandoning failed messages and advancing cursor"
        );
        Ok(CursorDecision::AdvanceAfterAbandoning {
            abandoned: abandoned_ids,
        })
    }

    /// Clears the counter and the tracked ids.
    pub fn reset(&self, conn: &Connection) -> Result<()> {
        meta::set(conn, meta::CONSECUTIVE_FAILURES, "0")?;
        meta::set_json(conn, meta::FAILED_IDS, &Vec::<TrackedFailure>::new())?;
        Ok(())
    }

    /// Failed passes in a row so far.
    pub fn consecutive_failures(conn: &Connection) -> Result<u32> {
        meta::get_u32(conn, meta::CONSECUTIVE_FAILURES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use pretty_assertions::assert_eq;

    fn tracker(max_failures: u32, max_ids: usize) -> FailureTracker {
        FailureTracker::new(&SyncSettings {
            max_consecutive_failures: max_failures,
            max_tracked_failed_ids: max_ids,
            ..SyncSettings::default()
        })
    }

    fn failure(id: &str) -> (MessageId, String) {
        (MessageId::from(id), "server error (503)".to_string())
    }

    #[tokio::test]
    async fn clean_pass_advances_and_resets() {
        let db = Database::open_in_memory().await.unwrap();
        let tracker = tracker(3, 10);

        let (first, second, count) = db
            .with_conn(move |conn| {
                let now = Utc::now();
                let first = tracker.should_advance_cursor(conn, &[failure("m1")], &now)?;
                let second = tracker.should_advance_cursor(conn, &[], &now)?;
                Ok((first, second, FailureTracker::consecutive_failures(conn)?))
            })
            .await
            .unwrap();

        assert_eq!(first, CursorDecision::Withhold { consecutive_failures: 1 });
        assert_eq!(second, CursorDecision::Advance);
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn third_failed_pass_abandons_and_advances() {
        let db = Database::open_in_memory().await.unwrap();
        let tracker = tracker(3, 10);

        let (decisions, abandoned_list) = db
            .with_conn(move |conn| {
                let now = Utc::now();
                let decisions = vec![
                    tracker.should_advance_cursor(conn, &[failure("m1")], &now)?,
                    tracker.should_advance_cursor(conn, &[failure("m2")], &now)?,
                    tracker.should_advance_cursor(conn, &[failure("m1")], &now)?,
                ];
                Ok((decisions, abandoned::list(conn)?))
            })
            .await
            .unwrap();

        assert!(!decisions[0].advances());
        assert!(!decisions[1].advances());
        match &decisions[2] {
            CursorDecision::AdvanceAfterAbandoning { abandoned } => {
                let mut ids: Vec<_> = abandoned.iter().map(|id| id.0.as_str()).collect();
                ids.sort();
                assert_eq!(ids, vec!["m1", "m2"]);
            }
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(abandoned_list.len(), 2);
    }

    #[tokio::test]
    async fn tracked_ids_are_capped_oldest_first() {
        let db = Database::open_in_memory().await.unwrap();
        let tracker = tracker(2, 2);

        let decision = db
            .with_conn(move |conn| {
                let now = Utc::now();
                tracker.should_advance_cursor(
                    conn,
                    &[failure("m1"), failure("m2"), failure("m3")],
                    &now,
                )?;
                tracker.should_advance_cursor(conn, &[failure("m3")], &now)
            })
            .await
            .unwrap();

        match decision {
            CursorDecision::AdvanceAfterAbandoning { abandoned } => {
                assert_eq!(abandoned, vec![MessageId::from("m2"), MessageId::from("m3")]);
            }
            other => panic!("unexpected decision {other:?}"),
        }
    }
}
