//! Per-pass accumulator of touched conversations.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::ConversationId;

/// Collects the conversations a pass modified so rollups are recomputed for
/// exactly those, never by scanning the store.
///
/// Cheap to clone; clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct ModificationTracker {
    touched: Arc<Mutex<BTreeSet<ConversationId>>>,
}

impl ModificationTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one conversation.
    pub fn record(&self, id: ConversationId) {
        self.lock().insert(id);
    }

    /// Records several conversations.
    pub fn record_all(&self, ids: impl IntoIterator<Item = ConversationId>) {
        self.lock().extend(ids);
    }

    /// Takes every recorded id, leaving the tracker empty.
    pub fn drain_all(&self) -> Vec<ConversationId> {
        std::mem::take(&mut *self.lock()).into_iter().collect()
    }

    /// Number of recorded ids.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<ConversationId>> {
        // The set is valid after any panic mid-insert.
        self.touched.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_empties_and_dedupes() {
        let tracker = ModificationTracker::new();
        tracker.record(ConversationId::from("b"));
        tracker.record_all([ConversationId::from("a"), ConversationId::from("b")]);

        assert_eq!(tracker.len(), 2);
        assert_eq!(
            tracker.drain_all(),
            vec![ConversationId::from("a"), ConversationId::from("b")]
        );
        assert!(tracker.is_empty());
        assert!(tracker.drain_all().is_empty());
    }

    #[tokio::test]
    async fn clones_share_state_across_tasks() {
        let tracker = ModificationTracker::new();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.record(ConversationId(format!("c{}", i % 4))) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.drain_all().len(), 4);
    }
}
