use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::task::AbortHandle;

use super::resolution::Resolution;
use crate::value::Value;

/// A subscriber callback, invoked on every state transition of its entry.
pub(crate) type Listener = Arc<dyn Fn() + Send + Sync>;

/// A scheduled task owned by an entry, aborted when replaced or dropped.
pub(crate) struct ScheduledTask(AbortHandle);

impl ScheduledTask {
    pub(crate) fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One cache slot: the resolution history and subscriber set for a single
/// variables value.
pub(crate) struct Entry {
    pub(crate) variables: Value,
    /// Source of resolution ordering; strictly increasing per entry.
    pub(crate) next_resolution_id: u64,
    /// Resolutions with an id below this are stale; bumped on invalidation.
    pub(crate) expected_resolution_id: u64,
    pub(crate) resolutions: FxHashMap<u64, Resolution>,
    pub(crate) subscriptions: FxHashMap<u64, Listener>,
    /// The most recent successfully resolved payload, kept across
    /// resolutions so reads can structurally share against it.
    pub(crate) cached_data: Option<Value>,
    /// Consecutive rejected settlements at the top of the id order. Tracked
    /// explicitly because resolution collection prunes the history.
    pub(crate) rejected_streak: u64,
    pub(crate) revalidate_timer: Option<ScheduledTask>,
    pub(crate) retry_timer: Option<ScheduledTask>,
}

impl Entry {
    pub(crate) fn new(variables: Value) -> Self {
        Entry {
            variables,
            next_resolution_id: 0,
            expected_resolution_id: 0,
            resolutions: FxHashMap::default(),
            subscriptions: FxHashMap::default(),
            cached_data: None,
            rejected_streak: 0,
            revalidate_timer: None,
            retry_timer: None,
        }
    }

    /// Id of the newest resolution, if any.
    pub(crate) fn newest_id(&self) -> Option<u64> {
        self.resolutions.keys().copied().max()
    }

    pub(crate) fn newest(&self) -> Option<&Resolution> {
        self.resolutions
            .values()
            .max_by_key(|resolution| resolution.id())
    }

    /// Newest settled resolution by id; the authoritative outcome.
    pub(crate) fn newest_settled(&self) -> Option<&Resolution> {
        self.resolutions
            .values()
            .filter(|resolution| resolution.is_settled())
            .max_by_key(|resolution| resolution.id())
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.newest_id()
            .is_some_and(|id| id >= self.expected_resolution_id)
    }

    pub(crate) fn listeners(&self) -> Vec<Listener> {
        self.subscriptions.values().cloned().collect()
    }

    /// Drops every resolution strictly older (by id) than the newest settled
    /// one. Pending resolutions and the newest settled resolution survive.
    pub(crate) fn collect_resolutions(&mut self) {
        let Some(cutoff) = self.newest_settled().map(Resolution::id) else {
            return;
        };
        self.resolutions
            .retain(|&id, resolution| id >= cutoff || resolution.is_pending());
    }

    /// An entry is collectable once nothing subscribes to it and every
    /// resolution has been settled for at least the revalidation window.
    pub(crate) fn is_collectable(&self, revalidate_after: Duration) -> bool {
        self.subscriptions.is_empty()
            && self.resolutions.values().all(|resolution| {
                resolution
                    .settled_at()
                    .is_some_and(|at| at.elapsed() >= revalidate_after)
            })
    }
}
