use std::hash::Hash;
use std::sync::{Arc, RwLock};

use dashmap::DashSet;

/// Keys written by user code while a rebalance is in progress.
///
/// Writes to this set happen on every hot-path put from unrelated threads, so
/// the set itself is a lock-free `DashSet`. What *does* need a lock is the
/// reference to "the current set, if any" — it is replaced wholesale when a
/// rebalance starts and cleared wholesale when state application stops.
pub struct UpdatedKeysHolder<K: Eq + Hash + Send + Sync + 'static> {
    current: RwLock<Option<Arc<DashSet<K>>>>,
}

impl<K: Eq + Hash + Send + Sync + 'static> Default for UpdatedKeysHolder<K> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }
}

impl<K: Eq + Hash + Send + Sync + 'static> UpdatedKeysHolder<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh, empty set and installs it, under the same lock
    /// window that swaps in the new topology.
    pub fn install_fresh(&self) {
        let mut guard = self.current.write().unwrap();
        *guard = Some(Arc::new(DashSet::new()));
    }

    /// Stops state-transfer bookkeeping: drops the reference to the set so
    /// no further writes are tracked. Called once all chunks have been
    /// applied (`stop_applying_state`) — see the coupling note on
    /// `is_key_updated` below.
    pub fn clear(&self) {
        let mut guard = self.current.write().unwrap();
        *guard = None;
    }

    /// Snapshot the current set, if any, as an `Arc` clone taken under the
    /// lock. Readers must use this snapshot rather than re-reading `current`
    /// later, so that a concurrent `clear()` cannot be observed mid-check.
    fn snapshot(&self) -> Option<Arc<DashSet<K>>> {
        self.current.read().unwrap().clone()
    }

    pub fn add_updated_key(&self, key: K) {
        if let Some(set) = self.snapshot() {
            set.insert(key);
        }
    }

    /// `true` if `key` was written by user code since the current rebalance
    /// began, **or** if no rebalance is in progress at all.
    ///
    /// That second case looks backwards — surely "no rebalance" should mean
    /// "nothing is updated" — but it is exactly what makes the State Applier
    /// safe to call unconditionally: once `stop_applying_state` has cleared
    /// the set, every further call here returns `true`, which the applier
    /// reads as "skip this write". `stop_applying_state` is only ever called
    /// after the last chunk has been applied, so the two facts — no chunks
    /// left to apply, and this predicate now always skipping — never need to
    /// race each other. See DESIGN.md, Open Question resolution.
    pub fn is_key_updated(&self, key: &K) -> bool {
        match self.snapshot() {
            Some(set) => set.contains(key),
            None => true,
        }
    }

    /// Runs `callback` only if `key` has *not* been touched by a user write
    /// during the current rebalance; used by the applier to gate a put.
    pub fn execute_if_key_is_not_updated(&self, key: &K, callback: impl FnOnce()) {
        if !self.is_key_updated(key) {
            callback();
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.read().unwrap().is_some()
    }
}
