//! Associative index of live materializations.
//!
//! Maps [`Fingerprint`] to the currently indexed handle. The index performs
//! no eviction of its own: entries leave only by displacement on
//! [`CacheIndex::insert`] or through the explicit removal methods, and the
//! manager runs the destroy-or-park decision for every removal. Weight
//! bounding is driven by the evictor, which ranks a [`CacheIndex::snapshot`]
//! and invalidates its victims through [`CacheIndex::remove_many`].
//!
//! Removal visitors run **under the index lock**. That ordering is what
//! lets a late `done` find its handle: by the time the index lock is
//! released, a removed-but-referenced handle is already parked in the
//! pending-delete table, so a release that misses the index is guaranteed
//! to see it there. Visitors must not call into the catalog or monitor.

use std::collections::HashMap;
use std::sync::Arc;

use matcache_types::Fingerprint;
use parking_lot::Mutex;

use crate::materialization::Materialization;

/// Why an entry left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Selected as a victim while making headroom for a new admission.
    Evicted,
    /// Explicitly invalidated: stale entry or administrative removal.
    Explicit,
    /// Displaced by a newer materialization admitted under the same
    /// fingerprint.
    Replaced,
}

/// Fingerprint → handle map with removal visitors.
pub struct CacheIndex {
    entries: Mutex<HashMap<Fingerprint, Arc<Materialization>>>,
}

impl CacheIndex {
    /// Create an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The currently indexed handle for `fp`, if any. Does not change the
    /// reference count.
    #[must_use]
    pub fn get(&self, fp: &Fingerprint) -> Option<Arc<Materialization>> {
        self.entries.lock().get(fp).cloned()
    }

    /// Make `value` the indexed entry for its fingerprint, returning the
    /// displaced entry if one existed.
    ///
    /// The displaced entry is *not* destroyed or parked here: it remains
    /// reachable through outstanding references, and the producer of the
    /// newer materialization owns its cleanup.
    pub fn insert(&self, value: Arc<Materialization>) -> Option<Arc<Materialization>> {
        self.entries.lock().insert(value.identifier(), value)
    }

    /// Remove `fp` if the predicate accepts the current entry, invoking
    /// `on_removed` under the index lock. Returns whether an entry was
    /// removed.
    pub fn remove_if<P, F>(&self, fp: &Fingerprint, predicate: P, on_removed: F) -> bool
    where
        P: FnOnce(&Arc<Materialization>) -> bool,
        F: FnOnce(&Fingerprint, &Arc<Materialization>),
    {
        let mut entries = self.entries.lock();
        let Some(current) = entries.get(fp) else {
            return false;
        };
        if !predicate(current) {
            return false;
        }
        let removed = entries.remove(fp).expect("entry checked above");
        on_removed(fp, &removed);
        true
    }

    /// Remove each of `fps`, invoking `on_removed` for every entry found,
    /// under the index lock. Returns the number of entries removed.
    pub fn remove_many<F>(&self, fps: &[Fingerprint], mut on_removed: F) -> usize
    where
        F: FnMut(&Fingerprint, &Arc<Materialization>),
    {
        let mut entries = self.entries.lock();
        let mut removed = 0;
        for fp in fps {
            if let Some(handle) = entries.remove(fp) {
                on_removed(fp, &handle);
                removed += 1;
            }
        }
        removed
    }

    /// Remove every entry, invoking `on_removed` for each, under the index
    /// lock.
    pub fn remove_all<F>(&self, mut on_removed: F) -> usize
    where
        F: FnMut(&Fingerprint, &Arc<Materialization>),
    {
        let mut entries = self.entries.lock();
        let drained: Vec<_> = entries.drain().collect();
        for (fp, handle) in &drained {
            on_removed(fp, handle);
        }
        drained.len()
    }

    /// Run `f` on the current entry for `fp`, under the index lock.
    ///
    /// Commit-time weight accounting uses this to serialize against the
    /// removal visitors: an entry is credited-and-marked-committed or
    /// removed-and-debited, never half of each. `f` must not call back
    /// into the index or into the catalog/monitor.
    pub fn with_entry<F, R>(&self, fp: &Fingerprint, f: F) -> Option<R>
    where
        F: FnOnce(&Arc<Materialization>) -> R,
    {
        self.entries.lock().get(fp).map(f)
    }

    /// Point-in-time view of all entries, for eviction ranking and the
    /// administrative walk paths.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(Fingerprint, Arc<Materialization>)> {
        self.entries
            .lock()
            .iter()
            .map(|(fp, handle)| (*fp, Arc::clone(handle)))
            .collect()
    }

    /// Point-in-time view of the entries present among `fps`.
    #[must_use]
    pub fn snapshot_of(&self, fps: &[Fingerprint]) -> Vec<(Fingerprint, Arc<Materialization>)> {
        let entries = self.entries.lock();
        fps.iter()
            .filter_map(|fp| entries.get(fp).map(|handle| (*fp, Arc::clone(handle))))
            .collect()
    }

    /// Number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns `true` if no entries are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for CacheIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheIndex")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}
