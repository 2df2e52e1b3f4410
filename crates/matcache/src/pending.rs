//! Side table for handles evicted or invalidated while still referenced.
//!
//! An entry removed from the index with live holders cannot have its
//! backing table dropped yet. It parks here, keyed by fingerprint and
//! creation tick, until the release that brings its reference count to
//! zero performs teardown. The nested layout allows multiple pending
//! generations of the same fingerprint to coexist: an evicted handle can
//! still be draining while its successor is admitted, evicted, and parked
//! in turn.

use std::collections::HashMap;
use std::sync::Arc;

use matcache_types::{Fingerprint, Tick};
use parking_lot::Mutex;

use crate::materialization::Materialization;

/// `fingerprint → create_time → handle` for removed-but-referenced
/// materializations.
pub struct PendingDelete {
    entries: Mutex<HashMap<Fingerprint, HashMap<Tick, Arc<Materialization>>>>,
}

impl PendingDelete {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Park a handle under its `(fingerprint, create_time)` key.
    pub fn park(&self, handle: Arc<Materialization>) {
        self.entries
            .lock()
            .entry(handle.identifier())
            .or_default()
            .insert(handle.create_time(), handle);
    }

    /// The parked handle for `(fp, create_time)`, if any.
    #[must_use]
    pub fn get(&self, fp: &Fingerprint, create_time: Tick) -> Option<Arc<Materialization>> {
        self.entries
            .lock()
            .get(fp)
            .and_then(|generations| generations.get(&create_time))
            .cloned()
    }

    /// Remove the entry for `(fp, create_time)`, pruning the fingerprint's
    /// inner map when it empties. Returns the removed handle, if any.
    pub fn remove(&self, fp: &Fingerprint, create_time: Tick) -> Option<Arc<Materialization>> {
        let mut entries = self.entries.lock();
        let generations = entries.get_mut(fp)?;
        let removed = generations.remove(&create_time);
        if generations.is_empty() {
            entries.remove(fp);
        }
        removed
    }

    /// Total number of parked handles across all fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(HashMap::len)
            .sum()
    }

    /// Returns `true` if nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for PendingDelete {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PendingDelete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDelete")
            .field("parked", &self.len())
            .finish()
    }
}
