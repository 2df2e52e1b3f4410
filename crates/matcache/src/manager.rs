//! The cache manager: admission, lookup, commit accounting, pruning, and
//! the decoupled eviction/destruction lifecycle.
//!
//! # Control flow
//!
//! A query calls [`CteCacheManager::lookup`]; on a hit the handle is pinned
//! and returned, and the caller owes exactly one matching
//! [`CteCacheManager::done`]. On a miss the query materializes out of band,
//! [`CteCacheManager::put`]s the handle (pinned, registered with the
//! monitor), and later [`CteCacheManager::commit`]s it, which releases the
//! producer pin, pruning if the weight budget lacks headroom, then adding
//! the entry's weight and marking it committed, in that order. The ordering
//! matters: while the prune runs, the new entry is unreferenced but still
//! uncommitted, so it can never evict itself.
//!
//! # Eviction vs destruction
//!
//! Removal from the index and dropping the backing table are separate
//! events. Every removal (evicted or explicit) runs a destroy-or-park
//! decision under the per-handle guard: unreferenced handles tear down
//! synchronously; referenced ones park in [`PendingDelete`] until the
//! release that brings their count to zero. The backing-table drop happens
//! exactly once either way.
//!
//! Lock order is index → handle guard → pending-delete, and no internal
//! lock is ever held across a catalog or monitor call.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use matcache_types::{CacheConfig, Fingerprint, QueryIdGenerator, Session, Tick};

use crate::catalog::Catalog;
use crate::evictor;
use crate::index::{CacheIndex, RemovalCause};
use crate::materialization::{LeaveIndex, Materialization};
use crate::monitor::ValidityMonitor;
use crate::pending::PendingDelete;

// ---------------------------------------------------------------------------
// CacheState
// ---------------------------------------------------------------------------

/// The mutable cache structures; absent entirely when caching is disabled.
struct CacheState {
    index: CacheIndex,
    pending: PendingDelete,
    /// Sum of `data_size` over indexed, committed handles. Credited once
    /// per handle at commit, debited when a committed handle leaves the
    /// index.
    current_size: AtomicU64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            index: CacheIndex::new(),
            pending: PendingDelete::new(),
            current_size: AtomicU64::new(0),
        }
    }

    fn current(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    fn credit(&self, bytes: u64) {
        self.current_size.fetch_add(bytes, Ordering::AcqRel);
    }

    fn debit(&self, bytes: u64) {
        let _ = self
            .current_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            });
    }

    fn has_headroom(&self, max_total_bytes: u64, required: u64) -> bool {
        self.current().saturating_add(required) <= max_total_bytes
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stale_invalidations: AtomicU64,
    evictions: AtomicU64,
    admissions: AtomicU64,
    tables_dropped: AtomicU64,
    drop_failures: AtomicU64,
}

/// Point-in-time snapshot of cache counters and structural gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheMetricsSnapshot {
    /// Lookups that returned a pinned handle.
    pub hits: u64,
    /// Lookups that found no usable entry.
    pub misses: u64,
    /// Entries removed because a validity check failed.
    pub stale_invalidations: u64,
    /// Entries removed by weight-pressure pruning.
    pub evictions: u64,
    /// Handles admitted via `put`.
    pub admissions: u64,
    /// Backing tables dropped.
    pub tables_dropped: u64,
    /// Drop or resolution failures (table possibly orphaned).
    pub drop_failures: u64,
    /// Currently indexed entries.
    pub indexed: usize,
    /// Handles parked awaiting their final release.
    pub pending: usize,
    /// Committed weight currently accounted.
    pub current_size: u64,
    /// Configured weight budget.
    pub max_size: u64,
}

// ---------------------------------------------------------------------------
// CteCacheManager
// ---------------------------------------------------------------------------

/// Concurrent, weight-bounded cache of materialized CTE results.
pub struct CteCacheManager<M: ValidityMonitor, C: Catalog> {
    state: Option<CacheState>,
    monitor: M,
    catalog: C,
    max_total_bytes: u64,
    caching_user: String,
    query_ids: QueryIdGenerator,
    ready: AtomicBool,
    counters: Counters,
}

impl<M: ValidityMonitor, C: Catalog> CteCacheManager<M, C> {
    /// Create a manager. With `config.enabled == false` every operation is
    /// a no-op and no cache structures are allocated.
    pub fn new(config: CacheConfig, monitor: M, catalog: C) -> Self {
        let state = config.enabled.then(CacheState::new);
        if state.is_some() {
            tracing::info!(
                max_total_bytes = config.max_total_bytes,
                "CTE materialization cache enabled"
            );
        }
        Self {
            state,
            monitor,
            catalog,
            max_total_bytes: config.max_total_bytes,
            caching_user: config.caching_user,
            query_ids: QueryIdGenerator::new(),
            ready: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Whether the cache is configured on **and** the ready latch has been
    /// set. Callers are expected to check this before planning against the
    /// cache.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.is_some() && self.ready.load(Ordering::Acquire)
    }

    /// Set the one-way ready latch. Idempotent.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// A session for background catalog work: a fresh query id under the
    /// caching user. [`Self::invalidate_all`] drops backing tables under
    /// one of these rather than under the identity of whichever query
    /// happened to trigger the teardown.
    #[must_use]
    pub fn background_session(&self) -> Session {
        Session::new(self.query_ids.next_id(), self.caching_user.as_str())
            .with_source("cache-manager")
    }

    /// Committed weight currently accounted against the budget.
    #[must_use]
    pub fn current_size(&self) -> u64 {
        self.state.as_ref().map_or(0, CacheState::current)
    }

    /// Snapshot of counters and gauges.
    #[must_use]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let (indexed, pending, current_size) = match &self.state {
            Some(state) => (state.index.len(), state.pending.len(), state.current()),
            None => (0, 0, 0),
        };
        CacheMetricsSnapshot {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stale_invalidations: self.counters.stale_invalidations.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            admissions: self.counters.admissions.load(Ordering::Relaxed),
            tables_dropped: self.counters.tables_dropped.load(Ordering::Relaxed),
            drop_failures: self.counters.drop_failures.load(Ordering::Relaxed),
            indexed,
            pending,
            current_size,
            max_size: self.max_total_bytes,
        }
    }

    // -- Lookup path --

    /// Look up the materialization for `fp`.
    ///
    /// On a hit the handle is pinned and its usage counters are bumped; the
    /// caller owes exactly one `done(fp, handle.create_time())`. Prefer
    /// [`Self::lease`], which cannot forget the release. A stale entry is
    /// resolved internally (dropped now, or parked if referenced) and
    /// reported as a miss.
    pub fn lookup(&self, fp: &Fingerprint, session: &Session) -> Option<Arc<Materialization>> {
        let state = self.state.as_ref()?;
        let Some(handle) = state.index.get(fp) else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let valid = match self.monitor.is_valid(&handle, session) {
            Ok(valid) => valid,
            Err(error) => {
                tracing::warn!(
                    fingerprint = %fp,
                    error = %error,
                    "validity check failed; treating entry as stale"
                );
                false
            }
        };
        if !valid {
            self.counters
                .stale_invalidations
                .fetch_add(1, Ordering::Relaxed);
            let mut teardown = Vec::new();
            state.index.remove_if(
                fp,
                |current| Arc::ptr_eq(current, &handle),
                |fp, removed| {
                    self.note_removed(state, *fp, removed, RemovalCause::Explicit, &mut teardown);
                },
            );
            self.teardown_all(&teardown, session);
            return None;
        }

        if handle.try_grab() {
            handle.touch();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            Some(handle)
        } else {
            // Lost the race with a concurrent invalidation: the handle was
            // destroyed between the index read and the grab.
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// [`Self::lookup`] wrapped in a guard that releases on every exit
    /// path, including unwinds.
    pub fn lease<'a>(
        &'a self,
        fp: &Fingerprint,
        session: &Session,
    ) -> Option<CteLease<'a, M, C>> {
        let handle = self.lookup(fp, session)?;
        Some(CteLease {
            manager: self,
            session: session.clone(),
            handle,
        })
    }

    // -- Admission path --

    /// Admit a freshly built (uncommitted) handle.
    ///
    /// The handle is pinned with a producer pin, registered with the
    /// validity monitor, and indexed. The producer must write the backing
    /// table and then call [`Self::commit`], which releases the pin. An
    /// existing entry under the same fingerprint is displaced, not
    /// destroyed: it stays reachable through outstanding references and the
    /// producer of the newer materialization owns its cleanup.
    ///
    /// Returns the shared handle, or `None` when caching is disabled.
    pub fn put(&self, value: Materialization, session: &Session) -> Option<Arc<Materialization>> {
        let state = self.state.as_ref()?;
        let handle = Arc::new(value);

        if let Err(error) = self.monitor.monitor(&handle, session) {
            tracing::warn!(
                fingerprint = %handle.identifier(),
                error = %error,
                "monitor registration failed; entry will fail its next validity check"
            );
        }

        let pinned = handle.try_grab();
        debug_assert!(pinned, "a freshly created handle cannot be destroyed");

        if let Some(displaced) = state.index.insert(Arc::clone(&handle)) {
            if displaced.is_committed() {
                state.debit(displaced.data_size());
            }
            tracing::debug!(
                fingerprint = %handle.identifier(),
                cause = ?RemovalCause::Replaced,
                displaced_create_time = %displaced.create_time(),
                "displaced a prior materialization; its producer owns cleanup"
            );
        }
        self.counters.admissions.fetch_add(1, Ordering::Relaxed);
        Some(handle)
    }

    /// Declare the materialization at `(fp, create_time)` fully written.
    ///
    /// Releases the producer pin, prunes if the budget lacks headroom for
    /// the entry's weight, then credits the weight and sets the commit
    /// flag. If the entry was invalidated or displaced while it was being
    /// produced, only the pin release happens.
    pub fn commit(&self, fp: &Fingerprint, create_time: Tick, session: &Session) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        tracing::debug!(fingerprint = %fp, "materialization complete");

        // Release the producer pin first. The entry is still uncommitted,
        // so the prune below can never select it.
        self.done(fp, create_time, session);

        let Some(handle) = state
            .index
            .get(fp)
            .filter(|handle| handle.create_time() == create_time)
        else {
            tracing::debug!(
                fingerprint = %fp,
                "commit for an entry no longer indexed; skipping weight accounting"
            );
            return;
        };

        let new_size = handle.data_size();
        if !state.has_headroom(self.max_total_bytes, new_size) {
            self.prune(state, new_size, session);
        }

        // Credit and set the commit flag under the index lock. The removal
        // visitors run under the same lock and debit only committed
        // entries, so the entry is credited-and-committed or
        // removed-without-credit, never both and never neither.
        let committed = state
            .index
            .with_entry(fp, |current| {
                if !Arc::ptr_eq(current, &handle) || current.is_committed() {
                    return false;
                }
                state.credit(new_size);
                current.mark_committed();
                true
            })
            .unwrap_or(false);
        if !committed {
            tracing::debug!(
                fingerprint = %fp,
                "entry invalidated while committing; weight not accounted"
            );
        }
    }

    // -- Release path --

    /// Release one pin on the handle admitted under `(fp, create_time)`.
    ///
    /// Falls through to the pending-delete table when the handle is no
    /// longer indexed; the release that brings a parked handle's count to
    /// zero tears it down. A release that matches neither is a late or
    /// duplicate call and is ignored.
    pub fn done(&self, fp: &Fingerprint, create_time: Tick, session: &Session) {
        let Some(state) = self.state.as_ref() else {
            return;
        };

        if let Some(handle) = state.index.get(fp) {
            if handle.create_time() == create_time {
                handle.release();
                return;
            }
        }

        let Some(handle) = state.pending.get(fp, create_time) else {
            tracing::debug!(
                fingerprint = %fp,
                create_time = %create_time,
                "done for an unknown handle; late or duplicate release"
            );
            return;
        };
        if handle.release() == 0 && handle.begin_destroy() {
            self.drop_backing_table(&handle, session);
            state.pending.remove(fp, create_time);
        }
    }

    // -- Invalidation --

    /// Remove the given fingerprints from the index, tearing down or
    /// parking each per its reference count. Unknown fingerprints are
    /// ignored, so repeated invalidation is idempotent.
    pub fn invalidate(&self, fps: &[Fingerprint], session: &Session) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let removed = self.remove_entries(state, fps, RemovalCause::Explicit, session);
        if removed > 0 {
            tracing::debug!(removed, "invalidated cache entries");
        }
    }

    /// Remove every entry. Backing-table drops run under a fresh
    /// [`Self::background_session`] as the caching user, not under any
    /// calling query's identity.
    pub fn invalidate_all(&self) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        let drop_session = self.background_session();
        let mut teardown = Vec::new();
        let removed = state.index.remove_all(|fp, handle| {
            self.note_removed(state, *fp, handle, RemovalCause::Explicit, &mut teardown);
        });
        self.teardown_all(&teardown, &drop_session);
        if removed > 0 {
            tracing::info!(removed, "invalidated all cache entries");
        }
    }

    // -- Administrative walks --

    /// Apply `f` to the currently indexed entries among `fps`.
    pub fn walk<F>(&self, fps: &[Fingerprint], mut f: F)
    where
        F: FnMut(&Fingerprint, &Arc<Materialization>),
    {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        for (fp, handle) in state.index.snapshot_of(fps) {
            f(&fp, &handle);
        }
    }

    /// Apply `f` to every currently indexed entry.
    pub fn walk_all<F>(&self, mut f: F)
    where
        F: FnMut(&Fingerprint, &Arc<Materialization>),
    {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        for (fp, handle) in state.index.snapshot() {
            f(&fp, &handle);
        }
    }

    // -- Internals --

    fn prune(&self, state: &CacheState, required: u64, session: &Session) {
        let current = state.current();
        let deficit = required.saturating_sub(self.max_total_bytes.saturating_sub(current));
        if deficit == 0 {
            return;
        }
        let victims = evictor::select_victims(&state.index.snapshot(), deficit);
        if victims.is_empty() {
            tracing::debug!(
                deficit,
                "no eligible eviction victims; proceeding with a transient budget overrun"
            );
            return;
        }
        tracing::info!(victims = victims.len(), deficit, "pruning to make headroom");
        let removed = self.remove_entries(state, &victims, RemovalCause::Evicted, session);
        self.counters
            .evictions
            .fetch_add(u64::try_from(removed).expect("eviction count fits u64"), Ordering::Relaxed);
    }

    fn remove_entries(
        &self,
        state: &CacheState,
        fps: &[Fingerprint],
        cause: RemovalCause,
        session: &Session,
    ) -> usize {
        let mut teardown = Vec::new();
        let removed = state.index.remove_many(fps, |fp, handle| {
            self.note_removed(state, *fp, handle, cause, &mut teardown);
        });
        self.teardown_all(&teardown, session);
        removed
    }

    /// The removal hook: runs under the index lock so that parking is
    /// visible to any release that subsequently misses the index.
    fn note_removed(
        &self,
        state: &CacheState,
        fp: Fingerprint,
        handle: &Arc<Materialization>,
        cause: RemovalCause,
        teardown: &mut Vec<Arc<Materialization>>,
    ) {
        if handle.is_committed() {
            state.debit(handle.data_size());
        }
        match handle.leave_index() {
            LeaveIndex::Destroy => {
                tracing::info!(
                    fingerprint = %fp,
                    cause = ?cause,
                    "entry removed; dropping backing table"
                );
                teardown.push(Arc::clone(handle));
            }
            LeaveIndex::Park => {
                tracing::info!(
                    fingerprint = %fp,
                    cause = ?cause,
                    ref_count = handle.ref_count(),
                    "entry removed while referenced; parked until final release"
                );
                state.pending.park(Arc::clone(handle));
            }
        }
    }

    /// Catalog/monitor teardown for handles whose destroy decision already
    /// happened. Runs with no internal lock held.
    fn teardown_all(&self, handles: &[Arc<Materialization>], session: &Session) {
        for handle in handles {
            self.drop_backing_table(handle, session);
        }
    }

    fn drop_backing_table(&self, handle: &Materialization, session: &Session) {
        if let Err(error) = self.monitor.unmonitor(handle, session) {
            tracing::warn!(
                table = %handle.data_table(),
                error = %error,
                "failed to deregister the validity monitor"
            );
        }
        match self.catalog.table_handle(session, handle.data_table()) {
            Ok(Some(table)) => {
                if let Err(error) = self.catalog.drop_table(session, &table) {
                    self.counters.drop_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        table = %handle.data_table(),
                        error = %error,
                        "failed to drop backing table; it may be orphaned"
                    );
                } else {
                    self.counters.tables_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(None) => {
                tracing::debug!(table = %handle.data_table(), "backing table already gone");
            }
            Err(error) => {
                self.counters.drop_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    table = %handle.data_table(),
                    error = %error,
                    "failed to resolve backing table for drop; it may be orphaned"
                );
            }
        }
    }
}

impl<M: ValidityMonitor, C: Catalog> std::fmt::Debug for CteCacheManager<M, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CteCacheManager")
            .field("enabled", &self.state.is_some())
            .field("ready", &self.ready.load(Ordering::Relaxed))
            .field("max_total_bytes", &self.max_total_bytes)
            .field("current_size", &self.current_size())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CteLease
// ---------------------------------------------------------------------------

/// Scoped acquisition of a cached materialization.
///
/// Holds the pin taken by the lookup and releases it on drop, so the
/// matching `done` runs on every exit path: early returns, `?`, and
/// unwinds alike.
pub struct CteLease<'a, M: ValidityMonitor, C: Catalog> {
    manager: &'a CteCacheManager<M, C>,
    session: Session,
    handle: Arc<Materialization>,
}

impl<M: ValidityMonitor, C: Catalog> CteLease<'_, M, C> {
    /// The leased handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<Materialization> {
        &self.handle
    }
}

impl<M: ValidityMonitor, C: Catalog> std::ops::Deref for CteLease<'_, M, C> {
    type Target = Materialization;

    fn deref(&self) -> &Materialization {
        &self.handle
    }
}

impl<M: ValidityMonitor, C: Catalog> Drop for CteLease<'_, M, C> {
    fn drop(&mut self) {
        let fp = self.handle.identifier();
        self.manager
            .done(&fp, self.handle.create_time(), &self.session);
    }
}
