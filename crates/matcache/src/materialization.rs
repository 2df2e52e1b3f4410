//! Handle lifecycle for one materialized subplan.
//!
//! A [`Materialization`] is shared as `Arc<Materialization>` between the
//! index, the pending-delete side table, and any queries currently reading
//! the backing table. Its lifetime is tracked with an explicit reference
//! count, not index membership: an entry removed from the index survives
//! for as long as any reader still holds it.
//!
//! # Lifecycle invariants
//!
//! 1. `ref_count` never goes below zero; it rises only through
//!    [`Materialization::try_grab`] and falls only through
//!    [`Materialization::release`].
//! 2. A handle is in at most one of three phases (indexed, pending-delete,
//!    destroyed) and the destroyed transition happens exactly once.
//! 3. The removal-time decision "`ref_count <= 0`, destroy now" is
//!    serialized against concurrent grabs by the per-handle guard, so a
//!    grab can never succeed on a handle whose backing table is being
//!    dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use matcache_types::{Fingerprint, QualifiedName, Tick};
use parking_lot::Mutex;

/// Fate of a handle that is leaving the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeaveIndex {
    /// Unreferenced: the caller owns teardown of the backing table.
    Destroy,
    /// Still referenced: park in the pending-delete table; the final
    /// release performs teardown.
    Park,
}

/// One materialized subplan: identity, backing table, weight, cost, usage
/// counters, reference count, and commit flag.
pub struct Materialization {
    identifier: Fingerprint,
    data_table: QualifiedName,
    create_time: Tick,
    data_size: u64,
    runtime: Duration,
    access_count: AtomicU64,
    last_access: AtomicU64,
    /// Live-holder count. Mutated only under `guard`.
    ref_count: AtomicU64,
    committed: AtomicBool,
    /// One-way latch; set under `guard` by the single teardown winner.
    destroyed: AtomicBool,
    /// Serializes grab/release against the removal-time destroy decision.
    guard: Mutex<()>,
}

impl Materialization {
    /// Create an uncommitted, unreferenced handle.
    ///
    /// `data_size` is the weight in bytes; `runtime` is the measured cost
    /// of producing the materialization (more expensive entries are kept
    /// longer under weight pressure).
    #[must_use]
    pub fn new(
        identifier: Fingerprint,
        data_table: QualifiedName,
        data_size: u64,
        runtime: Duration,
    ) -> Self {
        let create_time = Tick::next();
        Self {
            identifier,
            data_table,
            create_time,
            data_size,
            runtime,
            access_count: AtomicU64::new(0),
            last_access: AtomicU64::new(create_time.get()),
            ref_count: AtomicU64::new(0),
            committed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            guard: Mutex::new(()),
        }
    }

    // -- Identity and weight --

    /// The fingerprint this handle was admitted under.
    #[inline]
    #[must_use]
    pub fn identifier(&self) -> Fingerprint {
        self.identifier
    }

    /// Fully-qualified name of the backing table.
    #[inline]
    #[must_use]
    pub fn data_table(&self) -> &QualifiedName {
        &self.data_table
    }

    /// Creation tick; distinguishes successive handles admitted under the
    /// same fingerprint.
    #[inline]
    #[must_use]
    pub fn create_time(&self) -> Tick {
        self.create_time
    }

    /// Weight in bytes.
    #[inline]
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Measured cost of producing this materialization.
    #[inline]
    #[must_use]
    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    // -- Usage counters --

    /// Number of lookups that hit this handle.
    #[must_use]
    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Tick of the most recent hit (creation tick if never hit).
    #[must_use]
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    /// Record a hit: bump the access count and refresh the last-access tick.
    pub(crate) fn touch(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access.store(Tick::next().get(), Ordering::Relaxed);
    }

    // -- Reference counting --

    /// Current number of live holders.
    #[must_use]
    pub fn ref_count(&self) -> u64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Returns `true` if any holder is live.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.ref_count() > 0
    }

    /// Increment the reference count, unless the handle has already been
    /// destroyed. Returns whether the grab succeeded.
    ///
    /// The guard makes this atomic with respect to [`Self::leave_index`]:
    /// once the destroy decision is taken, no further grab can succeed.
    pub(crate) fn try_grab(&self) -> bool {
        let _guard = self.guard.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Decrement the reference count, clamped at zero. Returns the count
    /// after the decrement.
    pub(crate) fn release(&self) -> u64 {
        let _guard = self.guard.lock();
        let previous = self.ref_count.load(Ordering::Acquire);
        if previous == 0 {
            tracing::debug!(
                fingerprint = %self.identifier,
                "release on unreferenced materialization"
            );
            return 0;
        }
        let next = previous - 1;
        self.ref_count.store(next, Ordering::Release);
        next
    }

    // -- Commit flag --

    /// Whether the producer has declared the materialization complete.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Mark the materialization complete. Idempotent.
    pub(crate) fn mark_committed(&self) {
        self.committed.store(true, Ordering::Release);
    }

    // -- Teardown --

    /// Whether the destroyed transition has happened.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Claim the (single) destroyed transition. Returns `true` for exactly
    /// one caller over the handle's lifetime.
    pub(crate) fn begin_destroy(&self) -> bool {
        let _guard = self.guard.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return false;
        }
        self.destroyed.store(true, Ordering::Release);
        true
    }

    /// Decide the fate of this handle as it leaves the index.
    ///
    /// Taken under the guard so the decision cannot interleave with a
    /// concurrent grab: either the grab lands first and the handle parks,
    /// or the destroy decision lands first and the grab fails.
    pub(crate) fn leave_index(&self) -> LeaveIndex {
        let _guard = self.guard.lock();
        if self.ref_count.load(Ordering::Acquire) == 0
            && !self.destroyed.load(Ordering::Acquire)
        {
            self.destroyed.store(true, Ordering::Release);
            LeaveIndex::Destroy
        } else {
            LeaveIndex::Park
        }
    }
}

impl std::fmt::Debug for Materialization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materialization")
            .field("identifier", &self.identifier)
            .field("data_table", &self.data_table)
            .field("create_time", &self.create_time)
            .field("data_size", &self.data_size)
            .field("runtime", &self.runtime)
            .field("access_count", &self.access_count.load(Ordering::Relaxed))
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("committed", &self.committed.load(Ordering::Relaxed))
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Materialization {
        Materialization::new(
            Fingerprint::from_raw(1),
            QualifiedName::new("hive", "tmp", "cte_1").unwrap(),
            100,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn grab_and_release_track_holders() {
        let m = handle();
        assert_eq!(m.ref_count(), 0);
        assert!(m.try_grab());
        assert!(m.try_grab());
        assert_eq!(m.ref_count(), 2);
        assert_eq!(m.release(), 1);
        assert_eq!(m.release(), 0);
        assert!(!m.is_pinned());
    }

    #[test]
    fn release_clamps_at_zero() {
        let m = handle();
        assert_eq!(m.release(), 0);
        assert_eq!(m.ref_count(), 0);
    }

    #[test]
    fn mark_committed_is_idempotent() {
        let m = handle();
        assert!(!m.is_committed());
        m.mark_committed();
        m.mark_committed();
        assert!(m.is_committed());
    }

    #[test]
    fn touch_bumps_counters() {
        let m = handle();
        let before = m.last_access();
        m.touch();
        m.touch();
        assert_eq!(m.access_count(), 2);
        assert!(m.last_access() > before);
    }

    #[test]
    fn begin_destroy_wins_exactly_once() {
        let m = handle();
        assert!(m.begin_destroy());
        assert!(!m.begin_destroy());
        assert!(m.is_destroyed());
    }

    #[test]
    fn grab_fails_after_destroy() {
        let m = handle();
        assert!(m.begin_destroy());
        assert!(!m.try_grab());
        assert_eq!(m.ref_count(), 0);
    }

    #[test]
    fn leave_index_destroys_unreferenced() {
        let m = handle();
        assert_eq!(m.leave_index(), LeaveIndex::Destroy);
        assert!(m.is_destroyed());
        // The decision is single-shot: a second call must not claim
        // teardown again.
        assert_eq!(m.leave_index(), LeaveIndex::Park);
    }

    #[test]
    fn leave_index_parks_pinned() {
        let m = handle();
        assert!(m.try_grab());
        assert_eq!(m.leave_index(), LeaveIndex::Park);
        assert!(!m.is_destroyed());
        // Still grabbable while parked: existing holders may clone.
        assert!(m.try_grab());
    }

    #[test]
    fn concurrent_grabs_never_lose_counts() {
        use std::sync::Arc;

        let m = Arc::new(handle());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let m = Arc::clone(&m);
                scope.spawn(move || {
                    for _ in 0..1000 {
                        assert!(m.try_grab());
                        m.release();
                    }
                });
            }
        });
        assert_eq!(m.ref_count(), 0);
    }
}
