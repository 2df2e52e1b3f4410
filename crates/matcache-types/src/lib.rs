//! Shared value types for the CTE materialization cache.
//!
//! Everything here is a small, value-equal token passed across the cache's
//! public surface: plan fingerprints, logical timestamps, qualified table
//! names, session identities, and the recognized configuration options.

pub mod config;
pub mod qualified;
pub mod session;

pub use config::CacheConfig;
pub use qualified::{InvalidQualifiedName, QualifiedName};
pub use session::{QueryId, QueryIdGenerator, Session};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Fingerprint of a cacheable plan subtree.
///
/// Opaque, value-equal, and hashable; the cache treats it purely as a lookup
/// token. Producers typically derive it from the canonical text of the
/// subplan via [`Fingerprint::from_plan_text`], but any 128-bit value works.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Fingerprint(u128);

impl Fingerprint {
    /// Digest canonical plan text into a fingerprint (xxh3-128).
    #[must_use]
    pub fn from_plan_text(text: &str) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(text.as_bytes()))
    }

    /// Construct from a raw 128-bit value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u128) -> Self {
        Self(raw)
    }

    /// The raw 128-bit value.
    #[inline]
    #[must_use]
    pub const fn as_u128(self) -> u128 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

static TICK_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Process-monotonic logical timestamp.
///
/// Drawn from a global atomic sequence, so two calls to [`Tick::next`] never
/// return the same value within a process. Used both as a handle's creation
/// time (distinguishing successive materializations admitted under the same
/// fingerprint) and to order last-access times for eviction ranking.
///
/// Ticks are not wall-clock time and do not survive a restart; nothing in
/// the cache does.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Tick(u64);

impl Tick {
    /// Allocate the next tick from the global sequence.
    #[must_use]
    pub fn next() -> Self {
        Self(TICK_SEQUENCE.fetch_add(1, Ordering::Relaxed))
    }

    /// Construct from a raw sequence value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw sequence value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
