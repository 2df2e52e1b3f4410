//! Session identity for catalog and monitor calls.
//!
//! Every catalog or monitor operation executes under a [`Session`]: a query
//! id plus the user the operation is performed as. Background maintenance
//! (dropping tables during a full invalidation) runs under a dedicated
//! caching user rather than the identity of whichever query happened to
//! trigger the work.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one logical query or background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct QueryId(u64);

impl QueryId {
    /// Construct from a raw value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{:08}", self.0)
    }
}

/// Allocates sequential [`QueryId`]s.
#[derive(Debug)]
pub struct QueryIdGenerator {
    next: AtomicU64,
}

impl QueryIdGenerator {
    /// Create a generator starting at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next query id.
    pub fn next_id(&self) -> QueryId {
        QueryId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for QueryIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity under which catalog and monitor operations execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    query_id: QueryId,
    user: String,
    source: Option<String>,
}

impl Session {
    /// Create a session for `user`.
    pub fn new(query_id: QueryId, user: impl Into<String>) -> Self {
        Self {
            query_id,
            user: user.into(),
            source: None,
        }
    }

    /// Attach a source label (e.g. `cache-manager` for background work).
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// The query id.
    #[must_use]
    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// The user the session acts as.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// The source label, if any.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }
}
