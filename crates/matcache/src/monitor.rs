//! Validity-monitor boundary.
//!
//! The monitor observes writes against the source tables a materialization
//! was computed from. While an entry is cached the monitor holds a
//! registration for it; a failed validity check means some source table
//! changed after the materialization was built and the entry must not be
//! served again.

use matcache_error::Result;
use matcache_types::Session;

use crate::materialization::Materialization;

/// External service that reports whether a cached materialization is still
/// fresh.
///
/// A failed call on any method is treated conservatively: `is_valid`
/// errors count as "stale", and registration errors are logged while the
/// entry stays admitted (it will fail its next validity check while the
/// monitor is degraded).
pub trait ValidityMonitor: Send + Sync {
    /// Register interest in the source tables of `materialization`.
    fn monitor(&self, materialization: &Materialization, session: &Session) -> Result<()>;

    /// Deregister interest; called immediately before the backing table is
    /// dropped.
    fn unmonitor(&self, materialization: &Materialization, session: &Session) -> Result<()>;

    /// Returns `false` if any source table has been modified since the
    /// materialization was built.
    fn is_valid(&self, materialization: &Materialization, session: &Session) -> Result<bool>;
}
