//! Error types for the CTE materialization cache.
//!
//! These errors exist at the collaborator boundary: the catalog and the
//! validity monitor report failures through them. The cache core itself
//! never propagates an error through its public surface: failures are
//! recovered locally (the entry is invalidated, or considered dead with a
//! possibly-orphaned backing table) and logged.

use matcache_types::qualified::InvalidQualifiedName;
use matcache_types::QualifiedName;
use thiserror::Error;

/// Failures reported by the catalog and validity-monitor collaborators.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The catalog failed while resolving a backing table to a handle.
    #[error("failed to resolve backing table '{table}': {detail}")]
    TableResolution {
        table: QualifiedName,
        detail: String,
    },

    /// The catalog failed to drop a backing table. The cache treats the
    /// handle as dead regardless; the table may be orphaned.
    #[error("failed to drop backing table '{table}': {detail}")]
    CatalogDropFailed {
        table: QualifiedName,
        detail: String,
    },

    /// A validity-monitor call failed. Treated as a failed validity check.
    #[error("validity monitor call failed: {detail}")]
    MonitorCall { detail: String },

    /// A backing-table name did not have the `catalog.schema.table` shape.
    #[error("invalid qualified name: '{input}'")]
    InvalidQualifiedName { input: String },
}

impl From<InvalidQualifiedName> for CacheError {
    fn from(err: InvalidQualifiedName) -> Self {
        Self::InvalidQualifiedName { input: err.input }
    }
}

/// Convenience alias used throughout the cache crates.
pub type Result<T> = std::result::Result<T, CacheError>;
