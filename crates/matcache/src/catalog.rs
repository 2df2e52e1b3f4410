//! Catalog boundary: resolution and teardown of backing tables.
//!
//! The catalog owns the actual tables; the cache only asks it to resolve a
//! qualified name and to drop a table whose materialization has reached the
//! end of its life. A drop failure is an operational concern (the table may
//! be orphaned), never a cache-correctness failure: the handle's local
//! teardown completes regardless.

use matcache_error::Result;
use matcache_types::{QualifiedName, Session};

/// Opaque token for a resolved backing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    name: QualifiedName,
}

impl TableHandle {
    /// Wrap a resolved table name.
    #[must_use]
    pub fn new(name: QualifiedName) -> Self {
        Self { name }
    }

    /// The fully-qualified table name.
    #[must_use]
    pub fn name(&self) -> &QualifiedName {
        &self.name
    }
}

/// External metadata service that owns the backing tables.
///
/// Presumed thread-safe; the cache never holds an internal lock across a
/// catalog call.
pub trait Catalog: Send + Sync {
    /// Resolve a fully-qualified name to a table handle, if the table
    /// exists.
    fn table_handle(
        &self,
        session: &Session,
        name: &QualifiedName,
    ) -> Result<Option<TableHandle>>;

    /// Drop a backing table. Implementations must tolerate a drop of a
    /// table that is already gone.
    fn drop_table(&self, session: &Session, table: &TableHandle) -> Result<()>;
}
