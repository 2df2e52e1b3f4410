//! In-memory collaborator doubles for tests.
//!
//! `RecordingCatalog` and `RecordingMonitor` record every call, including
//! the session identity it arrived under, so tests can assert the
//! exactly-once drop contract, check which user performed a drop, and
//! script staleness or failures.

use std::collections::HashSet;

use matcache_error::{CacheError, Result};
use matcache_types::{QualifiedName, Session};
use parking_lot::Mutex;

use crate::catalog::{Catalog, TableHandle};
use crate::materialization::Materialization;
use crate::monitor::ValidityMonitor;

/// Catalog double that records drops (table and acting user) and can be
/// scripted to fail.
#[derive(Default)]
pub struct RecordingCatalog {
    drops: Mutex<Vec<(QualifiedName, String)>>,
    missing: Mutex<HashSet<QualifiedName>>,
    fail_drops: Mutex<bool>,
}

impl RecordingCatalog {
    /// Create a catalog that resolves every table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `table_handle` report `name` as nonexistent.
    pub fn mark_missing(&self, name: QualifiedName) {
        self.missing.lock().insert(name);
    }

    /// Script all subsequent drops to fail.
    pub fn fail_drops(&self, fail: bool) {
        *self.fail_drops.lock() = fail;
    }

    /// Number of drop calls observed for `name`.
    #[must_use]
    pub fn drop_count(&self, name: &QualifiedName) -> usize {
        self.drops
            .lock()
            .iter()
            .filter(|(dropped, _)| dropped == name)
            .count()
    }

    /// Total drop calls observed.
    #[must_use]
    pub fn total_drops(&self) -> usize {
        self.drops.lock().len()
    }

    /// Every drop observed, as `(table, user)` pairs in call order.
    #[must_use]
    pub fn drops(&self) -> Vec<(QualifiedName, String)> {
        self.drops.lock().clone()
    }
}

impl Catalog for RecordingCatalog {
    fn table_handle(
        &self,
        _session: &Session,
        name: &QualifiedName,
    ) -> Result<Option<TableHandle>> {
        if self.missing.lock().contains(name) {
            return Ok(None);
        }
        Ok(Some(TableHandle::new(name.clone())))
    }

    fn drop_table(&self, session: &Session, table: &TableHandle) -> Result<()> {
        self.drops
            .lock()
            .push((table.name().clone(), session.user().to_string()));
        if *self.fail_drops.lock() {
            return Err(CacheError::CatalogDropFailed {
                table: table.name().clone(),
                detail: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

/// Monitor double recording registrations (table and acting user), with
/// scriptable validity and failure.
#[derive(Default)]
pub struct RecordingMonitor {
    monitored: Mutex<Vec<(QualifiedName, String)>>,
    unmonitored: Mutex<Vec<(QualifiedName, String)>>,
    invalid: Mutex<HashSet<QualifiedName>>,
    fail_checks: Mutex<bool>,
}

impl RecordingMonitor {
    /// Create a monitor that reports everything valid.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script validity checks for `table` to report stale.
    pub fn mark_invalid(&self, table: QualifiedName) {
        self.invalid.lock().insert(table);
    }

    /// Script all subsequent validity checks to fail with an error.
    pub fn fail_checks(&self, fail: bool) {
        *self.fail_checks.lock() = fail;
    }

    /// Number of `monitor` registrations observed.
    #[must_use]
    pub fn monitored_count(&self) -> usize {
        self.monitored.lock().len()
    }

    /// Number of `unmonitor` deregistrations observed.
    #[must_use]
    pub fn unmonitored_count(&self) -> usize {
        self.unmonitored.lock().len()
    }

    /// Every deregistration observed, as `(table, user)` pairs in call
    /// order.
    #[must_use]
    pub fn unmonitored(&self) -> Vec<(QualifiedName, String)> {
        self.unmonitored.lock().clone()
    }
}

impl ValidityMonitor for RecordingMonitor {
    fn monitor(&self, materialization: &Materialization, session: &Session) -> Result<()> {
        self.monitored
            .lock()
            .push((materialization.data_table().clone(), session.user().to_string()));
        Ok(())
    }

    fn unmonitor(&self, materialization: &Materialization, session: &Session) -> Result<()> {
        self.unmonitored
            .lock()
            .push((materialization.data_table().clone(), session.user().to_string()));
        Ok(())
    }

    fn is_valid(&self, materialization: &Materialization, _session: &Session) -> Result<bool> {
        if *self.fail_checks.lock() {
            return Err(CacheError::MonitorCall {
                detail: "scripted failure".to_string(),
            });
        }
        Ok(!self
            .invalid
            .lock()
            .contains(materialization.data_table()))
    }
}

// Tests hold on to the doubles after handing them to the manager, so the
// traits are also implemented for Arc-wrapped doubles.

impl Catalog for std::sync::Arc<RecordingCatalog> {
    fn table_handle(
        &self,
        session: &Session,
        name: &QualifiedName,
    ) -> Result<Option<TableHandle>> {
        self.as_ref().table_handle(session, name)
    }

    fn drop_table(&self, session: &Session, table: &TableHandle) -> Result<()> {
        self.as_ref().drop_table(session, table)
    }
}

impl ValidityMonitor for std::sync::Arc<RecordingMonitor> {
    fn monitor(&self, materialization: &Materialization, session: &Session) -> Result<()> {
        self.as_ref().monitor(materialization, session)
    }

    fn unmonitor(&self, materialization: &Materialization, session: &Session) -> Result<()> {
        self.as_ref().unmonitor(materialization, session)
    }

    fn is_valid(&self, materialization: &Materialization, session: &Session) -> Result<bool> {
        self.as_ref().is_valid(materialization, session)
    }
}
