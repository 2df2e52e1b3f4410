//! Property-based lifecycle checks.
//!
//! Random operation sequences are applied through the public surface with a
//! small bookkeeping model (outstanding producer pins and reader pins).
//! After quiescing, three contracts must hold regardless of interleaving:
//! every admitted backing table was dropped exactly once, the committed
//! weight counter drained to zero, and nothing is left parked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use matcache::testing::{RecordingCatalog, RecordingMonitor};
use matcache::{CteCacheManager, Materialization};
use matcache_types::{CacheConfig, Fingerprint, QualifiedName, QueryId, Session, Tick};
use proptest::prelude::*;

type Manager = CteCacheManager<Arc<RecordingMonitor>, Arc<RecordingCatalog>>;

const SLOTS: u8 = 4;

#[derive(Debug, Clone, Copy)]
enum Op {
    Put(u8),
    Commit(u8),
    Lookup(u8),
    Done,
    Invalidate(u8),
}

fn op() -> impl Strategy<Value = Op> {
    (0_u8..5, 0..SLOTS).prop_map(|(kind, slot)| match kind {
        0 => Op::Put(slot),
        1 => Op::Commit(slot),
        2 => Op::Lookup(slot),
        3 => Op::Done,
        _ => Op::Invalidate(slot),
    })
}

struct Harness {
    manager: Manager,
    catalog: Arc<RecordingCatalog>,
    session: Session,
    admitted_tables: Vec<QualifiedName>,
    /// Slot → outstanding producer pin (admitted, not yet committed).
    producing: HashMap<u8, (Fingerprint, Tick)>,
    /// Reader pins owed a `done`.
    leases: Vec<(Fingerprint, Tick)>,
    admission_seq: u64,
}

impl Harness {
    fn new() -> Self {
        let monitor = Arc::new(RecordingMonitor::new());
        let catalog = Arc::new(RecordingCatalog::new());
        let config = CacheConfig {
            enabled: true,
            max_total_bytes: 600,
            caching_user: "cte-cache".to_string(),
        };
        let manager = CteCacheManager::new(config, monitor, Arc::clone(&catalog));
        Self {
            manager,
            catalog,
            session: Session::new(QueryId::from_raw(1), "alice"),
            admitted_tables: Vec::new(),
            producing: HashMap::new(),
            leases: Vec::new(),
            admission_seq: 0,
        }
    }

    fn fingerprint(slot: u8) -> Fingerprint {
        Fingerprint::from_raw(u128::from(slot) + 1)
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Put(slot) => {
                // One in-flight materialization per slot; a producer retires
                // the previous generation before admitting a new one.
                if self.producing.contains_key(&slot) {
                    return;
                }
                let fp = Self::fingerprint(slot);
                self.manager.invalidate(&[fp], &self.session);

                self.admission_seq += 1;
                let seq = self.admission_seq;
                let name =
                    QualifiedName::new("hive", "tmp", &format!("cte_{slot}_{seq}")).unwrap();
                let value = Materialization::new(
                    fp,
                    name.clone(),
                    100 + (seq % 5) * 50,
                    Duration::from_millis(seq % 9),
                );
                let create_time = value.create_time();
                self.manager.put(value, &self.session).expect("enabled");
                self.admitted_tables.push(name);
                self.producing.insert(slot, (fp, create_time));
            }
            Op::Commit(slot) => {
                if let Some((fp, create_time)) = self.producing.remove(&slot) {
                    self.manager.commit(&fp, create_time, &self.session);
                }
            }
            Op::Lookup(slot) => {
                let fp = Self::fingerprint(slot);
                if let Some(handle) = self.manager.lookup(&fp, &self.session) {
                    assert!(!handle.is_destroyed());
                    self.leases.push((fp, handle.create_time()));
                }
            }
            Op::Done => {
                if let Some((fp, create_time)) = self.leases.pop() {
                    self.manager.done(&fp, create_time, &self.session);
                }
            }
            Op::Invalidate(slot) => {
                self.manager
                    .invalidate(&[Self::fingerprint(slot)], &self.session);
            }
        }
    }

    fn quiesce(&mut self) {
        let producing: Vec<_> = self.producing.drain().collect();
        for (_, (fp, create_time)) in producing {
            self.manager.commit(&fp, create_time, &self.session);
        }
        while let Some((fp, create_time)) = self.leases.pop() {
            self.manager.done(&fp, create_time, &self.session);
        }
        self.manager.invalidate_all();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_admitted_table_drops_exactly_once(
        ops in proptest::collection::vec(op(), 0..80)
    ) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op);
        }
        harness.quiesce();

        for name in &harness.admitted_tables {
            prop_assert_eq!(
                harness.catalog.drop_count(name),
                1,
                "table {} must be dropped exactly once",
                name
            );
        }
        prop_assert_eq!(harness.manager.current_size(), 0);
        prop_assert_eq!(harness.manager.metrics().pending, 0);
        prop_assert_eq!(harness.manager.metrics().indexed, 0);
    }

    #[test]
    fn weight_accounting_matches_indexed_committed_weight(
        ops in proptest::collection::vec(op(), 0..80)
    ) {
        let mut harness = Harness::new();
        for op in ops {
            harness.apply(op);
        }
        // Settle reader and producer pins but keep the index populated.
        let producing: Vec<_> = harness.producing.drain().collect();
        for (_, (fp, create_time)) in producing {
            harness.manager.commit(&fp, create_time, &harness.session);
        }
        while let Some((fp, create_time)) = harness.leases.pop() {
            harness.manager.done(&fp, create_time, &harness.session);
        }

        let mut indexed_committed = 0_u64;
        harness.manager.walk_all(|_, handle| {
            if handle.is_committed() {
                indexed_committed += handle.data_size();
            }
        });
        prop_assert_eq!(harness.manager.current_size(), indexed_committed);
    }
}
