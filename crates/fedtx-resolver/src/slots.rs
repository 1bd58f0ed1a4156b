//! Resolver slot table
//!
//! A bounded pool of worker slots, one per running resolver. The
//! launcher allocates a slot before spawning the worker; the worker
//! attaches, stamps its id and latch, and detaches on exit. At most one
//! slot is in use per database.

use fedtx_common::{DatabaseId, Latch};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Identity of one spawned resolver worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolver#{}", self.0)
    }
}

/// One row of the resolver activity view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverStatRow {
    pub worker: WorkerId,
    pub dbid: DatabaseId,
    pub last_resolved_time: Option<SystemTime>,
}

#[derive(Default)]
pub(crate) struct SlotState {
    pub in_use: bool,
    pub dbid: Option<DatabaseId>,
    pub worker: Option<WorkerId>,
    pub latch: Option<Arc<Latch>>,
    pub last_resolved_time: Option<SystemTime>,
    pub stop_requested: bool,
}

pub(crate) struct SlotTable {
    slots: Vec<Mutex<SlotState>>,
    next_worker: AtomicU64,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(SlotState::default())).collect(),
            next_worker: AtomicU64::new(1),
        }
    }

    /// Reserve a free slot for a database. The worker id is assigned here
    /// so the launcher can name the task before it attaches.
    pub fn allocate(&self, dbid: DatabaseId) -> Option<(usize, WorkerId)> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let mut state = slot.lock();
            if !state.in_use {
                let worker = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
                *state = SlotState {
                    in_use: true,
                    dbid: Some(dbid),
                    worker: Some(worker),
                    latch: None,
                    last_resolved_time: None,
                    stop_requested: false,
                };
                return Some((idx, worker));
            }
        }
        None
    }

    /// Attach the spawned worker's latch to its slot.
    pub fn attach(&self, idx: usize, latch: Arc<Latch>) {
        self.slots[idx].lock().latch = Some(latch);
    }

    pub fn detach(&self, idx: usize) {
        *self.slots[idx].lock() = SlotState::default();
    }

    /// Latch of the resolver covering `dbid`, if one is running.
    pub fn latch_for(&self, dbid: DatabaseId) -> Option<Arc<Latch>> {
        self.slots.iter().find_map(|slot| {
            let state = slot.lock();
            (state.in_use && state.dbid == Some(dbid))
                .then(|| state.latch.clone())
                .flatten()
        })
    }

    pub fn covers(&self, dbid: DatabaseId) -> bool {
        self.slots.iter().any(|slot| {
            let state = slot.lock();
            state.in_use && state.dbid == Some(dbid)
        })
    }

    pub fn touch(&self, idx: usize) {
        self.slots[idx].lock().last_resolved_time = Some(SystemTime::now());
    }

    pub fn request_stop(&self, dbid: DatabaseId) -> bool {
        for slot in &self.slots {
            let mut state = slot.lock();
            if state.in_use && state.dbid == Some(dbid) {
                state.stop_requested = true;
                if let Some(latch) = &state.latch {
                    latch.set();
                }
                return true;
            }
        }
        false
    }

    pub fn stop_requested(&self, idx: usize) -> bool {
        self.slots[idx].lock().stop_requested
    }

    pub fn stats(&self) -> Vec<ResolverStatRow> {
        self.slots
            .iter()
            .filter_map(|slot| {
                let state = slot.lock();
                match (state.in_use, state.worker, state.dbid) {
                    (true, Some(worker), Some(dbid)) => Some(ResolverStatRow {
                        worker,
                        dbid,
                        last_resolved_time: state.last_resolved_time,
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_fills_slots_and_respects_capacity() {
        let table = SlotTable::new(2);
        let (a, _) = table.allocate(DatabaseId(1)).unwrap();
        let (b, _) = table.allocate(DatabaseId(2)).unwrap();
        assert_ne!(a, b);
        assert!(table.allocate(DatabaseId(3)).is_none());

        table.detach(a);
        assert!(table.allocate(DatabaseId(3)).is_some());
    }

    #[test]
    fn latch_is_found_by_database() {
        let table = SlotTable::new(2);
        let (idx, _) = table.allocate(DatabaseId(1)).unwrap();
        assert!(table.latch_for(DatabaseId(1)).is_none());

        let latch = Arc::new(Latch::new());
        table.attach(idx, latch.clone());
        assert!(table.latch_for(DatabaseId(1)).is_some());
        assert!(table.latch_for(DatabaseId(2)).is_none());
        assert!(table.covers(DatabaseId(1)));
    }

    #[test]
    fn stop_request_sets_the_worker_latch() {
        let table = SlotTable::new(1);
        let (idx, _) = table.allocate(DatabaseId(1)).unwrap();
        let latch = Arc::new(Latch::new());
        table.attach(idx, latch.clone());

        assert!(table.request_stop(DatabaseId(1)));
        assert!(table.stop_requested(idx));
        assert!(latch.is_set());
        assert!(!table.request_stop(DatabaseId(9)));
    }
}
