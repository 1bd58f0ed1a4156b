//! Resolution wait queue
//!
//! A per-database FIFO of waiter descriptors. Backends enqueue and block
//! on a wait handle; a resolver pops the next waiter whose deadline has
//! arrived, resolves the entries of its transaction, and completes the
//! handle. Failed attempts are re-enqueued with exponential backoff.

use fedtx_common::{BackendId, DatabaseId, Latch, Xid};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Shared between the enqueuing backend and the resolver that completes
/// the wait.
#[derive(Debug, Default)]
pub struct WaitHandle {
    complete: AtomicBool,
    pub(crate) latch: Latch,
}

impl WaitHandle {
    pub(crate) fn complete(&self) {
        self.complete.store(true, Ordering::Release);
        self.latch.set();
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// One queued resolution request.
#[derive(Debug, Clone)]
pub(crate) struct Waiter {
    pub backend: BackendId,
    pub xid: Xid,
    pub commit: bool,
    pub deadline: Instant,
    pub retries: u32,
    pub handle: Arc<WaitHandle>,
}

#[derive(Default)]
pub struct ResolutionQueue {
    queues: Mutex<HashMap<DatabaseId, VecDeque<Waiter>>>,
}

impl ResolutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn enqueue(
        &self,
        dbid: DatabaseId,
        backend: BackendId,
        xid: Xid,
        commit: bool,
    ) -> Arc<WaitHandle> {
        let handle = Arc::new(WaitHandle::default());
        self.queues
            .lock()
            .entry(dbid)
            .or_default()
            .push_back(Waiter {
                backend,
                xid,
                commit,
                deadline: Instant::now(),
                retries: 0,
                handle: handle.clone(),
            });
        handle
    }

    /// Pop the first waiter of the database whose deadline has arrived.
    pub(crate) fn take_due_waiter(&self, dbid: DatabaseId, now: Instant) -> Option<Waiter> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(&dbid)?;
        let pos = queue.iter().position(|w| w.deadline <= now)?;
        queue.remove(pos)
    }

    /// Earliest deadline still queued for the database, for sleep
    /// computation.
    pub(crate) fn next_deadline(&self, dbid: DatabaseId) -> Option<Instant> {
        self.queues
            .lock()
            .get(&dbid)
            .and_then(|q| q.iter().map(|w| w.deadline).min())
    }

    /// Put a waiter back after a failed attempt, backing off
    /// exponentially up to `cap`.
    pub(crate) fn requeue(&self, dbid: DatabaseId, mut waiter: Waiter, cap: Duration) {
        let backoff = BACKOFF_BASE
            .saturating_mul(1u32 << waiter.retries.min(16))
            .min(cap);
        waiter.retries += 1;
        waiter.deadline = Instant::now() + backoff;
        self.queues.lock().entry(dbid).or_default().push_back(waiter);
    }

    pub(crate) fn has_waiters(&self, dbid: DatabaseId) -> bool {
        self.queues
            .lock()
            .get(&dbid)
            .is_some_and(|q| !q.is_empty())
    }

    /// Databases with at least one queued waiter.
    pub(crate) fn databases_with_waiters(&self) -> Vec<DatabaseId> {
        self.queues
            .lock()
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&dbid, _)| dbid)
            .collect()
    }

    /// Remove an abandoned waiter (its backend stopped waiting).
    pub(crate) fn detach(&self, dbid: DatabaseId, handle: &Arc<WaitHandle>) {
        if let Some(queue) = self.queues.lock().get_mut(&dbid) {
            queue.retain(|w| !Arc::ptr_eq(&w.handle, handle));
        }
    }

    /// Run `f` while holding the queue lock, with the database's
    /// emptiness as input. Used by the idle-exit path so no waiter can
    /// slip in between the emptiness check and the slot detach.
    pub(crate) fn with_empty_check<R>(&self, dbid: DatabaseId, f: impl FnOnce(bool) -> R) -> R {
        let queues = self.queues.lock();
        let empty = queues.get(&dbid).map_or(true, |q| q.is_empty());
        f(empty)
    }
}
