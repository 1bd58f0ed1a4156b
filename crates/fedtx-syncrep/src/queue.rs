//! LSN-ordered wait queues
//!
//! One queue per wait mode. Each node carries the backend's commit
//! position and a shared wait handle; the queue is kept strictly
//! ascending by position so a sender walks from the head and stops at
//! the first waiter it cannot release yet.

use fedtx_common::{Latch, Lsn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const NOT_WAITING: u8 = 0;
const WAITING: u8 = 1;
const WAIT_COMPLETE: u8 = 2;

/// Wait node state shared between a parked backend and its waker. The
/// latch is the backend's own process latch, so signal deliveries to the
/// backend wake the same wait.
#[derive(Debug)]
pub(crate) struct SyncWaitHandle {
    state: AtomicU8,
    pub(crate) latch: Arc<Latch>,
}

impl SyncWaitHandle {
    pub fn new_waiting(latch: Arc<Latch>) -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            latch,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAIT_COMPLETE
    }

    pub fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }

    pub fn set_not_waiting(&self) {
        self.state.store(NOT_WAITING, Ordering::Release);
    }

    fn complete(&self) {
        self.state.store(WAIT_COMPLETE, Ordering::Release);
    }
}

struct QueuedWaiter {
    lsn: Lsn,
    handle: Arc<SyncWaitHandle>,
}

#[derive(Default)]
pub(crate) struct WaitQueue {
    entries: VecDeque<QueuedWaiter>,
}

impl WaitQueue {
    /// Insert keeping ascending order. Backends usually arrive in commit
    /// order, so the scan from the tail terminates immediately in the
    /// common case.
    pub fn insert(&mut self, lsn: Lsn, handle: Arc<SyncWaitHandle>) {
        let mut at = self.entries.len();
        while at > 0 && self.entries[at - 1].lsn >= lsn {
            at -= 1;
        }
        self.entries.insert(at, QueuedWaiter { lsn, handle });
        debug_assert!(self.is_strictly_ordered());
    }

    /// Release every waiter at or below `lsn`: mark it complete, unlink
    /// it, then set its latch, in that order.
    pub fn wake_up_to(&mut self, lsn: Lsn) -> usize {
        let mut woken = 0;
        while self.entries.front().is_some_and(|w| w.lsn <= lsn) {
            let waiter = self.entries.pop_front().expect("checked front");
            waiter.handle.complete();
            waiter.handle.latch.set();
            woken += 1;
        }
        woken
    }

    /// Release everyone unconditionally (the standby set became empty).
    pub fn wake_all(&mut self) -> usize {
        let mut woken = 0;
        while let Some(waiter) = self.entries.pop_front() {
            waiter.handle.complete();
            waiter.handle.latch.set();
            woken += 1;
        }
        woken
    }

    /// Unlink a canceled waiter.
    pub fn detach(&mut self, handle: &Arc<SyncWaitHandle>) {
        self.entries.retain(|w| !Arc::ptr_eq(&w.handle, handle));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_strictly_ordered(&self) -> bool {
        self.entries
            .iter()
            .zip(self.entries.iter().skip(1))
            .all(|(a, b)| a.lsn < b.lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<SyncWaitHandle> {
        Arc::new(SyncWaitHandle::new_waiting(Arc::new(Latch::new())))
    }

    #[test]
    fn out_of_order_arrivals_are_sorted() {
        let mut queue = WaitQueue::default();
        queue.insert(Lsn(0x300), handle());
        queue.insert(Lsn(0x100), handle());
        queue.insert(Lsn(0x200), handle());
        assert!(queue.is_strictly_ordered());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn wake_releases_only_up_to_the_given_position() {
        let mut queue = WaitQueue::default();
        let low = handle();
        let high = handle();
        queue.insert(Lsn(0x100), low.clone());
        queue.insert(Lsn(0x900), high.clone());

        assert_eq!(queue.wake_up_to(Lsn(0x500)), 1);
        assert!(low.is_complete());
        assert!(high.is_waiting());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn wake_all_empties_the_queue() {
        let mut queue = WaitQueue::default();
        let a = handle();
        let b = handle();
        queue.insert(Lsn(0x100), a.clone());
        queue.insert(Lsn(0x200), b.clone());

        assert_eq!(queue.wake_all(), 2);
        assert!(a.is_complete() && b.is_complete());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn detach_unlinks_one_waiter() {
        let mut queue = WaitQueue::default();
        let a = handle();
        let b = handle();
        queue.insert(Lsn(0x100), a.clone());
        queue.insert(Lsn(0x200), b);

        queue.detach(&a);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.wake_up_to(Lsn(0x200)), 1);
    }
}
