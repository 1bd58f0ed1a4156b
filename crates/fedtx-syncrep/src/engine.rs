//! Wait and release machinery
//!
//! `wait_for_lsn` parks a committing backend until the configured
//! standby group acknowledges its commit position; `release_for` is the
//! sender side that advances the advertised positions and wakes
//! waiters. Both run against one shared structure guarded by a single
//! lock, with per-sender slots locked individually underneath it.

use crate::group::{self, GroupNode, StandbyProgress};
use crate::queue::{SyncWaitHandle, WaitQueue};
use crate::senders::{SenderHandle, SenderSlot, SenderState};
use crate::{Result, SyncRepError, WaitMode, NUM_WAIT_MODES};
use fedtx_common::{Latch, Lsn, Shutdown, SyncCommitLevel, SyncRepConfig};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Pending-signal flags of one backend, plus its process latch.
/// Requesters only set a flag and the latch; the wait loop is where the
/// reaction happens.
#[derive(Debug, Default)]
pub struct BackendSignals {
    terminate: AtomicBool,
    query_cancel: AtomicBool,
    latch: Arc<Latch>,
}

impl BackendSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Release);
        self.latch.set();
    }

    pub fn request_query_cancel(&self) {
        self.query_cancel.store(true, Ordering::Release);
        self.latch.set();
    }

    pub fn terminate_pending(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    fn take_query_cancel(&self) -> bool {
        self.query_cancel.swap(false, Ordering::AcqRel)
    }
}

/// How a `wait_for_lsn` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// No wait was needed: sync replication is off, no standbys are
    /// defined, or the position was already acknowledged.
    Immediate,
    /// The standby group acknowledged the commit position.
    Completed,
    /// Query cancel arrived mid-wait; the commit is local-only.
    CanceledQuery,
    /// Termination arrived mid-wait; the commit is local-only and the
    /// termination request stays pending.
    CanceledTermination,
    /// System shutdown; treated like termination.
    Shutdown,
}

struct SyncShared {
    queues: [WaitQueue; NUM_WAIT_MODES],
    /// Advertised positions: everything at or below has been released.
    lsn: [Lsn; NUM_WAIT_MODES],
    standbys_defined: bool,
    group: Option<GroupNode>,
    wait_mode: Option<WaitMode>,
}

pub struct SyncRepCtl {
    shared: Mutex<SyncShared>,
    senders: Vec<Mutex<Option<SenderSlot>>>,
    shutdown: Shutdown,
}

fn wait_mode_of(level: SyncCommitLevel) -> Option<WaitMode> {
    match level {
        SyncCommitLevel::Off | SyncCommitLevel::Local => None,
        SyncCommitLevel::RemoteWrite => Some(WaitMode::Write),
        SyncCommitLevel::On => Some(WaitMode::Flush),
    }
}

impl SyncRepCtl {
    pub fn new(config: &SyncRepConfig, max_senders: usize, shutdown: Shutdown) -> Result<Arc<Self>> {
        let group = group::parse(&config.synchronous_standby_names)?;
        Ok(Arc::new(Self {
            shared: Mutex::new(SyncShared {
                queues: Default::default(),
                lsn: [Lsn::INVALID; NUM_WAIT_MODES],
                standbys_defined: group.is_some(),
                group,
                wait_mode: wait_mode_of(config.synchronous_commit),
            }),
            senders: (0..max_senders).map(|_| Mutex::new(None)).collect(),
            shutdown,
        }))
    }

    /// Register a replication sender under its standby name. Cascading
    /// senders never become synchronous.
    pub fn register_sender(
        self: &Arc<Self>,
        name: impl Into<String>,
        cascading: bool,
    ) -> Result<SenderHandle> {
        let name = name.into();
        let priority = if cascading {
            0
        } else {
            self.shared
                .lock()
                .group
                .as_ref()
                .map_or(0, |g| g.standby_priority(&name))
        };

        for (idx, slot) in self.senders.iter().enumerate() {
            let mut slot = slot.lock();
            if slot.is_none() {
                *slot = Some(SenderSlot {
                    name,
                    cascading,
                    state: SenderState::Startup,
                    write: Lsn::INVALID,
                    flush: Lsn::INVALID,
                    priority,
                });
                return Ok(SenderHandle {
                    ctl: self.clone(),
                    slot: idx,
                    announced: AtomicBool::new(false),
                });
            }
        }
        Err(SyncRepError::SendersExhausted)
    }

    /// Wait until the standby group acknowledges `commit_lsn`.
    ///
    /// Called on the commit path after the commit record is locally
    /// flushed. Fast path: nothing to wait for. Otherwise link into the
    /// mode's queue and park on the latch until a sender (or a
    /// configuration change, or a signal) releases us.
    pub async fn wait_for_lsn(&self, commit_lsn: Lsn, signals: &BackendSignals) -> WaitOutcome {
        let (handle, mode) = {
            let mut shared = self.shared.lock();
            let Some(mode) = shared.wait_mode else {
                return WaitOutcome::Immediate;
            };
            if !shared.standbys_defined || shared.lsn[mode as usize] >= commit_lsn {
                return WaitOutcome::Immediate;
            }
            let handle = Arc::new(SyncWaitHandle::new_waiting(signals.latch.clone()));
            shared.queues[mode as usize].insert(commit_lsn, handle.clone());
            (handle, mode)
        };

        loop {
            handle.latch.reset();

            if handle.is_complete() {
                handle.set_not_waiting();
                return WaitOutcome::Completed;
            }

            // Past this point the transaction is already committed
            // locally, so neither termination nor query cancel may turn
            // into an error; both downgrade to a warning and end the
            // wait. Termination stays pending so the process still dies
            // once the commit is cleaned up.
            if signals.terminate_pending() {
                tracing::warn!(
                    "canceling the wait for synchronous replication due to termination request; \
                     the transaction committed locally but might not have been replicated"
                );
                self.cancel_wait(mode, &handle);
                return WaitOutcome::CanceledTermination;
            }
            if signals.take_query_cancel() {
                tracing::warn!(
                    "canceling wait for synchronous replication due to user request; \
                     the transaction committed locally but might not have been replicated"
                );
                self.cancel_wait(mode, &handle);
                return WaitOutcome::CanceledQuery;
            }
            if self.shutdown.is_triggered() {
                signals.request_terminate();
                self.cancel_wait(mode, &handle);
                return WaitOutcome::Shutdown;
            }

            tokio::select! {
                _ = handle.latch.wait() => {}
                _ = self.shutdown.wait() => {}
            }
        }
    }

    fn cancel_wait(&self, mode: WaitMode, handle: &Arc<SyncWaitHandle>) {
        let mut shared = self.shared.lock();
        shared.queues[mode as usize].detach(handle);
        handle.set_not_waiting();
    }

    /// Sender side: compute the group's safe positions and release
    /// waiters. The safe positions are re-read under the lock on every
    /// pass, and a sender never advertises a position it has not itself
    /// reached.
    pub(crate) fn release_for(&self, slot: usize, announced: &AtomicBool) -> (usize, usize) {
        let (name, state, write, flush, priority) = {
            let slot = self.senders[slot].lock();
            match slot.as_ref() {
                Some(s) => (s.name.clone(), s.state, s.write, s.flush, s.priority),
                None => return (0, 0),
            }
        };
        if priority == 0 || state != SenderState::Streaming || !flush.is_valid() {
            return (0, 0);
        }

        if !announced.swap(true, Ordering::AcqRel) {
            tracing::info!(
                "standby \"{name}\" is now a synchronous standby with priority {priority}"
            );
        }

        let mut shared = self.shared.lock();
        let Some(group) = shared.group.clone() else {
            return (0, 0);
        };
        let active = self.active_standbys();
        let Some((safe_write, safe_flush)) = group.synced_lsns(&active) else {
            return (0, 0);
        };

        let mut released = (0, 0);
        if safe_write > shared.lsn[WaitMode::Write as usize] && write >= safe_write {
            shared.lsn[WaitMode::Write as usize] = safe_write;
            released.0 = shared.queues[WaitMode::Write as usize].wake_up_to(safe_write);
        }
        if safe_flush > shared.lsn[WaitMode::Flush as usize] && flush >= safe_flush {
            shared.lsn[WaitMode::Flush as usize] = safe_flush;
            released.1 = shared.queues[WaitMode::Flush as usize].wake_up_to(safe_flush);
        }
        drop(shared);

        if released.0 > 0 || released.1 > 0 {
            tracing::debug!(
                "released {} waiter(s) up to write {safe_write}, {} up to flush {safe_flush}",
                released.0,
                released.1
            );
        }
        released
    }

    /// Snapshot of every sender that currently counts for the group:
    /// registered, streaming, synchronous, with a valid flush position.
    fn active_standbys(&self) -> Vec<StandbyProgress> {
        self.senders
            .iter()
            .filter_map(|slot| {
                let slot = slot.lock();
                let s = slot.as_ref()?;
                (s.state == SenderState::Streaming && s.priority > 0 && s.flush.is_valid()).then(
                    || StandbyProgress {
                        name: s.name.clone(),
                        write: s.write,
                        flush: s.flush,
                    },
                )
            })
            .collect()
    }

    /// Apply a configuration change: rebuild the group tree, recompute
    /// sender priorities, and wake everyone unconditionally when the
    /// standby set became empty (there is nothing left to wait for, and
    /// newly arriving backends skip the queue while it stays empty).
    pub fn reload(&self, config: &SyncRepConfig) -> Result<()> {
        let group = group::parse(&config.synchronous_standby_names)?;
        let defined = group.is_some();

        {
            let mut shared = self.shared.lock();
            if shared.standbys_defined && !defined {
                let woken: usize = shared.queues.iter_mut().map(|q| q.wake_all()).sum();
                if woken > 0 {
                    tracing::info!(
                        "synchronous standby names cleared; released {woken} waiting backend(s)"
                    );
                }
            }
            shared.wait_mode = wait_mode_of(config.synchronous_commit);
            shared.group = group.clone();
            shared.standbys_defined = defined;
        }

        for slot in &self.senders {
            let mut slot = slot.lock();
            if let Some(s) = slot.as_mut() {
                s.priority = if s.cascading {
                    0
                } else {
                    group.as_ref().map_or(0, |g| g.standby_priority(&s.name))
                };
            }
        }
        Ok(())
    }

    /// Advertised position of a wait mode.
    pub fn advertised(&self, mode: WaitMode) -> Lsn {
        self.shared.lock().lsn[mode as usize]
    }

    /// Number of backends parked on a mode's queue.
    pub fn queue_depth(&self, mode: WaitMode) -> usize {
        self.shared.lock().queues[mode as usize].len()
    }

    pub(crate) fn sender_set_state(&self, slot: usize, state: SenderState) {
        if let Some(s) = self.senders[slot].lock().as_mut() {
            s.state = state;
        }
    }

    pub(crate) fn sender_update_progress(&self, slot: usize, write: Lsn, flush: Lsn) {
        if let Some(s) = self.senders[slot].lock().as_mut() {
            s.write = write;
            s.flush = flush;
        }
    }

    pub(crate) fn sender_priority(&self, slot: usize) -> i32 {
        self.senders[slot].lock().as_ref().map_or(0, |s| s.priority)
    }

    pub(crate) fn sender_disconnect(&self, slot: usize) {
        *self.senders[slot].lock() = None;
    }
}
