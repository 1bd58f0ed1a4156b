//! Replication sender slots

use crate::engine::SyncRepCtl;
use fedtx_common::Lsn;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Lifecycle of a replication sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Startup,
    Streaming,
    Stopping,
}

/// One registered sender, stored in its slot.
pub(crate) struct SenderSlot {
    pub name: String,
    pub cascading: bool,
    pub state: SenderState,
    pub write: Lsn,
    pub flush: Lsn,
    pub priority: i32,
}

/// Handle a replication sender task uses to report progress and release
/// waiting backends.
pub struct SenderHandle {
    pub(crate) ctl: Arc<SyncRepCtl>,
    pub(crate) slot: usize,
    pub(crate) announced: AtomicBool,
}

impl SenderHandle {
    pub fn set_state(&self, state: SenderState) {
        self.ctl.sender_set_state(self.slot, state);
    }

    /// Record the standby's reported write/flush positions.
    pub fn update_progress(&self, write: Lsn, flush: Lsn) {
        self.ctl.sender_update_progress(self.slot, write, flush);
    }

    /// Release backends whose commit position the standby group has now
    /// reached. Returns how many waiters were released per mode
    /// (write, flush).
    pub fn release_waiters(&self) -> (usize, usize) {
        self.ctl.release_for(self.slot, &self.announced)
    }

    pub fn priority(&self) -> i32 {
        self.ctl.sender_priority(self.slot)
    }

    /// Drop out of the sender table (connection closed).
    pub fn disconnect(&self) {
        self.ctl.sender_disconnect(self.slot);
    }
}
