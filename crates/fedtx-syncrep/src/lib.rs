//! Synchronous replication wait engine
//!
//! If requested, transaction commits wait until their commit position in
//! the log is acknowledged by the synchronous standbys. All waiting and
//! releasing happens on the primary: committing backends park on a
//! per-mode queue ordered by commit position, and replication senders
//! release them as the standbys report progress. The standby side is
//! completely unaware of these durability requirements.
//!
//! The engine never aborts a transaction. Once the local commit record
//! is flushed the transaction is durable locally; canceling the wait
//! only changes when the client is acknowledged, which is why every
//! cancellation path downgrades to a warning.

mod engine;
mod error;
mod group;
mod queue;
mod senders;

pub use engine::{BackendSignals, SyncRepCtl, WaitOutcome};
pub use error::{Result, SyncRepError};
pub use group::{GroupMember, GroupNode};
pub use senders::{SenderHandle, SenderState};

/// Which standby acknowledgement a committing backend waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Released once the standbys have written the commit record.
    Write = 0,
    /// Released once the standbys have flushed the commit record.
    Flush = 1,
}

pub(crate) const NUM_WAIT_MODES: usize = 2;
