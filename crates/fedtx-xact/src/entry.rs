//! Registry entry types

use fedtx_common::{BackendId, DatabaseId, Lsn, ServerId, UserId, UserMappingId, Xid};
use fedtx_driver::PrepareId;
use std::fmt;

/// Index of an entry slot in the registry arena.
pub type EntryIdx = usize;

/// State of a prepared foreign transaction entry. This doubles as the
/// action to be taken on the entry when it is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XactStatus {
    /// Slot is free or being recycled.
    Invalid,
    /// The foreign transaction is being prepared.
    Preparing,
    /// Prepared on the participant; awaiting a decision.
    Prepared,
    /// Decision made: commit the prepared transaction.
    Committing,
    /// Decision made: roll the prepared transaction back.
    Aborting,
}

impl XactStatus {
    pub(crate) fn to_u16(self) -> u16 {
        match self {
            XactStatus::Invalid => 0,
            XactStatus::Preparing => 1,
            XactStatus::Prepared => 2,
            XactStatus::Committing => 3,
            XactStatus::Aborting => 4,
        }
    }

    pub(crate) fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => XactStatus::Invalid,
            1 => XactStatus::Preparing,
            2 => XactStatus::Prepared,
            3 => XactStatus::Committing,
            4 => XactStatus::Aborting,
            _ => return None,
        })
    }

    /// The commit flag a resolver passes to the driver for an entry in
    /// this state. An entry found `Prepared` with no recorded decision is
    /// committed on resurrection; a `Preparing` entry never reached the
    /// participant, so rolling back is safe and idempotent.
    pub fn resolve_as_commit(self) -> bool {
        matches!(self, XactStatus::Prepared | XactStatus::Committing)
    }
}

impl fmt::Display for XactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XactStatus::Invalid => "invalid",
            XactStatus::Preparing => "preparing",
            XactStatus::Prepared => "prepared",
            XactStatus::Committing => "committing",
            XactStatus::Aborting => "aborting",
        };
        write!(f, "{name}")
    }
}

/// Immutable identity of an entry, fixed at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryIdentity {
    pub dbid: DatabaseId,
    pub local_xid: Xid,
    pub server: ServerId,
    pub user: UserId,
    pub umid: UserMappingId,
}

/// Entry payload, written under the registry write lock when a slot is
/// allocated or released.
#[derive(Debug, Clone)]
pub(crate) struct EntryData {
    pub ident: EntryIdentity,
    pub prepare_id: PrepareId,
    pub insert_start_lsn: Lsn,
    pub insert_end_lsn: Lsn,
}

/// The four-field status region plus claim tracking, guarded by the
/// per-entry lock so status flips never need the registry lock.
#[derive(Debug, Clone)]
pub(crate) struct EntryFlags {
    pub status: XactStatus,
    /// True once the insertion record is flushed (or the entry was read
    /// back from a state file).
    pub valid: bool,
    /// True once the entry has been spilled to the state file directory.
    pub ondisk: bool,
    /// True if the entry was reconstructed from the log during recovery.
    pub inredo: bool,
    /// True if the owning backend is gone and nobody has resolved the
    /// entry yet.
    pub indoubt: bool,
    /// A resolver has claimed the entry for one finalize attempt.
    pub inprocessing: bool,
    /// Backend currently working on this entry.
    pub held_by: Option<BackendId>,
}

impl EntryFlags {
    pub(crate) fn cleared() -> Self {
        Self {
            status: XactStatus::Invalid,
            valid: false,
            ondisk: false,
            inredo: false,
            indoubt: false,
            inprocessing: false,
            held_by: None,
        }
    }
}

/// One row of the observability view over the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignXactRow {
    pub local_xid: Xid,
    pub dbid: DatabaseId,
    pub server: ServerId,
    pub user: UserId,
    pub status: XactStatus,
    pub indoubt: bool,
    pub ondisk: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_u16_roundtrip() {
        for status in [
            XactStatus::Invalid,
            XactStatus::Preparing,
            XactStatus::Prepared,
            XactStatus::Committing,
            XactStatus::Aborting,
        ] {
            assert_eq!(XactStatus::from_u16(status.to_u16()), Some(status));
        }
        assert_eq!(XactStatus::from_u16(99), None);
    }

    #[test]
    fn resolution_direction_follows_last_known_status() {
        assert!(XactStatus::Committing.resolve_as_commit());
        assert!(XactStatus::Prepared.resolve_as_commit());
        assert!(!XactStatus::Aborting.resolve_as_commit());
        assert!(!XactStatus::Preparing.resolve_as_commit());
    }
}
