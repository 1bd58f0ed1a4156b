//! In-memory participant driver
//!
//! A fully capable adapter backed by process memory. Useful on its own for
//! single-process setups and heavily used by the test suites of the
//! transaction manager and the resolver, which inject failures through the
//! knobs on [`MemoryDriverState`].

use crate::contract::{ParticipantDriver, ParticipantKey, PrepareId, Resolution};
use crate::error::{DriverError, Result};
use async_trait::async_trait;
use fedtx_common::Xid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Observable state of a [`MemoryDriver`].
#[derive(Debug, Default)]
pub struct MemoryDriverState {
    /// Prepared transactions, keyed by identifier bytes.
    pub prepared: HashMap<Vec<u8>, Xid>,
    /// Transactions finalized with commit, one-phase or prepared.
    pub committed: Vec<Xid>,
    /// Transactions finalized with rollback, one-phase or prepared.
    pub rolled_back: Vec<Xid>,
    /// Remaining number of prepare calls that fail.
    pub fail_prepares: u32,
    /// Remaining number of resolve calls that fail transiently.
    pub fail_resolves: u32,
    /// Remaining number of one-phase commit/rollback calls that fail.
    pub fail_one_phase: u32,
}

/// Prepare-capable in-memory adapter.
pub struct MemoryDriver {
    two_phase: bool,
    state: Arc<Mutex<MemoryDriverState>>,
}

impl MemoryDriver {
    /// A two-phase-capable driver.
    pub fn new() -> Self {
        Self {
            two_phase: true,
            state: Arc::new(Mutex::new(MemoryDriverState::default())),
        }
    }

    /// A driver limited to one-phase commit and rollback.
    pub fn one_phase_only() -> Self {
        Self {
            two_phase: false,
            state: Arc::new(Mutex::new(MemoryDriverState::default())),
        }
    }

    pub fn state(&self) -> Arc<Mutex<MemoryDriverState>> {
        self.state.clone()
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ParticipantDriver for MemoryDriver {
    async fn commit(&self, xid: Xid, _key: &ParticipantKey) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_one_phase > 0 {
            state.fail_one_phase -= 1;
            return Err(DriverError::Transient("injected commit failure".into()));
        }
        state.committed.push(xid);
        Ok(())
    }

    async fn rollback(&self, xid: Xid, _key: &ParticipantKey) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_one_phase > 0 {
            state.fail_one_phase -= 1;
            return Err(DriverError::Transient("injected rollback failure".into()));
        }
        state.rolled_back.push(xid);
        Ok(())
    }

    fn supports_two_phase(&self) -> bool {
        self.two_phase
    }

    async fn prepare(&self, xid: Xid, _key: &ParticipantKey, id: &PrepareId) -> Result<()> {
        if !self.two_phase {
            return Err(DriverError::PrepareUnsupported);
        }
        let mut state = self.state.lock();
        if state.fail_prepares > 0 {
            state.fail_prepares -= 1;
            return Err(DriverError::Transient("injected prepare failure".into()));
        }
        state.prepared.insert(id.as_bytes().to_vec(), xid);
        Ok(())
    }

    async fn resolve(
        &self,
        _xid: Xid,
        _key: &ParticipantKey,
        id: &PrepareId,
        commit: bool,
    ) -> Result<Resolution> {
        if !self.two_phase {
            return Err(DriverError::ResolveUnsupported);
        }
        let mut state = self.state.lock();
        if state.fail_resolves > 0 {
            state.fail_resolves -= 1;
            return Err(DriverError::Transient("injected resolve failure".into()));
        }
        match state.prepared.remove(id.as_bytes()) {
            Some(xid) => {
                if commit {
                    state.committed.push(xid);
                } else {
                    state.rolled_back.push(xid);
                }
                Ok(Resolution::Resolved)
            }
            None => Ok(Resolution::Missing),
        }
    }
}
