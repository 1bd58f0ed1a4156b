//! Static adapter registry
//!
//! Adapters are registered once by name; foreign servers are then bound
//! to an adapter. Lookups happen on every commit-path driver call, so the
//! maps are concurrent rather than behind a single lock.

use crate::contract::ParticipantDriver;
use crate::error::{DriverError, Result};
use dashmap::DashMap;
use fedtx_common::ServerId;
use std::sync::Arc;

#[derive(Default)]
pub struct DriverRegistry {
    adapters: DashMap<String, Arc<dyn ParticipantDriver>>,
    bindings: DashMap<ServerId, String>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `name`, replacing any previous one.
    pub fn register(&self, name: impl Into<String>, driver: Arc<dyn ParticipantDriver>) {
        self.adapters.insert(name.into(), driver);
    }

    /// Bind a foreign server to a registered adapter.
    pub fn bind_server(&self, server: ServerId, adapter: impl Into<String>) -> Result<()> {
        let adapter = adapter.into();
        if !self.adapters.contains_key(&adapter) {
            return Err(DriverError::UnknownAdapter(adapter));
        }
        self.bindings.insert(server, adapter);
        Ok(())
    }

    /// Driver responsible for the given foreign server.
    pub fn driver_for(&self, server: ServerId) -> Result<Arc<dyn ParticipantDriver>> {
        let name = self
            .bindings
            .get(&server)
            .ok_or(DriverError::UnknownServer(server))?;
        self.adapters
            .get(name.value())
            .map(|d| d.value().clone())
            .ok_or_else(|| DriverError::UnknownAdapter(name.value().clone()))
    }
}
