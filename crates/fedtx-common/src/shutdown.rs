//! System-wide shutdown signal
//!
//! The analogue of postmaster death: a one-way latch that every blocking
//! loop selects on. Once triggered it never resets.

use crate::Latch;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<Latch>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger shutdown. Idempotent.
    pub fn trigger(&self) {
        self.inner.set();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.is_set()
    }

    /// Wait until shutdown is triggered.
    pub async fn wait(&self) {
        self.inner.wait().await;
    }
}
