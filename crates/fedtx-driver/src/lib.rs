//! Participant driver contract
//!
//! A driver adapts one kind of foreign data source to the transaction
//! manager. Every driver can commit and roll back a foreign transaction in
//! one phase; drivers that additionally implement `prepare` and `resolve`
//! can take part in two-phase commit. Adapters are registered once by name
//! and bound to foreign servers, replacing any dynamic plugin discovery.

mod contract;
mod error;
mod memory;
mod registry;

pub use contract::{ParticipantDriver, ParticipantKey, PrepareId, Resolution, MAX_PREPARE_ID_LEN};
pub use error::{DriverError, Result};
pub use memory::{MemoryDriver, MemoryDriverState};
pub use registry::DriverRegistry;
