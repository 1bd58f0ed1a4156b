//! Shared building blocks for the fedtx workspace
//!
//! Everything in here is dependency-light on purpose: identifier newtypes,
//! log sequence numbers, the latch wakeup primitive that backends and
//! background workers block on, and the configuration structs consumed by
//! the transaction manager, the resolver subsystem and the synchronous
//! replication engine.

mod config;
mod ids;
mod latch;
mod lsn;
mod shutdown;

pub use config::{
    ConfigError, ResolverConfig, SyncCommitLevel, SyncRepConfig, TwophaseCommitLevel, XactConfig,
};
pub use ids::{BackendId, DatabaseId, ServerId, UserId, UserMappingId, Xid};
pub use latch::Latch;
pub use lsn::Lsn;
pub use shutdown::Shutdown;
