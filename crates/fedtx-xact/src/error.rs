//! Error types for the foreign transaction manager

use fedtx_common::{DatabaseId, ServerId, UserId};
use fedtx_driver::DriverError;
use fedtx_wal::WalError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, XactError>;

#[derive(Debug, Error)]
pub enum XactError {
    /// Two-phase commit is required but a modifying participant cannot
    /// prepare.
    #[error("cannot prepare transaction on foreign server {server}: two-phase commit unsupported")]
    TwophaseUnsupported { server: ServerId },

    /// Two-phase commit would be required but is disabled by configuration.
    #[error(
        "cannot commit: transaction modified multiple data sources but \
         foreign_twophase_commit is disabled"
    )]
    TwophaseNotAllowed,

    /// The entry pool is full (or sized zero).
    #[error("maximum number of prepared foreign transactions reached ({capacity}); \
             increase max_prepared_foreign_xacts")]
    PoolExhausted { capacity: usize },

    #[error("duplicate foreign transaction entry for database {dbid}, server {server}, user {user}")]
    DuplicateEntry {
        dbid: DatabaseId,
        server: ServerId,
        user: UserId,
    },

    /// A participant failed to prepare; the local commit must fail.
    #[error("could not prepare transaction on foreign server {server}: {source}")]
    PrepareFailed {
        server: ServerId,
        source: DriverError,
    },

    #[error("foreign transaction state file {path:?} is corrupt")]
    StateFileCorrupt { path: PathBuf },

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("state directory I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
