//! Sync replication error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncRepError>;

#[derive(Debug, Error)]
pub enum SyncRepError {
    #[error("invalid synchronous_standby_names value: {0}")]
    BadStandbyNames(String),

    #[error("out of replication sender slots")]
    SendersExhausted,
}
