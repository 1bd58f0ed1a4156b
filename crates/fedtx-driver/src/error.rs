//! Driver error types

use fedtx_common::ServerId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

#[derive(Debug, Error, Clone)]
pub enum DriverError {
    /// Retryable failure talking to the participant; the caller keeps the
    /// prepared transaction around and a resolver retries later.
    #[error("transient driver failure: {0}")]
    Transient(String),

    #[error("driver does not support preparing foreign transactions")]
    PrepareUnsupported,

    #[error("driver does not support resolving prepared foreign transactions")]
    ResolveUnsupported,

    #[error("prepared transaction identifier is {0} bytes, limit is {1}")]
    IdTooLong(usize, usize),

    #[error("no driver bound to foreign server {0}")]
    UnknownServer(ServerId),

    #[error("no driver registered under name {0:?}")]
    UnknownAdapter(String),
}
