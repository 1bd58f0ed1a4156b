//! WAL error types
//!
//! Log I/O failures are fatal to the operation that triggered them; the
//! commit path treats any append or flush error as unrecoverable.

use fedtx_common::Lsn;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WalError>;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a log file (bad magic)")]
    BadMagic,

    #[error("corrupt log record at {lsn}: {reason}")]
    Corrupt { lsn: Lsn, reason: String },

    #[error("no log record at {0}")]
    NoRecord(Lsn),
}
