//! Write-ahead log for foreign transaction state
//!
//! A single append-only log file. Each record carries a small frame header
//! (kind, body length, CRC32C of the body) followed by a little-endian
//! body. Appending returns the start and end positions of the frame;
//! nothing is durable until the log has been flushed past the end
//! position. Recovery replays frames in order and stops at the first
//! incomplete or corrupt frame, which is the expected shape of a torn
//! tail after a crash.

mod error;
mod log;
mod record;

pub use error::{Result, WalError};
pub use log::Wal;
pub use record::{InsertPrepareRecord, RemovePrepareRecord, WalRecord};
