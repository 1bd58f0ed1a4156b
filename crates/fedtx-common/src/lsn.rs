//! Log sequence numbers

use serde::{Deserialize, Serialize};
use std::fmt;

/// A byte position in the write-ahead log.
///
/// Totally ordered; durable once the log has been flushed past it.
/// Position zero is reserved as the invalid LSN.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn advance(self, bytes: u64) -> Lsn {
        Lsn(self.0 + bytes)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Customary split rendering: high 32 bits / low 32 bits in hex.
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_and_advance() {
        let a = Lsn(0x100);
        let b = a.advance(0x50);
        assert!(a < b);
        assert_eq!(b, Lsn(0x150));
    }

    #[test]
    fn display_splits_halves() {
        assert_eq!(Lsn(0x1_0000_0200).to_string(), "1/200");
    }
}
