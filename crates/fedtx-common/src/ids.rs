//! Identifier newtypes
//!
//! The local transaction manager hands out transaction ids; databases,
//! foreign servers, users and user mappings are identified by opaque
//! 32-bit ids assigned by the catalog. Backends are slots in a fixed
//! process table. Wrapping them keeps the call sites honest about which
//! of the five u32-shaped things is being passed around.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Local transaction identifier, monotonically assigned by the local
/// transaction manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid(pub u32);

impl Xid {
    pub const INVALID: Xid = Xid(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! oid_like {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(0);

            pub fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

oid_like!(
    /// Database owning a distributed transaction.
    DatabaseId
);
oid_like!(
    /// Foreign server identity.
    ServerId
);
oid_like!(
    /// Authenticating principal on the foreign server.
    UserId
);
oid_like!(
    /// User-mapping identity, the key a driver uses to find its connection.
    UserMappingId
);

/// Slot index of a backend in the process table.
///
/// Waiters and registry entries reference each other through this id
/// instead of owning pointers, so entries never keep a dead backend alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendId(pub u32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend#{}", self.0)
    }
}
