//! The driver trait and its supporting types

use crate::error::{DriverError, Result};
use async_trait::async_trait;
use fedtx_common::{ServerId, UserId, UserMappingId, Xid};
use std::fmt;

/// Upper bound on a prepared-transaction identifier.
pub const MAX_PREPARE_ID_LEN: usize = 200;

/// Connection identity a driver call operates on.
///
/// The user-mapping id is the key drivers use to look up their connection;
/// server and user ids ride along for error reporting and identifier
/// generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticipantKey {
    pub server: ServerId,
    pub user: UserId,
    pub umid: UserMappingId,
}

/// A participant-unique name for a prepared foreign transaction.
///
/// Bounded byte string; the bound is enforced at construction so the
/// registry and the on-disk formats never see an oversized identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrepareId(Vec<u8>);

impl PrepareId {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() > MAX_PREPARE_ID_LEN {
            return Err(DriverError::IdTooLong(bytes.len(), MAX_PREPARE_ID_LEN));
        }
        Ok(Self(bytes))
    }

    /// Default identifier shape: `px-<xid>-<server>-<user>`.
    pub fn generate(xid: Xid, key: &ParticipantKey) -> Self {
        Self(format!("px-{}-{}-{}", xid.0, key.server.0, key.user.0).into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PrepareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Outcome of finalizing a prepared participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The participant applied the commit or rollback.
    Resolved,
    /// The participant reports the prepared transaction no longer exists.
    /// Treated as success so that resolving is idempotent.
    Missing,
}

/// Capability set a data-source adapter exposes to the transaction
/// manager.
///
/// `commit` and `rollback` are required. The default `prepare`/`resolve`
/// implementations report the capability as absent, which excludes the
/// adapter from two-phase commit. Repeated `resolve` calls with the same
/// identifier and commit flag must converge to the same terminal state.
/// Calls for a given user mapping are serialized by the caller, so drivers
/// need not synchronize across distinct connections.
#[async_trait]
pub trait ParticipantDriver: Send + Sync {
    /// One-phase commit of the foreign transaction.
    async fn commit(&self, xid: Xid, key: &ParticipantKey) -> Result<()>;

    /// One-phase rollback of the foreign transaction.
    async fn rollback(&self, xid: Xid, key: &ParticipantKey) -> Result<()>;

    /// Whether this adapter can take part in two-phase commit.
    fn supports_two_phase(&self) -> bool {
        false
    }

    /// Durably prepare the foreign transaction under `id`.
    async fn prepare(&self, _xid: Xid, _key: &ParticipantKey, _id: &PrepareId) -> Result<()> {
        Err(DriverError::PrepareUnsupported)
    }

    /// Finalize a previously prepared foreign transaction.
    async fn resolve(
        &self,
        _xid: Xid,
        _key: &ParticipantKey,
        _id: &PrepareId,
        _commit: bool,
    ) -> Result<Resolution> {
        Err(DriverError::ResolveUnsupported)
    }

    /// Produce the identifier the transaction will be prepared under.
    fn make_prepare_id(&self, xid: Xid, key: &ParticipantKey) -> Result<PrepareId> {
        Ok(PrepareId::generate(xid, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_within_bounds() {
        let key = ParticipantKey {
            server: ServerId(u32::MAX),
            user: UserId(u32::MAX),
            umid: UserMappingId(1),
        };
        let id = PrepareId::generate(Xid(u32::MAX), &key);
        assert!(id.len() <= MAX_PREPARE_ID_LEN);
    }

    #[test]
    fn oversized_id_is_rejected() {
        let err = PrepareId::new(vec![0u8; MAX_PREPARE_ID_LEN + 1]).unwrap_err();
        assert!(matches!(err, DriverError::IdTooLong(201, 200)));
    }
}
