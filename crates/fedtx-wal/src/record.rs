//! Log record bodies
//!
//! Two record kinds exist: one written when a foreign transaction entry is
//! registered for prepare, one when the entry reaches its terminal
//! resolution. Bodies are little-endian with the prepared-transaction
//! identifier length-prefixed by a u16.

use crate::error::{Result, WalError};
use fedtx_common::{DatabaseId, Lsn, ServerId, UserId, UserMappingId, Xid};

/// Body of the record inserted when a participant is registered for
/// prepare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertPrepareRecord {
    pub dbid: DatabaseId,
    pub server: ServerId,
    pub user: UserId,
    pub umid: UserMappingId,
    pub local_xid: Xid,
    pub prepare_id: Vec<u8>,
}

/// Body of the record written on terminal resolution of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovePrepareRecord {
    pub dbid: DatabaseId,
    pub server: ServerId,
    pub user: UserId,
    pub local_xid: Xid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    InsertPrepare(InsertPrepareRecord),
    RemovePrepare(RemovePrepareRecord),
}

pub(crate) const KIND_INSERT_PREPARE: u8 = 0x00;
pub(crate) const KIND_REMOVE_PREPARE: u8 = 0x10;

impl WalRecord {
    pub(crate) fn kind(&self) -> u8 {
        match self {
            WalRecord::InsertPrepare(_) => KIND_INSERT_PREPARE,
            WalRecord::RemovePrepare(_) => KIND_REMOVE_PREPARE,
        }
    }

    pub(crate) fn encode_body(&self) -> Vec<u8> {
        match self {
            WalRecord::InsertPrepare(rec) => {
                let mut buf = Vec::with_capacity(22 + rec.prepare_id.len());
                buf.extend_from_slice(&rec.dbid.0.to_le_bytes());
                buf.extend_from_slice(&rec.server.0.to_le_bytes());
                buf.extend_from_slice(&rec.user.0.to_le_bytes());
                buf.extend_from_slice(&rec.umid.0.to_le_bytes());
                buf.extend_from_slice(&rec.local_xid.0.to_le_bytes());
                buf.extend_from_slice(&(rec.prepare_id.len() as u16).to_le_bytes());
                buf.extend_from_slice(&rec.prepare_id);
                buf
            }
            WalRecord::RemovePrepare(rec) => {
                let mut buf = Vec::with_capacity(16);
                buf.extend_from_slice(&rec.dbid.0.to_le_bytes());
                buf.extend_from_slice(&rec.server.0.to_le_bytes());
                buf.extend_from_slice(&rec.user.0.to_le_bytes());
                buf.extend_from_slice(&rec.local_xid.0.to_le_bytes());
                buf
            }
        }
    }

    pub(crate) fn decode(kind: u8, body: &[u8], at: Lsn) -> Result<Self> {
        let mut cursor = Cursor { buf: body, pos: 0, at };
        match kind {
            KIND_INSERT_PREPARE => {
                let dbid = DatabaseId(cursor.u32()?);
                let server = ServerId(cursor.u32()?);
                let user = UserId(cursor.u32()?);
                let umid = UserMappingId(cursor.u32()?);
                let local_xid = Xid(cursor.u32()?);
                let id_len = cursor.u16()? as usize;
                let prepare_id = cursor.bytes(id_len)?.to_vec();
                cursor.finish()?;
                Ok(WalRecord::InsertPrepare(InsertPrepareRecord {
                    dbid,
                    server,
                    user,
                    umid,
                    local_xid,
                    prepare_id,
                }))
            }
            KIND_REMOVE_PREPARE => {
                let dbid = DatabaseId(cursor.u32()?);
                let server = ServerId(cursor.u32()?);
                let user = UserId(cursor.u32()?);
                let local_xid = Xid(cursor.u32()?);
                cursor.finish()?;
                Ok(WalRecord::RemovePrepare(RemovePrepareRecord {
                    dbid,
                    server,
                    user,
                    local_xid,
                }))
            }
            other => Err(WalError::Corrupt {
                lsn: at,
                reason: format!("unknown record kind {other:#04x}"),
            }),
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    at: Lsn,
}

impl<'a> Cursor<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(WalError::Corrupt {
                lsn: self.at,
                reason: "record body truncated".into(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.bytes(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.bytes(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(WalError::Corrupt {
                lsn: self.at,
                reason: "trailing bytes in record body".into(),
            });
        }
        Ok(())
    }
}
