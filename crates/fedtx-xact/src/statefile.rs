//! Per-entry state files
//!
//! At checkpoint, entries whose insertion record has fallen behind the
//! redo horizon are copied from the log into one file each, so the log
//! segment can be recycled. File name is the entry identity in hex:
//! `<xid>-<serverid>-<userid>`, eight digits apiece. The content is a
//! fixed header, the prepared-transaction identifier, the owning database
//! id, and a CRC32C over everything before it.

use crate::entry::{EntryIdentity, XactStatus};
use crate::error::{Result, XactError};
use fedtx_common::{DatabaseId, ServerId, UserId, UserMappingId, Xid};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directory under the data directory holding the state files.
pub const STATE_DIR: &str = "pg_fdwxact";

const MAGIC: u32 = 0x4644_5458;
const VERSION: u16 = 1;
// magic, version, status, local_xid, serverid, userid, umid, id_len
const HEADER_LEN: usize = 4 + 2 + 2 + 4 + 4 + 4 + 4 + 2;

/// Decoded content of one state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StateFileData {
    pub ident: EntryIdentity,
    pub status: XactStatus,
    pub prepare_id: Vec<u8>,
}

pub(crate) fn file_name(xid: Xid, server: ServerId, user: UserId) -> String {
    format!("{:08x}-{:08x}-{:08x}", xid.0, server.0, user.0)
}

pub(crate) fn file_path(dir: &Path, xid: Xid, server: ServerId, user: UserId) -> PathBuf {
    dir.join(file_name(xid, server, user))
}

/// Parse a directory entry name back into an entry identity, rejecting
/// anything that is not exactly three dash-separated 8-digit hex fields.
pub(crate) fn parse_file_name(name: &str) -> Option<(Xid, ServerId, UserId)> {
    if name.len() != 26 {
        return None;
    }
    let mut parts = name.split('-');
    let xid = u32::from_str_radix(parts.next()?, 16).ok()?;
    let server = u32::from_str_radix(parts.next()?, 16).ok()?;
    let user = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((Xid(xid), ServerId(server), UserId(user)))
}

fn encode(data: &StateFileData) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + data.prepare_id.len() + 8);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.extend_from_slice(&VERSION.to_le_bytes());
    buf.extend_from_slice(&data.status.to_u16().to_le_bytes());
    buf.extend_from_slice(&data.ident.local_xid.0.to_le_bytes());
    buf.extend_from_slice(&data.ident.server.0.to_le_bytes());
    buf.extend_from_slice(&data.ident.user.0.to_le_bytes());
    buf.extend_from_slice(&data.ident.umid.0.to_le_bytes());
    buf.extend_from_slice(&(data.prepare_id.len() as u16).to_le_bytes());
    buf.extend_from_slice(&data.prepare_id);
    buf.extend_from_slice(&data.ident.dbid.0.to_le_bytes());
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

fn decode(path: &Path, raw: &[u8]) -> Result<StateFileData> {
    let corrupt = || XactError::StateFileCorrupt {
        path: path.to_path_buf(),
    };

    // Minimum size: header + dbid + crc, with an empty identifier.
    if raw.len() < HEADER_LEN + 8 {
        return Err(corrupt());
    }
    let crc_offset = raw.len() - 4;
    let stored_crc = u32::from_le_bytes(raw[crc_offset..].try_into().unwrap());
    if crc32c::crc32c(&raw[..crc_offset]) != stored_crc {
        return Err(corrupt());
    }

    let u32_at = |off: usize| u32::from_le_bytes(raw[off..off + 4].try_into().unwrap());
    let u16_at = |off: usize| u16::from_le_bytes(raw[off..off + 2].try_into().unwrap());

    if u32_at(0) != MAGIC || u16_at(4) != VERSION {
        return Err(corrupt());
    }
    let status = XactStatus::from_u16(u16_at(6)).ok_or_else(corrupt)?;
    let id_len = u16_at(24) as usize;
    if HEADER_LEN + id_len + 4 != crc_offset {
        return Err(corrupt());
    }

    Ok(StateFileData {
        status,
        ident: EntryIdentity {
            local_xid: Xid(u32_at(8)),
            server: ServerId(u32_at(12)),
            user: UserId(u32_at(16)),
            umid: UserMappingId(u32_at(20)),
            dbid: DatabaseId(u32_at(HEADER_LEN + id_len)),
        },
        prepare_id: raw[HEADER_LEN..HEADER_LEN + id_len].to_vec(),
    })
}

/// Recreate a state file, fsyncing before returning since the
/// end-of-recovery checkpoint will not do it for us.
pub(crate) fn recreate(dir: &Path, data: &StateFileData) -> Result<()> {
    let path = file_path(dir, data.ident.local_xid, data.ident.server, data.ident.user);
    let mut file = File::create(&path)?;
    file.write_all(&encode(data))?;
    file.sync_data()?;
    Ok(())
}

/// Read and validate one state file. The name must agree with the header.
pub(crate) fn read(dir: &Path, xid: Xid, server: ServerId, user: UserId) -> Result<StateFileData> {
    let path = file_path(dir, xid, server, user);
    let raw = fs::read(&path)?;
    let data = decode(&path, &raw)?;
    if data.ident.local_xid != xid || data.ident.server != server || data.ident.user != user {
        return Err(XactError::StateFileCorrupt { path });
    }
    Ok(data)
}

/// Unlink the state file for an entry.
///
/// A missing file is only worth a warning when the caller expected it to
/// exist; during log replay it is routine.
pub(crate) fn remove(dir: &Path, xid: Xid, server: ServerId, user: UserId, warn_if_missing: bool) {
    let path = file_path(dir, xid, server, user);
    if let Err(err) = fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound || warn_if_missing {
            tracing::warn!("could not remove foreign transaction state file {path:?}: {err}");
        }
    }
}
