//! The append-only log file

use crate::error::{Result, WalError};
use crate::record::WalRecord;
use fedtx_common::Lsn;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"FEDTXWAL";
const FRAME_HEADER_LEN: u64 = 9; // kind u8 + body len u32 + crc32c u32

/// Write-ahead log handle, shareable across tasks.
///
/// Positions are byte offsets into the file, which makes the reserved
/// 8-byte magic prefix double as the guard that keeps offset zero equal
/// to the invalid position.
pub struct Wal {
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: File,
    path: PathBuf,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
}

impl Wal {
    /// Open or create the log at `path`, scanning any existing content to
    /// find the end of the last complete record. A torn tail is discarded.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(MAGIC)?;
            file.sync_data()?;
        } else {
            let mut magic = [0u8; 8];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(WalError::BadMagic);
            }
        }

        let end = scan_valid_end(&mut file)?;
        if end.0 < len && len > MAGIC.len() as u64 {
            tracing::warn!(
                "discarding {} bytes of torn log tail in {:?}",
                len - end.0,
                path
            );
            file.set_len(end.0)?;
            file.sync_data()?;
        }

        Ok(Self {
            inner: Mutex::new(WalInner {
                file,
                path,
                next_lsn: end,
                flushed_lsn: end,
            }),
        })
    }

    /// Append one record; returns its (start, end) positions. The record
    /// is not durable until `flush` has been called with an LSN at or past
    /// the returned end.
    pub fn append(&self, record: &WalRecord) -> Result<(Lsn, Lsn)> {
        let mut inner = self.inner.lock();
        let body = record.encode_body();
        let crc = crc32c::crc32c(&body);

        let start = inner.next_lsn;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + body.len());
        frame.push(record.kind());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        frame.extend_from_slice(&body);

        inner.file.seek(SeekFrom::Start(start.0))?;
        inner.file.write_all(&frame)?;
        let end = start.advance(frame.len() as u64);
        inner.next_lsn = end;
        Ok((start, end))
    }

    /// Make everything up to `upto` durable.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.flushed_lsn < upto {
            inner.file.sync_data()?;
            inner.flushed_lsn = inner.next_lsn;
        }
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.inner.lock().flushed_lsn
    }

    /// Position the next append will start at.
    pub fn current_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Read back the single record whose frame starts at `lsn`.
    pub fn read_at(&self, lsn: Lsn) -> Result<WalRecord> {
        let mut inner = self.inner.lock();
        if lsn.0 < MAGIC.len() as u64 || lsn >= inner.next_lsn {
            return Err(WalError::NoRecord(lsn));
        }
        let (record, _end) = read_frame(&mut inner.file, lsn)?;
        Ok(record)
    }

    /// All complete records from `from` (or the start of the log) onward,
    /// in append order, with their frame positions.
    pub fn replay(&self, from: Lsn) -> Result<Vec<(Lsn, Lsn, WalRecord)>> {
        let mut inner = self.inner.lock();
        let end = inner.next_lsn;
        let mut at = from.max(Lsn(MAGIC.len() as u64));
        let mut records = Vec::new();
        while at < end {
            let (record, next) = read_frame(&mut inner.file, at)?;
            records.push((at, next, record));
            at = next;
        }
        Ok(records)
    }
}

fn read_frame(file: &mut File, at: Lsn) -> Result<(WalRecord, Lsn)> {
    file.seek(SeekFrom::Start(at.0))?;
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    file.read_exact(&mut header)?;
    let kind = header[0];
    let body_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let expect_crc = u32::from_le_bytes([header[5], header[6], header[7], header[8]]);

    let mut body = vec![0u8; body_len];
    file.read_exact(&mut body)?;
    if crc32c::crc32c(&body) != expect_crc {
        return Err(WalError::Corrupt {
            lsn: at,
            reason: "checksum mismatch".into(),
        });
    }
    let record = WalRecord::decode(kind, &body, at)?;
    Ok((record, at.advance(FRAME_HEADER_LEN + body_len as u64)))
}

/// Walk the file from the magic onward and return the end of the last
/// complete, checksummed record.
fn scan_valid_end(file: &mut File) -> Result<Lsn> {
    let len = file.metadata()?.len();
    let mut at = Lsn(MAGIC.len() as u64);
    loop {
        if at.0 + FRAME_HEADER_LEN > len {
            return Ok(at);
        }
        match read_frame(file, at) {
            Ok((_, next)) if next.0 <= len => at = next,
            _ => return Ok(at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{InsertPrepareRecord, RemovePrepareRecord};
    use fedtx_common::{DatabaseId, ServerId, UserId, UserMappingId, Xid};

    fn insert(xid: u32) -> WalRecord {
        WalRecord::InsertPrepare(InsertPrepareRecord {
            dbid: DatabaseId(1),
            server: ServerId(2),
            user: UserId(3),
            umid: UserMappingId(4),
            local_xid: Xid(xid),
            prepare_id: format!("px-{xid}-2-3").into_bytes(),
        })
    }

    fn remove(xid: u32) -> WalRecord {
        WalRecord::RemovePrepare(RemovePrepareRecord {
            dbid: DatabaseId(1),
            server: ServerId(2),
            user: UserId(3),
            local_xid: Xid(xid),
        })
    }

    #[test]
    fn append_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal")).unwrap();

        let (start, end) = wal.append(&insert(9)).unwrap();
        assert!(start.is_valid());
        assert!(start < end);
        wal.flush(end).unwrap();

        assert_eq!(wal.read_at(start).unwrap(), insert(9));
        assert_eq!(wal.flushed_lsn(), end);
    }

    #[test]
    fn replay_returns_records_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal")).unwrap();
        wal.append(&insert(1)).unwrap();
        wal.append(&remove(1)).unwrap();
        let (_, end) = wal.append(&insert(2)).unwrap();
        wal.flush(end).unwrap();

        let records: Vec<_> = wal
            .replay(Lsn::INVALID)
            .unwrap()
            .into_iter()
            .map(|(_, _, r)| r)
            .collect();
        assert_eq!(records, vec![insert(1), remove(1), insert(2)]);
    }

    #[test]
    fn replay_can_start_mid_log() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal")).unwrap();
        let (_, first_end) = wal.append(&insert(1)).unwrap();
        wal.append(&insert(2)).unwrap();

        let records = wal.replay(first_end).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].2, insert(2));
    }

    #[test]
    fn reopen_resumes_after_last_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal");
        let end = {
            let wal = Wal::open(&path).unwrap();
            let (_, end) = wal.append(&insert(1)).unwrap();
            wal.flush(end).unwrap();
            end
        };

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.current_lsn(), end);
        assert_eq!(wal.replay(Lsn::INVALID).unwrap().len(), 1);
    }

    #[test]
    fn torn_tail_is_discarded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal");
        let good_end = {
            let wal = Wal::open(&path).unwrap();
            let (_, end) = wal.append(&insert(1)).unwrap();
            wal.flush(end).unwrap();
            end
        };

        // Simulate a crash mid-append.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0x00, 0xff, 0xff]).unwrap();
        }

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.current_lsn(), good_end);
        assert_eq!(wal.replay(Lsn::INVALID).unwrap().len(), 1);
    }

    #[test]
    fn read_at_rejects_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal")).unwrap();
        assert!(matches!(
            wal.read_at(Lsn(999)),
            Err(WalError::NoRecord(_))
        ));
    }
}
