//! The shared registry of foreign transaction entries
//!
//! A fixed-size arena of entry slots sized by configuration, with a free
//! list and a dense index of allocated slots. Structural changes
//! (allocate, release) take the table lock exclusively, iteration takes
//! it shared, and flips of the status region use the per-entry lock so a
//! resolver can claim entries without blocking readers.

use crate::entry::{EntryData, EntryFlags, EntryIdentity, EntryIdx, ForeignXactRow, XactStatus};
use crate::error::{Result, XactError};
use crate::statefile::{self, StateFileData, STATE_DIR};
use fedtx_common::{BackendId, DatabaseId, Lsn, ServerId, UserId, Xid, XactConfig};
use fedtx_driver::{DriverError, DriverRegistry, ParticipantKey, PrepareId};
use fedtx_wal::{InsertPrepareRecord, RemovePrepareRecord, Wal, WalRecord};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Match criteria over registry entries. Absent fields match anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct XactFilter {
    pub xid: Option<Xid>,
    pub dbid: Option<DatabaseId>,
    pub server: Option<ServerId>,
    pub user: Option<UserId>,
}

impl XactFilter {
    pub fn by_xid(xid: Xid) -> Self {
        Self {
            xid: Some(xid),
            ..Default::default()
        }
    }

    pub fn by_database(dbid: DatabaseId) -> Self {
        Self {
            dbid: Some(dbid),
            ..Default::default()
        }
    }

    fn matches(&self, ident: &EntryIdentity) -> bool {
        self.xid.map_or(true, |x| x == ident.local_xid)
            && self.dbid.map_or(true, |d| d == ident.dbid)
            && self.server.map_or(true, |s| s == ident.server)
            && self.user.map_or(true, |u| u == ident.user)
    }
}

struct XactSlot {
    data: Mutex<Option<EntryData>>,
    flags: Mutex<EntryFlags>,
}

impl XactSlot {
    fn new() -> Self {
        Self {
            data: Mutex::new(None),
            flags: Mutex::new(EntryFlags::cleared()),
        }
    }
}

struct TableState {
    active: Vec<EntryIdx>,
    free: Vec<EntryIdx>,
}

pub struct XactRegistry {
    config: XactConfig,
    wal: Arc<Wal>,
    drivers: Arc<DriverRegistry>,
    state_dir: PathBuf,
    table: RwLock<TableState>,
    slots: Vec<XactSlot>,
}

impl XactRegistry {
    /// Construct the registry, creating the state-file directory if it
    /// does not exist yet.
    pub fn new(
        config: XactConfig,
        wal: Arc<Wal>,
        drivers: Arc<DriverRegistry>,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self> {
        let state_dir = data_dir.as_ref().join(STATE_DIR);
        std::fs::create_dir_all(&state_dir)?;

        let capacity = config.max_prepared_foreign_xacts;
        Ok(Self {
            config,
            wal,
            drivers,
            state_dir,
            table: RwLock::new(TableState {
                active: Vec::with_capacity(capacity),
                free: (0..capacity).rev().collect(),
            }),
            slots: (0..capacity).map(|_| XactSlot::new()).collect(),
        })
    }

    pub fn config(&self) -> &XactConfig {
        &self.config
    }

    pub fn drivers(&self) -> &Arc<DriverRegistry> {
        &self.drivers
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// Allocate a slot for a new entry. Enforces that at most one
    /// non-invalid entry exists per (database, server, user).
    fn insert(&self, ident: EntryIdentity, prepare_id: PrepareId) -> Result<EntryIdx> {
        let mut table = self.table.write();

        for &idx in &table.active {
            let flags = self.slots[idx].flags.lock();
            if flags.status == XactStatus::Invalid {
                continue;
            }
            drop(flags);
            let data = self.slots[idx].data.lock();
            if let Some(data) = data.as_ref() {
                if data.ident.dbid == ident.dbid
                    && data.ident.server == ident.server
                    && data.ident.user == ident.user
                {
                    return Err(XactError::DuplicateEntry {
                        dbid: ident.dbid,
                        server: ident.server,
                        user: ident.user,
                    });
                }
            }
        }

        let idx = table.free.pop().ok_or(XactError::PoolExhausted {
            capacity: self.config.max_prepared_foreign_xacts,
        })?;
        table.active.push(idx);

        *self.slots[idx].data.lock() = Some(EntryData {
            ident,
            prepare_id,
            insert_start_lsn: Lsn::INVALID,
            insert_end_lsn: Lsn::INVALID,
        });
        let mut flags = self.slots[idx].flags.lock();
        *flags = EntryFlags::cleared();
        flags.status = XactStatus::Preparing;

        Ok(idx)
    }

    /// Create a new entry, make it durable through the log, and leave it
    /// claimed by `backend` in `Preparing` state.
    ///
    /// Persist first, then prepare on the participant: if we crash after
    /// logging but before the participant prepared, resolving a
    /// never-prepared transaction reports it missing, which is harmless.
    /// The opposite order would leak a prepared transaction we no longer
    /// remember.
    pub fn register(
        &self,
        ident: EntryIdentity,
        prepare_id: PrepareId,
        backend: BackendId,
    ) -> Result<EntryIdx> {
        let idx = self.insert(ident, prepare_id.clone())?;
        self.slots[idx].flags.lock().held_by = Some(backend);

        let record = WalRecord::InsertPrepare(InsertPrepareRecord {
            dbid: ident.dbid,
            server: ident.server,
            user: ident.user,
            umid: ident.umid,
            local_xid: ident.local_xid,
            prepare_id: prepare_id.as_bytes().to_vec(),
        });
        let logged = self
            .wal
            .append(&record)
            .and_then(|(start, end)| self.wal.flush(end).map(|()| (start, end)));
        let (start, end) = match logged {
            Ok(pos) => pos,
            Err(err) => {
                // Log failure is fatal to the commit; give the slot back
                // so the pool is not leaked while the process dies.
                self.free_slot(idx);
                return Err(err.into());
            }
        };

        if let Some(data) = self.slots[idx].data.lock().as_mut() {
            data.insert_start_lsn = start;
            data.insert_end_lsn = end;
        }
        self.slots[idx].flags.lock().valid = true;
        Ok(idx)
    }

    fn free_slot(&self, idx: EntryIdx) {
        let mut table = self.table.write();
        if let Some(pos) = table.active.iter().position(|&i| i == idx) {
            table.active.swap_remove(pos);
            table.free.push(idx);
        }
        *self.slots[idx].data.lock() = None;
        *self.slots[idx].flags.lock() = EntryFlags::cleared();
    }

    /// Remove an entry at its terminal resolution. Writes the removal
    /// record when `log` is set (it is not during redo, where the removal
    /// is the record being replayed).
    pub(crate) fn remove_entry(&self, idx: EntryIdx, log: bool) -> Result<()> {
        let Some(data) = self.slots[idx].data.lock().clone() else {
            return Ok(());
        };
        let ondisk = self.slots[idx].flags.lock().ondisk;

        if log {
            let (_, end) = self.wal.append(&WalRecord::RemovePrepare(RemovePrepareRecord {
                dbid: data.ident.dbid,
                server: data.ident.server,
                user: data.ident.user,
                local_xid: data.ident.local_xid,
            }))?;
            self.wal.flush(end)?;
        }

        self.free_slot(idx);

        if ondisk {
            statefile::remove(
                &self.state_dir,
                data.ident.local_xid,
                data.ident.server,
                data.ident.user,
                true,
            );
        }
        Ok(())
    }

    pub fn status(&self, idx: EntryIdx) -> XactStatus {
        self.slots[idx].flags.lock().status
    }

    pub fn set_status(&self, idx: EntryIdx, status: XactStatus) {
        self.slots[idx].flags.lock().status = status;
    }

    pub fn is_indoubt(&self, idx: EntryIdx) -> bool {
        self.slots[idx].flags.lock().indoubt
    }

    /// Identity of an entry, if the slot is allocated.
    pub fn identity(&self, idx: EntryIdx) -> Option<EntryIdentity> {
        self.slots[idx].data.lock().as_ref().map(|d| d.ident)
    }

    /// Release a backend claim. When the entry has not reached `Prepared`
    /// (so no later command will pick it up), it is flagged in-doubt for
    /// the resolver.
    pub fn release_claim(&self, idx: EntryIdx) {
        let mut flags = self.slots[idx].flags.lock();
        flags.held_by = None;
        if flags.status != XactStatus::Prepared && flags.status != XactStatus::Invalid {
            flags.indoubt = true;
        }
    }

    /// Release a claim on an entry that stays `Prepared` for a later
    /// commit/rollback of the surrounding prepared transaction.
    pub fn release_claim_keep_prepared(&self, idx: EntryIdx) {
        let mut flags = self.slots[idx].flags.lock();
        debug_assert_eq!(flags.status, XactStatus::Prepared);
        flags.held_by = None;
    }

    /// True if any entry matches the filter.
    pub fn exists(&self, filter: &XactFilter) -> bool {
        let table = self.table.read();
        table.active.iter().any(|&idx| {
            self.slots[idx].flags.lock().status != XactStatus::Invalid
                && self.slots[idx]
                    .data
                    .lock()
                    .as_ref()
                    .is_some_and(|d| filter.matches(&d.ident))
        })
    }

    /// Claim all unheld matching entries for `backend`. Entries held by
    /// another backend or being processed by a resolver are skipped; they
    /// will be resolved by whoever holds them.
    pub fn claim_matching(&self, filter: &XactFilter, backend: BackendId) -> Vec<EntryIdx> {
        let table = self.table.write();
        let mut claimed = Vec::new();
        for &idx in &table.active {
            let matches = self.slots[idx]
                .data
                .lock()
                .as_ref()
                .is_some_and(|d| filter.matches(&d.ident));
            if !matches {
                continue;
            }
            let mut flags = self.slots[idx].flags.lock();
            if flags.status == XactStatus::Invalid
                || flags.inprocessing
                || flags.held_by.is_some_and(|b| b != backend)
            {
                continue;
            }
            flags.held_by = Some(backend);
            claimed.push(idx);
        }
        claimed
    }

    /// Remove matching unclaimed entries without resolving them on the
    /// participant. Escape hatch for entries whose server or user no
    /// longer exists; returns how many entries were forgotten.
    pub fn forget_matching(&self, filter: &XactFilter) -> Result<usize> {
        let pinned = {
            let table = self.table.write();
            let mut pinned = Vec::new();
            for &idx in &table.active {
                let matches = self.slots[idx]
                    .data
                    .lock()
                    .as_ref()
                    .is_some_and(|d| filter.matches(&d.ident));
                if !matches {
                    continue;
                }
                let mut flags = self.slots[idx].flags.lock();
                if flags.status == XactStatus::Invalid
                    || flags.inprocessing
                    || flags.held_by.is_some()
                {
                    continue;
                }
                flags.inprocessing = true;
                pinned.push(idx);
            }
            pinned
        };

        for &idx in &pinned {
            self.remove_entry(idx, true)?;
        }
        Ok(pinned.len())
    }

    /// Mark entries of the waiter's transaction as claimed for one
    /// resolver attempt.
    pub fn claim_for_processing(&self, dbid: DatabaseId, xid: Xid) -> Vec<EntryIdx> {
        let table = self.table.write();
        let mut held = Vec::new();
        for &idx in &table.active {
            let matches = self.slots[idx].data.lock().as_ref().is_some_and(|d| {
                d.ident.dbid == dbid && d.ident.local_xid == xid
            });
            if !matches {
                continue;
            }
            let mut flags = self.slots[idx].flags.lock();
            if flags.status == XactStatus::Invalid || !flags.valid || flags.inprocessing {
                continue;
            }
            flags.inprocessing = true;
            held.push(idx);
        }
        held
    }

    /// Claim every unowned in-doubt entry of a database for resolution.
    pub fn claim_indoubt(&self, dbid: DatabaseId) -> Vec<EntryIdx> {
        let table = self.table.write();
        let mut held = Vec::new();
        for &idx in &table.active {
            let matches = self.slots[idx]
                .data
                .lock()
                .as_ref()
                .is_some_and(|d| d.ident.dbid == dbid);
            if !matches {
                continue;
            }
            let mut flags = self.slots[idx].flags.lock();
            if !flags.valid || !flags.indoubt || flags.inprocessing || flags.held_by.is_some() {
                continue;
            }
            flags.inprocessing = true;
            held.push(idx);
        }
        held
    }

    /// Clear the resolver claim after a failed attempt.
    pub fn clear_processing(&self, idx: EntryIdx) {
        self.slots[idx].flags.lock().inprocessing = false;
    }

    /// Databases holding at least one entry the launcher should cover:
    /// valid and not in-doubt (in-doubt entries are picked up by whatever
    /// resolver runs on that database anyway).
    pub fn databases_needing_resolution(&self) -> Vec<DatabaseId> {
        let table = self.table.read();
        let mut dbs = Vec::new();
        for &idx in &table.active {
            let flags = self.slots[idx].flags.lock();
            if !flags.valid || flags.indoubt {
                continue;
            }
            drop(flags);
            if let Some(data) = self.slots[idx].data.lock().as_ref() {
                if !dbs.contains(&data.ident.dbid) {
                    dbs.push(data.ident.dbid);
                }
            }
        }
        dbs
    }

    /// Finalize one claimed entry through its driver. Returns true when
    /// the entry was resolved and removed; false on a transient driver
    /// failure, leaving the entry for a retry. The removal record is only
    /// written once the driver reported success or a missing prepared
    /// transaction.
    pub async fn resolve_entry(&self, idx: EntryIdx) -> Result<bool> {
        let Some(data) = self.slots[idx].data.lock().clone() else {
            return Ok(true);
        };
        let commit = self.slots[idx].flags.lock().status.resolve_as_commit();

        let key = ParticipantKey {
            server: data.ident.server,
            user: data.ident.user,
            umid: data.ident.umid,
        };
        let driver = self.drivers.driver_for(data.ident.server)?;
        match driver
            .resolve(data.ident.local_xid, &key, &data.prepare_id, commit)
            .await
        {
            Ok(_) => {
                self.remove_entry(idx, true)?;
                Ok(true)
            }
            Err(DriverError::Transient(reason)) => {
                tracing::warn!(
                    "could not resolve foreign transaction {} on server {}: {reason}",
                    data.ident.local_xid,
                    data.ident.server
                );
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Copy entries that are behind the redo horizon from the log into
    /// state files, making their log segment recyclable.
    pub fn checkpoint(&self, redo_horizon: Lsn) -> Result<usize> {
        if self.config.max_prepared_foreign_xacts == 0 {
            return Ok(0);
        }

        let table = self.table.read();
        let mut serialized = 0;
        for &idx in &table.active {
            let flags = self.slots[idx].flags.lock().clone();
            if !(flags.valid || flags.inredo) || flags.ondisk {
                continue;
            }
            let Some(data) = self.slots[idx].data.lock().clone() else {
                continue;
            };
            if !data.insert_start_lsn.is_valid() || data.insert_end_lsn > redo_horizon {
                continue;
            }

            let record = self.wal.read_at(data.insert_start_lsn)?;
            let WalRecord::InsertPrepare(insert) = record else {
                return Err(XactError::Wal(fedtx_wal::WalError::Corrupt {
                    lsn: data.insert_start_lsn,
                    reason: "expected an insert record for a registered entry".into(),
                }));
            };
            statefile::recreate(
                &self.state_dir,
                &StateFileData {
                    ident: data.ident,
                    status: flags.status,
                    prepare_id: insert.prepare_id,
                },
            )?;
            self.slots[idx].flags.lock().ondisk = true;
            serialized += 1;
        }

        if serialized > 0 {
            tracing::info!(
                "{serialized} foreign transaction state file(s) written for long-running prepared transactions"
            );
        }
        Ok(serialized)
    }

    fn find(&self, xid: Xid, server: ServerId, user: UserId) -> Option<EntryIdx> {
        let table = self.table.read();
        table.active.iter().copied().find(|&idx| {
            self.slots[idx].data.lock().as_ref().is_some_and(|d| {
                d.ident.local_xid == xid && d.ident.server == server && d.ident.user == user
            })
        })
    }

    /// Reconstruct entries from the state-file directory during startup.
    /// Files that fail their checksum or whose name disagrees with their
    /// header are removed with a warning.
    pub fn restore_from_files(&self) -> Result<()> {
        for dirent in std::fs::read_dir(&self.state_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some((xid, server, user)) = name.to_str().and_then(statefile::parse_file_name)
            else {
                continue;
            };

            let data = match statefile::read(&self.state_dir, xid, server, user) {
                Ok(data) => data,
                Err(XactError::StateFileCorrupt { path }) => {
                    tracing::warn!("removing corrupt foreign transaction state file {path:?}");
                    statefile::remove(&self.state_dir, xid, server, user, false);
                    continue;
                }
                Err(err) => return Err(err),
            };

            tracing::info!(
                "recovering foreign transaction entry for xid {xid}, server {server}, user {user}"
            );
            let idx = self.insert(data.ident, PrepareId::new(data.prepare_id)?)?;
            let mut flags = self.slots[idx].flags.lock();
            flags.status = XactStatus::Prepared;
            flags.valid = true;
            flags.ondisk = true;
            flags.inredo = true;
            flags.held_by = None;
        }
        Ok(())
    }

    /// Apply one replayed log record.
    pub fn redo(&self, start: Lsn, end: Lsn, record: &WalRecord) -> Result<()> {
        match record {
            WalRecord::InsertPrepare(rec) => {
                if let Some(idx) = self.find(rec.local_xid, rec.server, rec.user) {
                    // Already restored from its state file; pick up the
                    // log positions and confirm validity.
                    if let Some(data) = self.slots[idx].data.lock().as_mut() {
                        data.insert_start_lsn = start;
                        data.insert_end_lsn = end;
                    }
                    let mut flags = self.slots[idx].flags.lock();
                    flags.valid = true;
                    flags.inredo = true;
                } else {
                    let ident = EntryIdentity {
                        dbid: rec.dbid,
                        local_xid: rec.local_xid,
                        server: rec.server,
                        user: rec.user,
                        umid: rec.umid,
                    };
                    let idx = self.insert(ident, PrepareId::new(rec.prepare_id.clone())?)?;
                    if let Some(data) = self.slots[idx].data.lock().as_mut() {
                        data.insert_start_lsn = start;
                        data.insert_end_lsn = end;
                    }
                    let mut flags = self.slots[idx].flags.lock();
                    flags.status = XactStatus::Prepared;
                    flags.valid = true;
                    flags.inredo = true;
                }
            }
            WalRecord::RemovePrepare(rec) => {
                if let Some(idx) = self.find(rec.local_xid, rec.server, rec.user) {
                    self.remove_entry(idx, false)?;
                } else {
                    // Entry never made it back into memory; the file may
                    // still exist from an earlier checkpoint.
                    statefile::remove(&self.state_dir, rec.local_xid, rec.server, rec.user, false);
                }
            }
        }
        Ok(())
    }

    /// Replay the log from `from`, applying every record.
    pub fn replay_wal(&self, from: Lsn) -> Result<()> {
        for (start, end, record) in self.wal.replay(from)? {
            self.redo(start, end, &record)?;
        }
        Ok(())
    }

    /// Scan the state-file directory for the oldest transaction id that
    /// must stay live. Files from a future timeline (at or past
    /// `next_xid`) cannot be resolved anymore and are deleted.
    pub fn prescan(&self, oldest_active: Xid, next_xid: Xid) -> Result<Xid> {
        let mut oldest = oldest_active;
        for dirent in std::fs::read_dir(&self.state_dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some((xid, server, user)) = name.to_str().and_then(statefile::parse_file_name)
            else {
                continue;
            };

            if xid >= next_xid {
                tracing::warn!(
                    "removing future foreign prepared transaction file {:?}",
                    dirent.file_name()
                );
                statefile::remove(&self.state_dir, xid, server, user, true);
                continue;
            }
            if xid <= oldest {
                oldest = xid;
            }
        }
        Ok(oldest)
    }

    /// After the consistency point: every surviving entry whose local
    /// transaction is not among the still-undecided ones has lost its
    /// owner for good and becomes in-doubt. Returns how many entries were
    /// flagged.
    pub fn mark_orphaned(&self, undecided_xids: &HashSet<Xid>) -> usize {
        let table = self.table.read();
        let mut flagged = 0;
        for &idx in &table.active {
            let xid = match self.slots[idx].data.lock().as_ref() {
                Some(data) => data.ident.local_xid,
                None => continue,
            };
            let mut flags = self.slots[idx].flags.lock();
            if flags.valid
                && flags.held_by.is_none()
                && !flags.indoubt
                && !undecided_xids.contains(&xid)
            {
                flags.indoubt = true;
                flagged += 1;
            }
        }
        flagged
    }

    /// One row per valid entry, for the observability surface.
    pub fn rows(&self) -> Vec<ForeignXactRow> {
        let table = self.table.read();
        let mut rows = Vec::new();
        for &idx in &table.active {
            let flags = self.slots[idx].flags.lock().clone();
            if !flags.valid {
                continue;
            }
            if let Some(data) = self.slots[idx].data.lock().as_ref() {
                rows.push(ForeignXactRow {
                    local_xid: data.ident.local_xid,
                    dbid: data.ident.dbid,
                    server: data.ident.server,
                    user: data.ident.user,
                    status: flags.status,
                    indoubt: flags.indoubt,
                    ondisk: flags.ondisk,
                });
            }
        }
        rows
    }

    /// Number of allocated entries.
    pub fn len(&self) -> usize {
        self.table.read().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().active.is_empty()
    }
}
