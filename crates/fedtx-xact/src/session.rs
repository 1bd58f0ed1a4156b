//! Per-backend commit orchestration
//!
//! Each backend keeps a session-scoped list of the foreign servers its
//! current transaction touched. The commit runs in two phases: pre-commit
//! prepares the participants that need and support it, and end of
//! transaction finalizes everything according to the local outcome.
//! Between registering an entry and hearing back from the participant the
//! backend may still abort; the abort path then resolves the prepared
//! transaction or, when the participant never prepared, finds it missing,
//! which is treated as success.

use crate::entry::{EntryIdentity, EntryIdx, XactStatus};
use crate::error::{Result, XactError};
use crate::registry::{XactFilter, XactRegistry};
use fedtx_common::{BackendId, DatabaseId, TwophaseCommitLevel, Xid};
use fedtx_driver::{ParticipantDriver, ParticipantKey};
use std::sync::Arc;

struct Participant {
    key: ParticipantKey,
    modified: bool,
    two_phase: bool,
    driver: Arc<dyn ParticipantDriver>,
    entry: Option<EntryIdx>,
}

/// Transaction-scoped participant tracking for one backend.
pub struct XactSession {
    registry: Arc<XactRegistry>,
    backend: BackendId,
    dbid: DatabaseId,
    participants: Vec<Participant>,
}

impl XactSession {
    pub fn new(registry: Arc<XactRegistry>, backend: BackendId, dbid: DatabaseId) -> Self {
        Self {
            registry,
            backend,
            dbid,
            participants: Vec::new(),
        }
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Record that the current statement touched a foreign server.
    /// Called repeatedly; later calls only widen the modification flag.
    pub fn register_participant(&mut self, key: ParticipantKey, modified: bool) -> Result<()> {
        if let Some(existing) = self
            .participants
            .iter_mut()
            .find(|p| p.key.server == key.server && p.key.user == key.user)
        {
            existing.modified |= modified;
            return Ok(());
        }

        let driver = self.registry.drivers().driver_for(key.server)?;
        let two_phase = driver.supports_two_phase();
        self.participants.push(Participant {
            key,
            modified,
            two_phase,
            driver,
            entry: None,
        });
        Ok(())
    }

    pub fn has_participants(&self) -> bool {
        !self.participants.is_empty()
    }

    /// Pre-commit processing: decide whether atomic commit across the
    /// participants requires two-phase commit, and if so prepare them.
    ///
    /// On error the local commit must fail; the caller is expected to run
    /// `at_eoxact(xid, false)` afterwards, which rolls back unprepared
    /// participants one-phase and aborts any already-prepared ones.
    pub async fn pre_commit(&mut self, xid: Xid, local_modified: bool) -> Result<()> {
        if self.participants.is_empty() {
            return Ok(());
        }

        let modifying: Vec<usize> = (0..self.participants.len())
            .filter(|&i| self.participants[i].modified)
            .collect();
        let need_two_phase =
            modifying.len() >= 2 || (local_modified && !modifying.is_empty());
        if !need_two_phase {
            return Ok(());
        }

        match self.registry.config().foreign_twophase_commit {
            TwophaseCommitLevel::Disabled => Err(XactError::TwophaseNotAllowed),
            TwophaseCommitLevel::Required => {
                if let Some(&i) = modifying.iter().find(|&&i| !self.participants[i].two_phase) {
                    return Err(XactError::TwophaseUnsupported {
                        server: self.participants[i].key.server,
                    });
                }
                self.prepare_list(xid, &modifying).await
            }
            TwophaseCommitLevel::Prefer => {
                let capable: Vec<usize> = modifying
                    .into_iter()
                    .filter(|&i| self.participants[i].two_phase)
                    .collect();
                self.prepare_list(xid, &capable).await
            }
        }
    }

    /// Prepare the given participants, registering a durable entry for
    /// each before its driver is asked to prepare.
    async fn prepare_list(&mut self, xid: Xid, indices: &[usize]) -> Result<()> {
        if self.registry.config().max_prepared_foreign_xacts == 0 && !indices.is_empty() {
            return Err(XactError::PoolExhausted { capacity: 0 });
        }

        for &i in indices {
            let (key, driver) = {
                let p = &self.participants[i];
                (p.key, p.driver.clone())
            };
            let prepare_id = driver.make_prepare_id(xid, &key)?;
            let ident = EntryIdentity {
                dbid: self.dbid,
                local_xid: xid,
                server: key.server,
                user: key.user,
                umid: key.umid,
            };
            let idx = self
                .registry
                .register(ident, prepare_id.clone(), self.backend)?;

            match driver.prepare(xid, &key, &prepare_id).await {
                Ok(()) => {
                    self.registry.set_status(idx, XactStatus::Prepared);
                    self.participants[i].entry = Some(idx);
                }
                Err(err) => {
                    // Never prepared on the participant, so the durable
                    // entry has nothing to resolve; drop it and fail the
                    // local commit.
                    self.registry.remove_entry(idx, true)?;
                    return Err(XactError::PrepareFailed {
                        server: key.server,
                        source: err,
                    });
                }
            }
        }
        Ok(())
    }

    /// End-of-transaction processing. Prepared participants are resolved
    /// according to the local outcome; everything else is finished in one
    /// phase. Failures past this point are warnings: the local outcome is
    /// already durable, and unresolved entries fall to the resolver.
    pub async fn at_eoxact(&mut self, xid: Xid, is_commit: bool) {
        for p in &mut self.participants {
            if let Some(idx) = p.entry.take() {
                self.registry.set_status(
                    idx,
                    if is_commit {
                        XactStatus::Committing
                    } else {
                        XactStatus::Aborting
                    },
                );
                match self.registry.resolve_entry(idx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Transient driver failure, already logged; hand
                        // the entry to the resolver subsystem.
                        self.registry.release_claim(idx);
                    }
                    Err(err) => {
                        tracing::warn!(
                            "could not resolve foreign transaction {xid} on server {}: {err}",
                            p.key.server
                        );
                        self.registry.release_claim(idx);
                    }
                }
            } else {
                let outcome = if is_commit {
                    p.driver.commit(xid, &p.key).await
                } else {
                    p.driver.rollback(xid, &p.key).await
                };
                if let Err(err) = outcome {
                    tracing::warn!(
                        "could not {} transaction on server {}: {err}",
                        if is_commit { "commit" } else { "abort" },
                        p.key.server
                    );
                }
            }
        }
        self.participants.clear();
    }

    /// The PREPARE TRANSACTION path: every participant must be able to
    /// prepare; successfully prepared entries are left unowned in
    /// `Prepared` state so a later finish (possibly from another backend,
    /// possibly after a crash) can resolve them.
    pub async fn prepare_transaction(&mut self, xid: Xid) -> Result<()> {
        if self.participants.is_empty() {
            return Ok(());
        }
        if let Some(p) = self.participants.iter().find(|p| !p.two_phase) {
            return Err(XactError::TwophaseUnsupported {
                server: p.key.server,
            });
        }

        let all: Vec<usize> = (0..self.participants.len()).collect();
        self.prepare_list(xid, &all).await?;

        for p in &mut self.participants {
            if let Some(idx) = p.entry.take() {
                self.registry.release_claim_keep_prepared(idx);
            }
        }
        self.participants.clear();
        Ok(())
    }

    /// Process-exit cleanup: release every claim this session still
    /// holds. Entries that never reached `Prepared` become in-doubt.
    pub fn cleanup_at_exit(&mut self) {
        for p in self.participants.drain(..) {
            if let Some(idx) = p.entry {
                self.registry.release_claim(idx);
            }
        }
    }
}

/// Commit or roll back the foreign transactions prepared as part of a
/// local prepared transaction. Entries claimed by somebody else are left
/// alone; a resolver finishes them later. Returns how many entries were
/// resolved.
pub async fn finish_prepared(
    registry: &XactRegistry,
    backend: BackendId,
    xid: Xid,
    commit: bool,
) -> Result<usize> {
    let claimed = registry.claim_matching(&XactFilter::by_xid(xid), backend);
    let mut resolved = 0;

    for idx in claimed {
        registry.set_status(
            idx,
            if commit {
                XactStatus::Committing
            } else {
                XactStatus::Aborting
            },
        );
        match registry.resolve_entry(idx).await {
            Ok(true) => resolved += 1,
            Ok(false) => registry.release_claim(idx),
            Err(err) => {
                tracing::warn!("could not resolve prepared foreign transaction {xid}: {err}");
                registry.release_claim(idx);
            }
        }
    }
    Ok(resolved)
}
