//! Durability and crash-recovery behavior of the registry.

mod common;

use common::{key, setup, BACKEND, DB};
use fedtx_common::{Lsn, ServerId, TwophaseCommitLevel, UserId, Xid};
use fedtx_xact::{XactFilter, XactSession, XactStatus, STATE_DIR};
use std::collections::HashSet;
use std::path::PathBuf;

fn state_file_path(harness: &common::Harness, xid: Xid, server: u32) -> PathBuf {
    harness.data_dir.join(STATE_DIR).join(format!(
        "{:08x}-{:08x}-{:08x}",
        xid.0,
        server,
        key(server).user.0
    ))
}

async fn prepare_two(harness: &common::Harness, xid: Xid) {
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();
    session.pre_commit(xid, true).await.unwrap();
    // The session is dropped mid-commit: the crash happens after the
    // insertion records are flushed but before any participant resolves.
}

#[tokio::test]
async fn resolved_transaction_leaves_nothing_behind_after_recovery() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(200);

    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();
    session.pre_commit(xid, true).await.unwrap();
    session.at_eoxact(xid, true).await;

    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(Lsn::INVALID).unwrap();

    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn replaying_inserts_reconstructs_prepared_entries() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(201);
    prepare_two(&harness, xid).await;

    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(Lsn::INVALID).unwrap();

    let rows = harness.registry.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == XactStatus::Prepared));
    assert!(rows.iter().all(|r| !r.indoubt));

    // The local transaction is not among the undecided ones, so both
    // entries lose their owner for good.
    assert_eq!(harness.registry.mark_orphaned(&HashSet::new()), 2);
    assert!(harness.registry.rows().iter().all(|r| r.indoubt));
}

#[tokio::test]
async fn undecided_local_transactions_are_not_orphaned() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(202);
    prepare_two(&harness, xid).await;

    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(Lsn::INVALID).unwrap();

    let undecided: HashSet<Xid> = [xid].into_iter().collect();
    assert_eq!(harness.registry.mark_orphaned(&undecided), 0);
    assert!(harness.registry.rows().iter().all(|r| !r.indoubt));
}

#[tokio::test]
async fn checkpoint_spills_entries_to_state_files() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(203);
    prepare_two(&harness, xid).await;

    let horizon = harness.registry.wal().current_lsn();
    assert_eq!(harness.registry.checkpoint(horizon).unwrap(), 2);
    assert!(state_file_path(&harness, xid, 1).exists());
    assert!(state_file_path(&harness, xid, 2).exists());
    assert!(harness.registry.rows().iter().all(|r| r.ondisk));

    // A second checkpoint has nothing left to spill.
    assert_eq!(harness.registry.checkpoint(horizon).unwrap(), 0);

    // Recovery from the files alone (log replay starts past the insert
    // records, as it would after the checkpoint).
    let replay_from = harness.registry.wal().current_lsn();
    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(replay_from).unwrap();

    let rows = harness.registry.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.ondisk && r.status == XactStatus::Prepared));
}

#[tokio::test]
async fn replayed_removal_unlinks_the_state_file() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(204);
    prepare_two(&harness, xid).await;
    harness
        .registry
        .checkpoint(harness.registry.wal().current_lsn())
        .unwrap();

    // Finish the transaction normally; removal records land in the log
    // and the files are unlinked.
    let claimed = harness
        .registry
        .claim_matching(&XactFilter::by_xid(xid), BACKEND);
    assert_eq!(claimed.len(), 2);
    for idx in claimed {
        harness.registry.set_status(idx, XactStatus::Committing);
        assert!(harness.registry.resolve_entry(idx).await.unwrap());
    }
    assert!(!state_file_path(&harness, xid, 1).exists());

    // Replaying the whole log converges to the same end state.
    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(Lsn::INVALID).unwrap();
    assert!(harness.registry.is_empty());
    assert!(!state_file_path(&harness, xid, 1).exists());
}

#[tokio::test]
async fn corrupt_state_file_is_discarded_with_a_warning() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(205);
    prepare_two(&harness, xid).await;
    harness
        .registry
        .checkpoint(harness.registry.wal().current_lsn())
        .unwrap();

    let path = state_file_path(&harness, xid, 1);
    let mut raw = std::fs::read(&path).unwrap();
    raw[6] ^= 0xff;
    std::fs::write(&path, raw).unwrap();

    let replay_from = harness.registry.wal().current_lsn();
    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(replay_from).unwrap();

    assert!(!path.exists());
    let rows = harness.registry.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].server, ServerId(2));
}

#[tokio::test]
async fn prescan_clamps_oldest_xid_and_drops_future_files() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    prepare_two(&harness, Xid(5)).await;
    harness
        .registry
        .checkpoint(harness.registry.wal().current_lsn())
        .unwrap();

    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    // A file from a rewound timeline: its xid is at or past the next xid.
    std::fs::copy(
        state_file_path(&harness, Xid(5), 1),
        harness
            .data_dir
            .join(STATE_DIR)
            .join(format!("{:08x}-{:08x}-{:08x}", 90u32, 1u32, UserId(10).0)),
    )
    .unwrap();

    let oldest = harness.registry.prescan(Xid(30), Xid(40)).unwrap();
    assert_eq!(oldest, Xid(5));
    assert!(!harness
        .data_dir
        .join(STATE_DIR)
        .join(format!("{:08x}-{:08x}-{:08x}", 90u32, 1u32, UserId(10).0))
        .exists());
}

#[tokio::test]
async fn forgetting_entries_skips_the_participants() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(206);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();
    session.prepare_transaction(xid).await.unwrap();

    let forgotten = harness
        .registry
        .forget_matching(&XactFilter::by_xid(xid))
        .unwrap();
    assert_eq!(forgotten, 2);
    assert!(harness.registry.is_empty());

    // The prepared transactions still exist on the participants; nobody
    // resolved them.
    for server in [1, 2] {
        assert_eq!(harness.driver_states[&server].lock().prepared.len(), 1);
        assert!(harness.driver_states[&server].lock().committed.is_empty());
    }
}

#[tokio::test]
async fn orphaned_entries_can_be_resolved_after_recovery() {
    let mut harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let xid = Xid(207);
    prepare_two(&harness, xid).await;

    harness.reopen(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.registry.restore_from_files().unwrap();
    harness.registry.replay_wal(Lsn::INVALID).unwrap();
    harness.registry.mark_orphaned(&HashSet::new());

    let held = harness.registry.claim_indoubt(DB);
    assert_eq!(held.len(), 2);
    for idx in held {
        // Fail-forward: the last known status is `Prepared`, so the
        // resolver commits. The fresh participants report the prepared
        // transaction missing, which counts as success.
        assert!(harness.registry.status(idx).resolve_as_commit());
        assert!(harness.registry.resolve_entry(idx).await.unwrap());
    }
    assert!(harness.registry.is_empty());
}
