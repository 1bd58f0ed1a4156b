//! End-to-end commit paths through the foreign transaction manager.

mod common;

use common::{key, setup, BACKEND, DB};
use fedtx_common::{Lsn, ServerId, TwophaseCommitLevel, Xid};
use fedtx_wal::WalRecord;
use fedtx_xact::{finish_prepared, XactError, XactSession, XactStatus};

fn wal_counts(harness: &common::Harness, xid: Xid) -> (usize, usize) {
    let records = harness.registry.wal().replay(Lsn::INVALID).unwrap();
    let inserts = records
        .iter()
        .filter(|(_, _, r)| matches!(r, WalRecord::InsertPrepare(rec) if rec.local_xid == xid))
        .count();
    let removes = records
        .iter()
        .filter(|(_, _, r)| matches!(r, WalRecord::RemovePrepare(rec) if rec.local_xid == xid))
        .count();
    (inserts, removes)
}

#[tokio::test]
async fn two_capable_participants_commit_atomically() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(100);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    session.pre_commit(xid, true).await.unwrap();
    assert_eq!(harness.registry.len(), 2);

    session.at_eoxact(xid, true).await;
    assert!(harness.registry.is_empty());

    assert_eq!(wal_counts(&harness, xid), (2, 2));
    for server in [1, 2] {
        let state = harness.driver_states[&server].lock();
        assert_eq!(state.committed, vec![xid]);
        assert!(state.prepared.is_empty());
    }
}

#[tokio::test]
async fn mixed_capability_fails_in_required_mode() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, false)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(101);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    let err = session.pre_commit(xid, false).await.unwrap_err();
    assert!(matches!(
        err,
        XactError::TwophaseUnsupported {
            server: ServerId(2)
        }
    ));

    // The local commit fails; the abort path rolls everyone back.
    session.at_eoxact(xid, false).await;
    assert!(harness.registry.is_empty());
    for server in [1, 2] {
        assert_eq!(harness.driver_states[&server].lock().rolled_back, vec![xid]);
    }
}

#[tokio::test]
async fn disabled_mode_rejects_multi_source_writes() {
    let harness = setup(4, TwophaseCommitLevel::Disabled, &[(1, true), (2, true)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    let err = session.pre_commit(Xid(102), false).await.unwrap_err();
    assert!(matches!(err, XactError::TwophaseNotAllowed));
}

#[tokio::test]
async fn prefer_mode_prepares_only_capable_participants() {
    let harness = setup(4, TwophaseCommitLevel::Prefer, &[(1, true), (2, false)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(103);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    session.pre_commit(xid, false).await.unwrap();
    assert_eq!(harness.registry.len(), 1);

    session.at_eoxact(xid, true).await;
    assert!(harness.registry.is_empty());
    assert_eq!(harness.driver_states[&1].lock().committed, vec![xid]);
    assert_eq!(harness.driver_states[&2].lock().committed, vec![xid]);
}

#[tokio::test]
async fn single_participant_without_local_write_commits_one_phase() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(104);

    session.register_participant(key(1), true).unwrap();
    session.pre_commit(xid, false).await.unwrap();
    assert!(harness.registry.is_empty());

    session.at_eoxact(xid, true).await;
    assert_eq!(harness.driver_states[&1].lock().committed, vec![xid]);
    assert_eq!(wal_counts(&harness, xid), (0, 0));
}

#[tokio::test]
async fn failed_prepare_aborts_every_participant() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.driver_states[&2].lock().fail_prepares = 1;

    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(105);
    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    let err = session.pre_commit(xid, true).await.unwrap_err();
    assert!(matches!(err, XactError::PrepareFailed { .. }));
    // The entry for the participant that failed to prepare is gone; the
    // one that prepared successfully is still pending.
    assert_eq!(harness.registry.len(), 1);

    session.at_eoxact(xid, false).await;
    assert!(harness.registry.is_empty());
    assert_eq!(harness.driver_states[&1].lock().rolled_back, vec![xid]);
    assert_eq!(harness.driver_states[&2].lock().rolled_back, vec![xid]);
}

#[tokio::test]
async fn transient_resolve_failure_leaves_entry_in_doubt() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    harness.driver_states[&2].lock().fail_resolves = 1;

    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(106);
    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    session.pre_commit(xid, true).await.unwrap();
    session.at_eoxact(xid, true).await;

    let rows = harness.registry.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].server, ServerId(2));
    assert_eq!(rows[0].status, XactStatus::Committing);
    assert!(rows[0].indoubt);
}

#[tokio::test]
async fn prepared_transaction_is_finished_later() {
    let harness = setup(4, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(107);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();
    session.prepare_transaction(xid).await.unwrap();

    let rows = harness.registry.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.status == XactStatus::Prepared));

    let resolved = finish_prepared(&harness.registry, BACKEND, xid, true)
        .await
        .unwrap();
    assert_eq!(resolved, 2);
    assert!(harness.registry.is_empty());
    for server in [1, 2] {
        assert_eq!(harness.driver_states[&server].lock().committed, vec![xid]);
    }
}

#[tokio::test]
async fn prepare_transaction_requires_capable_participants() {
    let harness = setup(4, TwophaseCommitLevel::Prefer, &[(1, true), (2, false)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), false).unwrap();

    let err = session.prepare_transaction(Xid(108)).await.unwrap_err();
    assert!(matches!(
        err,
        XactError::TwophaseUnsupported {
            server: ServerId(2)
        }
    ));
}

#[tokio::test]
async fn entry_pool_exhaustion_fails_the_commit() {
    let harness = setup(1, TwophaseCommitLevel::Required, &[(1, true), (2, true)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);
    let xid = Xid(109);

    session.register_participant(key(1), true).unwrap();
    session.register_participant(key(2), true).unwrap();

    let err = session.pre_commit(xid, false).await.unwrap_err();
    assert!(matches!(err, XactError::PoolExhausted { capacity: 1 }));
}

#[tokio::test]
async fn repeated_registration_widens_the_modification_flag() {
    let harness = setup(4, TwophaseCommitLevel::Disabled, &[(1, true)]);
    let mut session = XactSession::new(harness.registry.clone(), BACKEND, DB);

    session.register_participant(key(1), false).unwrap();
    session.register_participant(key(1), true).unwrap();

    // One modifying participant plus a local write requires two-phase
    // commit, which disabled mode rejects.
    let err = session.pre_commit(Xid(110), true).await.unwrap_err();
    assert!(matches!(err, XactError::TwophaseNotAllowed));
}
