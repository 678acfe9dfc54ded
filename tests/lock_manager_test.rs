use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use stratumdb::common::types::Rid;
use stratumdb::transaction::{
    AbortReason, IsolationLevel, LockManager, Transaction, TransactionError, TransactionManager,
    TransactionState,
};

const QUIET: Duration = Duration::from_secs(600);
const SETTLE: Duration = Duration::from_millis(100);

#[test]
fn test_exclusive_lock_blocks_second_writer() {
    let lock_manager = Arc::new(LockManager::new(QUIET));
    let t1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    let t2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
    let rid = Rid::new(1, 1);

    assert!(lock_manager.lock_exclusive(&t1, rid).unwrap());

    let (granted_tx, granted_rx) = mpsc::channel();
    let waiter = {
        let lock_manager = Arc::clone(&lock_manager);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            let granted = lock_manager.lock_exclusive(&t2, rid).unwrap();
            granted_tx.send(()).unwrap();
            granted
        })
    };

    // the second writer must still be blocked
    thread::sleep(SETTLE);
    assert!(granted_rx.try_recv().is_err());

    assert!(lock_manager.unlock(&t1, rid).unwrap());
    assert!(waiter.join().unwrap());
    assert!(t2.is_exclusive_locked(rid));
    assert!(lock_manager.unlock(&t2, rid).unwrap());
}

// T1 holds S; T2 queues X; T3's later S request must not slip past T2.
// Unlocks then grant strictly in queue order: T2, then T3.
#[test]
fn test_fifo_shared_does_not_bypass_waiting_exclusive() {
    let lock_manager = Arc::new(LockManager::new(QUIET));
    let t1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    let t2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
    let t3 = Arc::new(Transaction::new(3, IsolationLevel::RepeatableRead));
    let rid = Rid::new(2, 1);

    assert!(lock_manager.lock_shared(&t1, rid).unwrap());

    let (events_tx, events_rx) = mpsc::channel();
    let (release2_tx, release2_rx) = mpsc::channel::<()>();

    let writer = {
        let lock_manager = Arc::clone(&lock_manager);
        let t2 = Arc::clone(&t2);
        let events_tx = events_tx.clone();
        thread::spawn(move || {
            assert!(lock_manager.lock_exclusive(&t2, rid).unwrap());
            events_tx.send(2u32).unwrap();
            release2_rx.recv().unwrap();
            assert!(lock_manager.unlock(&t2, rid).unwrap());
        })
    };

    // give T2 time to enter the queue before T3 asks
    thread::sleep(SETTLE);
    let reader = {
        let lock_manager = Arc::clone(&lock_manager);
        let t3 = Arc::clone(&t3);
        let events_tx = events_tx.clone();
        thread::spawn(move || {
            assert!(lock_manager.lock_shared(&t3, rid).unwrap());
            events_tx.send(3u32).unwrap();
            assert!(lock_manager.unlock(&t3, rid).unwrap());
        })
    };

    // both must be blocked while T1 holds its shared lock
    thread::sleep(SETTLE);
    assert!(events_rx.try_recv().is_err());

    assert!(lock_manager.unlock(&t1, rid).unwrap());

    // T2 is granted first
    assert_eq!(events_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 2);
    thread::sleep(SETTLE);
    assert!(events_rx.try_recv().is_err(), "T3 bypassed the waiting writer");

    // T2 releases, then T3 gets through
    release2_tx.send(()).unwrap();
    assert_eq!(events_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);

    writer.join().unwrap();
    reader.join().unwrap();
}

#[test]
fn test_upgrade_waits_for_other_sharers() {
    let lock_manager = Arc::new(LockManager::new(QUIET));
    let t1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    let t2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
    let rid = Rid::new(3, 1);

    assert!(lock_manager.lock_shared(&t1, rid).unwrap());
    assert!(lock_manager.lock_shared(&t2, rid).unwrap());

    let (granted_tx, granted_rx) = mpsc::channel();
    let upgrader = {
        let lock_manager = Arc::clone(&lock_manager);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            let granted = lock_manager.lock_upgrade(&t1, rid).unwrap();
            granted_tx.send(()).unwrap();
            granted
        })
    };

    thread::sleep(SETTLE);
    assert!(granted_rx.try_recv().is_err(), "upgrade granted too early");

    // once the other sharer leaves, the upgrade goes through
    assert!(lock_manager.unlock(&t2, rid).unwrap());
    assert!(upgrader.join().unwrap());
    assert!(t1.is_exclusive_locked(rid));
    assert!(!t1.is_shared_locked(rid));
    assert!(lock_manager.unlock(&t1, rid).unwrap());
}

#[test]
fn test_second_upgrade_aborts_with_conflict() {
    let lock_manager = Arc::new(LockManager::new(QUIET));
    let t1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
    let t2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
    let rid = Rid::new(4, 1);

    assert!(lock_manager.lock_shared(&t1, rid).unwrap());
    assert!(lock_manager.lock_shared(&t2, rid).unwrap());

    let upgrader = {
        let lock_manager = Arc::clone(&lock_manager);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || lock_manager.lock_upgrade(&t1, rid).unwrap())
    };

    thread::sleep(SETTLE);
    let err = lock_manager.lock_upgrade(&t2, rid).unwrap_err();
    assert!(matches!(
        err,
        TransactionError::Abort {
            reason: AbortReason::UpgradeConflict,
            ..
        }
    ));
    assert_eq!(t2.state(), TransactionState::Aborted);

    // releasing the aborted sharer's lock unblocks the first upgrade
    assert!(lock_manager.unlock(&t2, rid).unwrap());
    assert!(upgrader.join().unwrap());
    assert!(lock_manager.unlock(&t1, rid).unwrap());
}

// T1 holds X(A) and wants X(B); T2 holds X(B) and wants X(A). The detector
// aborts the youngest (T2); T1 finishes and commits.
#[test]
fn test_deadlock_detector_aborts_youngest() {
    let lock_manager = Arc::new(LockManager::new(Duration::from_millis(50)));
    let txn_manager = Arc::new(TransactionManager::new(Arc::clone(&lock_manager)));

    let t1 = txn_manager.begin(IsolationLevel::RepeatableRead);
    let t2 = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(t1.id() < t2.id());

    let a = Rid::new(5, 1);
    let b = Rid::new(5, 2);

    assert!(lock_manager.lock_exclusive(&t1, a).unwrap());
    assert!(lock_manager.lock_exclusive(&t2, b).unwrap());

    let older = {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let t1 = Arc::clone(&t1);
        thread::spawn(move || {
            // blocks on T2, then proceeds once the victim is gone
            let granted = lock_manager.lock_exclusive(&t1, b).unwrap();
            txn_manager.commit(&t1).unwrap();
            granted
        })
    };

    let younger = {
        let lock_manager = Arc::clone(&lock_manager);
        let txn_manager = Arc::clone(&txn_manager);
        let t2 = Arc::clone(&t2);
        thread::spawn(move || {
            thread::sleep(SETTLE / 2);
            let result = lock_manager.lock_exclusive(&t2, a);
            // the deadlock victim unwinds and releases everything it holds
            txn_manager.abort(&t2).unwrap();
            result
        })
    };

    let younger_result = younger.join().unwrap();
    match younger_result {
        Err(TransactionError::Abort {
            reason: AbortReason::Deadlock,
            ..
        }) => {}
        other => panic!("expected deadlock abort for the younger txn, got {:?}", other),
    }

    assert!(older.join().unwrap());
    assert_eq!(t1.state(), TransactionState::Committed);
    assert_eq!(t2.state(), TransactionState::Aborted);
}

#[test]
fn test_detector_leaves_graph_acyclic() {
    let lock_manager = LockManager::new(QUIET);

    lock_manager.add_edge(1, 2);
    lock_manager.add_edge(2, 3);
    lock_manager.add_edge(3, 1);
    assert_eq!(lock_manager.has_cycle(), Some(3));

    // removing the victim's edges resolves the cycle
    lock_manager.remove_edge(3, 1);
    assert_eq!(lock_manager.has_cycle(), None);
    assert_eq!(lock_manager.edge_list(), vec![(1, 2), (2, 3)]);
}

#[test]
fn test_read_committed_releases_shared_immediately() {
    let lock_manager = Arc::new(LockManager::new(QUIET));
    let txn_manager = TransactionManager::new(Arc::clone(&lock_manager));

    let reader = txn_manager.begin(IsolationLevel::ReadCommitted);
    let writer = txn_manager.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(6, 1);

    // READ COMMITTED: the shared lock is dropped right after the read and
    // the transaction keeps growing
    assert!(lock_manager.lock_shared(&reader, rid).unwrap());
    assert!(lock_manager.unlock(&reader, rid).unwrap());
    assert_eq!(reader.state(), TransactionState::Growing);

    // a writer can now take the exclusive lock without waiting
    assert!(lock_manager.lock_exclusive(&writer, rid).unwrap());

    txn_manager.commit(&writer).unwrap();
    txn_manager.commit(&reader).unwrap();
}
