use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use log::{debug, info};
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Creates and tracks transactions, and drives lock release at the end of
/// their lifetime.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, Arc::clone(&txn));
        debug!("begin txn {}", txn_id);
        txn
    }

    /// Commit: release every held lock, then mark the transaction committed
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        if txn.state() == TransactionState::Committed || txn.state() == TransactionState::Aborted {
            return Err(TransactionError::NotActive(txn.id()));
        }

        self.release_all_locks(txn)?;
        txn.set_state(TransactionState::Committed);
        self.active_transactions.lock().remove(&txn.id());
        debug!("commit txn {}", txn.id());
        Ok(())
    }

    /// Abort: release every held lock, then mark the transaction aborted.
    ///
    /// Rolling back data changes is the executors' job; the storage core
    /// only guarantees the locks are gone.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        self.release_all_locks(txn)?;
        txn.set_state(TransactionState::Aborted);
        self.active_transactions.lock().remove(&txn.id());
        info!("abort txn {}", txn.id());
        Ok(())
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active_transactions.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn release_all_locks(&self, txn: &Arc<Transaction>) -> Result<(), TransactionError> {
        for rid in txn.held_locks() {
            self.lock_manager.unlock(txn, rid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::common::types::Rid;

    fn setup() -> (Arc<LockManager>, TransactionManager) {
        let lm = Arc::new(LockManager::new(Duration::from_secs(600)));
        let tm = TransactionManager::new(Arc::clone(&lm));
        (lm, tm)
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let (_lm, tm) = setup();
        let t1 = tm.begin(IsolationLevel::RepeatableRead);
        let t2 = tm.begin(IsolationLevel::RepeatableRead);
        assert!(t2.id() > t1.id());
        assert_eq!(tm.active_transaction_ids(), vec![t1.id(), t2.id()]);
    }

    #[test]
    fn test_commit_releases_locks() {
        let (lm, tm) = setup();
        let txn = tm.begin(IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 1);
        assert!(lm.lock_exclusive(&txn, rid).unwrap());

        tm.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.held_locks().is_empty());

        // the lock is free again for the next transaction
        let other = tm.begin(IsolationLevel::RepeatableRead);
        assert!(lm.lock_exclusive(&other, rid).unwrap());
        tm.commit(&other).unwrap();
    }

    #[test]
    fn test_double_commit_rejected() {
        let (_lm, tm) = setup();
        let txn = tm.begin(IsolationLevel::ReadCommitted);
        tm.commit(&txn).unwrap();
        assert!(matches!(
            tm.commit(&txn),
            Err(TransactionError::NotActive(_))
        ));
    }

    #[test]
    fn test_abort_releases_locks() {
        let (lm, tm) = setup();
        let txn = tm.begin(IsolationLevel::RepeatableRead);
        let rid = Rid::new(2, 7);
        assert!(lm.lock_shared(&txn, rid).unwrap());

        tm.abort(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(tm.get_transaction(txn.id()).is_none());
    }
}
