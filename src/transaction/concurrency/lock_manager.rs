use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TxnId};
use crate::transaction::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Lock modes on a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One queued lock request
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
    is_upgrade: bool,
}

/// Per-record request queue with its own condition variable
struct LockRequestQueue {
    queue: VecDeque<LockRequest>,
    cv: Arc<Condvar>,
    upgrading: bool,
}

impl Default for LockRequestQueue {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            cv: Arc::new(Condvar::new()),
            upgrading: false,
        }
    }
}

/// Everything the lock manager latch protects
#[derive(Default)]
struct LockTable {
    /// Per-record FIFO request queues
    lock_table: HashMap<Rid, LockRequestQueue>,
    /// Mode currently granted on each record
    lock_mode: HashMap<Rid, LockMode>,
    /// Transactions currently holding each record's lock
    lock_holders: HashMap<Rid, HashSet<TxnId>>,
    /// waiter -> holders graph, rebuilt by the detector
    waits_for: HashMap<TxnId, Vec<TxnId>>,
}

/// Tuple-level lock manager under strict two-phase locking.
///
/// Grants follow FIFO order per record: granting proceeds from the queue
/// head and stops at the first request that cannot be granted, so a later
/// shared request never bypasses a blocked writer. The single exception is
/// an upgrading transaction that is the sole current holder, which takes the
/// exclusive lock ahead of the queue.
///
/// A background thread periodically rebuilds the wait-for graph and aborts
/// the youngest transaction of any cycle it finds.
pub struct LockManager {
    table: Arc<Mutex<LockTable>>,
    /// `true` once shutdown is requested; the condvar wakes the detector
    /// out of its interval sleep
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    /// Create a lock manager with a running deadlock detector
    pub fn new(detection_interval: Duration) -> Self {
        let table = Arc::new(Mutex::new(LockTable::default()));
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));

        let thread_table = Arc::clone(&table);
        let thread_shutdown = Arc::clone(&shutdown);
        let detector = std::thread::spawn(move || loop {
            {
                let (stopped, cv) = &*thread_shutdown;
                let mut stopped = stopped.lock();
                if *stopped {
                    break;
                }
                cv.wait_for(&mut stopped, detection_interval);
                if *stopped {
                    break;
                }
            }
            let mut table = thread_table.lock();
            Self::run_detection(&mut table);
        });
        info!("deadlock detection thread launched");

        Self {
            table,
            shutdown,
            detector: Some(detector),
        }
    }

    /// Acquire a shared lock on `rid`.
    ///
    /// Returns `Ok(false)` if the transaction is already finished; blocks
    /// until granted otherwise.
    pub fn lock_shared(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if !Self::precheck(txn)? {
            return Ok(false);
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionError::Abort {
                txn_id: txn.id(),
                reason: AbortReason::SharedOnReadUncommitted,
            });
        }
        // re-entrant: an already sufficient lock stands
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let mut table = self.table.lock();
        Self::acquire(&mut table, txn, rid, LockMode::Shared, false)?;
        txn.add_shared_lock(rid);
        Ok(true)
    }

    /// Acquire an exclusive lock on `rid`
    pub fn lock_exclusive(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if !Self::precheck(txn)? {
            return Ok(false);
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }
        if txn.is_shared_locked(rid) {
            warn!(
                "txn {} requested X on {} while holding S; use lock_upgrade",
                txn.id(),
                rid
            );
            return Ok(false);
        }

        let mut table = self.table.lock();
        Self::acquire(&mut table, txn, rid, LockMode::Exclusive, false)?;
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Upgrade a held shared lock to exclusive.
    ///
    /// Only one upgrade may be pending per record; a second one aborts with
    /// `UpgradeConflict`.
    pub fn lock_upgrade(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
    ) -> Result<bool, TransactionError> {
        if !Self::precheck(txn)? {
            return Ok(false);
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }
        if !txn.is_shared_locked(rid) {
            warn!("txn {} upgrade on {} without a shared lock", txn.id(), rid);
            return Ok(false);
        }

        let mut table = self.table.lock();
        {
            let entry = table.lock_table.entry(rid).or_default();
            if entry.upgrading {
                txn.set_state(TransactionState::Aborted);
                return Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::UpgradeConflict,
                });
            }
            entry.upgrading = true;
        }

        let result = Self::acquire(&mut table, txn, rid, LockMode::Exclusive, true);
        if let Some(entry) = table.lock_table.get_mut(&rid) {
            entry.upgrading = false;
        }
        result?;

        txn.remove_shared_lock(rid);
        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Release the lock held by `txn` on `rid`.
    ///
    /// Under REPEATABLE READ the first unlock moves the transaction from
    /// GROWING to SHRINKING.
    pub fn unlock(&self, txn: &Arc<Transaction>, rid: Rid) -> Result<bool, TransactionError> {
        let mut table = self.table.lock();

        let held = table
            .lock_holders
            .get(&rid)
            .map_or(false, |h| h.contains(&txn.id()));
        if !held {
            warn!("txn {} does not hold a lock on {}", txn.id(), rid);
            return Ok(false);
        }

        if txn.isolation_level() == IsolationLevel::RepeatableRead
            && txn.state() == TransactionState::Growing
        {
            txn.set_state(TransactionState::Shrinking);
        }

        let now_empty = match table.lock_holders.get_mut(&rid) {
            Some(holders) => {
                holders.remove(&txn.id());
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            table.lock_holders.remove(&rid);
            table.lock_mode.remove(&rid);
        }
        debug!("txn {} released lock on {}", txn.id(), rid);

        Self::grant_queue(&mut table, rid);
        Self::notify(&table, rid);
        Self::collect_entry(&mut table, rid);

        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);
        Ok(true)
    }

    /// Enqueue a request and block until it is granted or the transaction
    /// is aborted out from under us.
    fn acquire(
        table: &mut MutexGuard<'_, LockTable>,
        txn: &Arc<Transaction>,
        rid: Rid,
        mode: LockMode,
        is_upgrade: bool,
    ) -> Result<(), TransactionError> {
        let cv = {
            let entry = table.lock_table.entry(rid).or_default();
            entry.queue.push_back(LockRequest {
                txn: Arc::clone(txn),
                mode,
                granted: false,
                is_upgrade,
            });
            Arc::clone(&entry.cv)
        };

        Self::grant_queue(table, rid);
        loop {
            if txn.state() == TransactionState::Aborted {
                break;
            }
            if Self::is_granted(table, rid, txn.id()) {
                break;
            }
            cv.wait(table);
        }
        Self::erase_request(table, rid, txn.id());

        if txn.state() == TransactionState::Aborted {
            // our queue slot is gone; whoever is behind us may now be
            // grantable
            Self::grant_queue(table, rid);
            Self::notify(table, rid);
            debug!("txn {} woke up aborted on {}", txn.id(), rid);
            return Err(TransactionError::Abort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        Ok(())
    }

    /// Reject requests from transactions that may no longer grow their lock
    /// set. `Ok(false)` means the request should be ignored.
    fn precheck(txn: &Arc<Transaction>) -> Result<bool, TransactionError> {
        match txn.state() {
            TransactionState::Shrinking => {
                txn.set_state(TransactionState::Aborted);
                Err(TransactionError::Abort {
                    txn_id: txn.id(),
                    reason: AbortReason::LockOnShrinking,
                })
            }
            TransactionState::Aborted | TransactionState::Committed => Ok(false),
            TransactionState::Growing => Ok(true),
        }
    }

    /// Grant queued requests on a record.
    ///
    /// A pending sole-holder upgrade is served first; the rest is a FIFO
    /// scan from the head that stops at the first blocked request.
    fn grant_queue(table: &mut LockTable, rid: Rid) {
        let Some(entry) = table.lock_table.get_mut(&rid) else {
            return;
        };

        if entry.upgrading {
            if let Some(req) = entry.queue.iter_mut().find(|r| !r.granted && r.is_upgrade) {
                let txn_id = req.txn.id();
                let sole_holder = table
                    .lock_holders
                    .get(&rid)
                    .map_or(false, |h| h.len() == 1 && h.contains(&txn_id));
                if sole_holder {
                    req.granted = true;
                    table.lock_mode.insert(rid, LockMode::Exclusive);
                    debug!("grant X (upgrade) on {} to txn {}", rid, txn_id);
                }
            }
        }

        for req in entry.queue.iter_mut() {
            if req.granted {
                continue;
            }
            let txn_id = req.txn.id();
            match req.mode {
                LockMode::Shared => {
                    if table.lock_mode.get(&rid) == Some(&LockMode::Exclusive) {
                        break;
                    }
                    req.granted = true;
                    table.lock_mode.insert(rid, LockMode::Shared);
                    table.lock_holders.entry(rid).or_default().insert(txn_id);
                    debug!("grant S on {} to txn {}", rid, txn_id);
                    // contiguous sharers are granted together
                }
                LockMode::Exclusive => {
                    let grantable = table
                        .lock_holders
                        .get(&rid)
                        .map_or(true, |h| {
                            h.is_empty() || (h.len() == 1 && h.contains(&txn_id))
                        });
                    if !grantable {
                        break;
                    }
                    req.granted = true;
                    table.lock_mode.insert(rid, LockMode::Exclusive);
                    table.lock_holders.entry(rid).or_default().insert(txn_id);
                    debug!("grant X on {} to txn {}", rid, txn_id);
                    break;
                }
            }
        }
    }

    fn is_granted(table: &LockTable, rid: Rid, txn_id: TxnId) -> bool {
        table
            .lock_table
            .get(&rid)
            .and_then(|entry| entry.queue.iter().find(|r| r.txn.id() == txn_id))
            .map_or(false, |r| r.granted)
    }

    fn erase_request(table: &mut LockTable, rid: Rid, txn_id: TxnId) {
        if let Some(entry) = table.lock_table.get_mut(&rid) {
            if let Some(pos) = entry.queue.iter().position(|r| r.txn.id() == txn_id) {
                entry.queue.remove(pos);
            }
        }
    }

    fn notify(table: &LockTable, rid: Rid) {
        if let Some(entry) = table.lock_table.get(&rid) {
            entry.cv.notify_all();
        }
    }

    /// Drop a record's queue once nothing holds or waits on it
    fn collect_entry(table: &mut LockTable, rid: Rid) {
        let removable = table
            .lock_table
            .get(&rid)
            .map_or(false, |e| e.queue.is_empty() && !e.upgrading)
            && !table.lock_holders.contains_key(&rid);
        if removable {
            table.lock_table.remove(&rid);
        }
    }

    // ---- deadlock detection ----

    /// One detector pass: rebuild the graph and abort victims until the
    /// graph is acyclic.
    fn run_detection(table: &mut LockTable) {
        loop {
            Self::build_waits_for(table);
            match Self::find_victim(table) {
                None => break,
                Some(victim) => {
                    info!("deadlock detected, aborting youngest txn {}", victim);
                    Self::abort_victim(table, victim);
                }
            }
        }
    }

    /// Rebuild the wait-for graph: one edge from every blocked request to
    /// every holder of the record it waits on.
    fn build_waits_for(table: &mut LockTable) {
        let mut graph: HashMap<TxnId, Vec<TxnId>> = HashMap::new();
        for (rid, entry) in &table.lock_table {
            let Some(holders) = table.lock_holders.get(rid) else {
                continue;
            };
            for req in &entry.queue {
                if req.granted {
                    continue;
                }
                let waiter = req.txn.id();
                for &holder in holders {
                    if holder == waiter {
                        continue;
                    }
                    let edges = graph.entry(waiter).or_default();
                    if !edges.contains(&holder) {
                        edges.push(holder);
                    }
                }
            }
        }
        table.waits_for = graph;
    }

    /// Deterministic cycle search: sources in ascending transaction-ID
    /// order, neighbors likewise. Returns the youngest (largest ID) member
    /// of the first cycle found.
    fn find_victim(table: &LockTable) -> Option<TxnId> {
        let mut sources: Vec<TxnId> = table.waits_for.keys().copied().collect();
        sources.sort_unstable();

        let mut visited = HashSet::new();
        for source in sources {
            let mut path = Vec::new();
            let mut on_path = HashSet::new();
            if let Some(victim) =
                Self::dfs(table, source, &mut path, &mut on_path, &mut visited)
            {
                return Some(victim);
            }
        }
        None
    }

    fn dfs(
        table: &LockTable,
        node: TxnId,
        path: &mut Vec<TxnId>,
        on_path: &mut HashSet<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        if on_path.contains(&node) {
            // back edge: the cycle is the path suffix starting at `node`
            let pos = path.iter().position(|&t| t == node)?;
            return path[pos..].iter().copied().max();
        }
        if visited.contains(&node) {
            return None;
        }
        visited.insert(node);
        path.push(node);
        on_path.insert(node);

        let mut neighbors = table.waits_for.get(&node).cloned().unwrap_or_default();
        neighbors.sort_unstable();
        for next in neighbors {
            if let Some(victim) = Self::dfs(table, next, path, on_path, visited) {
                return Some(victim);
            }
        }

        path.pop();
        on_path.remove(&node);
        None
    }

    /// Abort a victim: mark it, strip its pending requests from every
    /// queue, and wake the queues it touched.
    fn abort_victim(table: &mut LockTable, victim: TxnId) {
        let mut affected = Vec::new();
        for (&rid, entry) in table.lock_table.iter_mut() {
            let mut removed = false;
            entry.queue.retain(|req| {
                if !req.granted && req.txn.id() == victim {
                    req.txn.set_state(TransactionState::Aborted);
                    removed = true;
                    false
                } else {
                    true
                }
            });
            if removed {
                affected.push(rid);
            }
        }

        for rid in affected {
            Self::grant_queue(table, rid);
            Self::notify(table, rid);
        }
    }

    // ---- graph surface for tests ----

    pub fn add_edge(&self, t1: TxnId, t2: TxnId) {
        let mut table = self.table.lock();
        let edges = table.waits_for.entry(t1).or_default();
        if !edges.contains(&t2) {
            edges.push(t2);
        }
    }

    pub fn remove_edge(&self, t1: TxnId, t2: TxnId) {
        let mut table = self.table.lock();
        if let Some(edges) = table.waits_for.get_mut(&t1) {
            edges.retain(|&t| t != t2);
        }
    }

    /// Victim of the first cycle in the current graph, if any
    pub fn has_cycle(&self) -> Option<TxnId> {
        let table = self.table.lock();
        Self::find_victim(&table)
    }

    /// All edges in the current graph, sorted
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let table = self.table.lock();
        let mut edges = Vec::new();
        for (&t1, targets) in &table.waits_for {
            for &t2 in targets {
                edges.push((t1, t2));
            }
        }
        edges.sort_unstable();
        edges
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        let (stopped, cv) = &*self.shutdown;
        *stopped.lock() = true;
        cv.notify_all();
        if let Some(handle) = self.detector.take() {
            let _ = handle.join();
        }
        info!("deadlock detection thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_without_detection() -> LockManager {
        // long interval keeps the detector quiet during these tests
        LockManager::new(Duration::from_secs(600))
    }

    #[test]
    fn test_shared_locks_coexist() {
        let lm = manager_without_detection();
        let t1 = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let t2 = Arc::new(Transaction::new(2, IsolationLevel::RepeatableRead));
        let rid = Rid::new(1, 1);

        assert!(lm.lock_shared(&t1, rid).unwrap());
        assert!(lm.lock_shared(&t2, rid).unwrap());
        assert!(t1.is_shared_locked(rid));
        assert!(t2.is_shared_locked(rid));

        assert!(lm.unlock(&t1, rid).unwrap());
        assert!(lm.unlock(&t2, rid).unwrap());
    }

    #[test]
    fn test_shared_on_read_uncommitted_aborts() {
        let lm = manager_without_detection();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::ReadUncommitted));
        let rid = Rid::new(1, 1);

        let err = lm.lock_shared(&txn, rid).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Abort {
                reason: AbortReason::SharedOnReadUncommitted,
                ..
            }
        ));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_lock_on_shrinking_aborts() {
        let lm = manager_without_detection();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let a = Rid::new(1, 1);
        let b = Rid::new(1, 2);

        assert!(lm.lock_exclusive(&txn, a).unwrap());
        assert!(lm.unlock(&txn, a).unwrap());
        assert_eq!(txn.state(), TransactionState::Shrinking);

        let err = lm.lock_exclusive(&txn, b).unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Abort {
                reason: AbortReason::LockOnShrinking,
                ..
            }
        ));
    }

    #[test]
    fn test_sole_holder_upgrade_is_immediate() {
        let lm = manager_without_detection();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        let rid = Rid::new(1, 1);

        assert!(lm.lock_shared(&txn, rid).unwrap());
        assert!(lm.lock_upgrade(&txn, rid).unwrap());
        assert!(!txn.is_shared_locked(rid));
        assert!(txn.is_exclusive_locked(rid));
        assert!(lm.unlock(&txn, rid).unwrap());
    }

    #[test]
    fn test_unlock_without_lock_is_reported() {
        let lm = manager_without_detection();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::RepeatableRead));
        assert!(!lm.unlock(&txn, Rid::new(1, 1)).unwrap());
    }

    #[test]
    fn test_read_committed_unlock_keeps_growing() {
        let lm = manager_without_detection();
        let txn = Arc::new(Transaction::new(1, IsolationLevel::ReadCommitted));
        let rid = Rid::new(1, 1);

        assert!(lm.lock_shared(&txn, rid).unwrap());
        assert!(lm.unlock(&txn, rid).unwrap());
        // READ COMMITTED re-reads do not shrink the transaction
        assert_eq!(txn.state(), TransactionState::Growing);
        assert!(lm.lock_shared(&txn, rid).unwrap());
    }

    #[test]
    fn test_graph_cycle_detection() {
        let lm = manager_without_detection();
        lm.add_edge(1, 2);
        lm.add_edge(2, 1);
        assert_eq!(lm.has_cycle(), Some(2));

        lm.remove_edge(2, 1);
        assert_eq!(lm.has_cycle(), None);
        assert_eq!(lm.edge_list(), vec![(1, 2)]);
    }

    #[test]
    fn test_graph_victim_is_youngest_in_cycle() {
        let lm = manager_without_detection();
        lm.add_edge(1, 2);
        lm.add_edge(2, 3);
        lm.add_edge(3, 1);
        lm.add_edge(5, 1);
        assert_eq!(lm.has_cycle(), Some(3));
    }
}
