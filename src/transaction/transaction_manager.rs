use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::{IsolationLevel, Transaction, TransactionState};

/// Creates and tracks transactions, and releases their locks when they
/// finish.
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

    /// Begin a new transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    /// Commit: mark the transaction committed and release everything it
    /// holds.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all_locks(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    /// Abort: mark the transaction aborted and release everything it holds.
    /// Undoing its writes is the caller's responsibility (recovery lives
    /// outside this crate).
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all_locks(txn);
        self.active_transactions.lock().remove(&txn.id());
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::Rid;
    use crate::transaction::lock_manager::LockMode;

    fn setup() -> (Arc<LockManager>, TransactionManager) {
        let lock_manager = Arc::new(LockManager::new());
        let manager = TransactionManager::new(lock_manager.clone());
        (lock_manager, manager)
    }

    #[test]
    fn test_begin_assigns_increasing_ids() {
        let (_lock_manager, manager) = setup();
        let t1 = manager.begin(IsolationLevel::ReadCommitted);
        let t2 = manager.begin(IsolationLevel::RepeatableRead);
        assert_eq!(t1.id(), 1);
        assert_eq!(t2.id(), 2);
        assert_eq!(manager.active_transaction_ids().len(), 2);
    }

    #[test]
    fn test_commit_releases_locks() {
        let (lock_manager, manager) = setup();
        let txn = manager.begin(IsolationLevel::RepeatableRead);

        lock_manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap();
        lock_manager
            .lock_row(&txn, LockMode::Exclusive, 1, Rid::new(1, 1))
            .unwrap();

        manager.commit(&txn);
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(txn.lock_sets().table_lock_mode(1).is_none());
        assert!(!txn.lock_sets().holds_rows_on(1));
        assert!(manager.get_transaction(txn.id()).is_none());

        // The released table lock is immediately grantable to others.
        let other = manager.begin(IsolationLevel::RepeatableRead);
        assert!(lock_manager
            .lock_table(&other, LockMode::Exclusive, 1)
            .unwrap());
    }

    #[test]
    fn test_abort_releases_locks() {
        let (lock_manager, manager) = setup();
        let txn = manager.begin(IsolationLevel::ReadCommitted);
        lock_manager
            .lock_table(&txn, LockMode::Exclusive, 3)
            .unwrap();

        manager.abort(&txn);
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(txn.lock_sets().table_lock_mode(3).is_none());
    }
}
