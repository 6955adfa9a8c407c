use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

use crate::common::types::{PageId, PageWriteGuard, Rid, TableOid, TxnId};
use crate::transaction::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Transaction states under strict two-phase locking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    UpgradeConflict,
    LockSharedOnReadUncommitted,
    TableLockNotPresent,
    AttemptedIntentionLockOnRow,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
    IncompatibleUpgrade,
    Deadlock,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ_UNCOMMITTED"
            }
            AbortReason::TableLockNotPresent => "row lock without a covering table lock",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while row locks are still held"
            }
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock of a lock that is not held",
            AbortReason::IncompatibleUpgrade => "upgrade to an incompatible lock mode",
            AbortReason::Deadlock => "chosen as a deadlock victim",
        };
        f.write_str(text)
    }
}

/// Error raised after the lock manager has moved a transaction to ABORTED.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

impl TransactionAbort {
    pub fn new(txn_id: TxnId, reason: AbortReason) -> Self {
        Self { txn_id, reason }
    }
}

/// Every lock a transaction currently holds, bucketed the way the lock
/// manager grants them: one set per table mode, and per-table row sets for
/// the two row modes.
#[derive(Debug, Default)]
pub struct LockSets {
    pub shared_tables: HashSet<TableOid>,
    pub exclusive_tables: HashSet<TableOid>,
    pub intention_shared_tables: HashSet<TableOid>,
    pub intention_exclusive_tables: HashSet<TableOid>,
    pub shared_intention_exclusive_tables: HashSet<TableOid>,
    pub shared_rows: HashMap<TableOid, HashSet<Rid>>,
    pub exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }

    pub fn insert_table(&mut self, mode: LockMode, oid: TableOid) {
        self.table_set_mut(mode).insert(oid);
    }

    pub fn remove_table(&mut self, mode: LockMode, oid: TableOid) {
        self.table_set_mut(mode).remove(&oid);
    }

    pub fn insert_row(&mut self, mode: LockMode, oid: TableOid, rid: Rid) {
        debug_assert!(matches!(mode, LockMode::Shared | LockMode::Exclusive));
        let rows = match mode {
            LockMode::Shared => &mut self.shared_rows,
            _ => &mut self.exclusive_rows,
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub fn remove_row(&mut self, mode: LockMode, oid: TableOid, rid: Rid) {
        let rows = match mode {
            LockMode::Shared => &mut self.shared_rows,
            _ => &mut self.exclusive_rows,
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    /// The mode this transaction holds on a table, if any.
    pub fn table_lock_mode(&self, oid: TableOid) -> Option<LockMode> {
        if self.intention_shared_tables.contains(&oid) {
            Some(LockMode::IntentionShared)
        } else if self.shared_tables.contains(&oid) {
            Some(LockMode::Shared)
        } else if self.intention_exclusive_tables.contains(&oid) {
            Some(LockMode::IntentionExclusive)
        } else if self.shared_intention_exclusive_tables.contains(&oid) {
            Some(LockMode::SharedIntentionExclusive)
        } else if self.exclusive_tables.contains(&oid) {
            Some(LockMode::Exclusive)
        } else {
            None
        }
    }

    /// The mode this transaction holds on a row, if any.
    pub fn row_lock_mode(&self, oid: TableOid, rid: Rid) -> Option<LockMode> {
        if self
            .shared_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Shared)
        } else if self
            .exclusive_rows
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Exclusive)
        } else {
            None
        }
    }

    /// Whether any row lock on the table is still held.
    pub fn holds_rows_on(&self, oid: TableOid) -> bool {
        self.shared_rows.get(&oid).is_some_and(|rows| !rows.is_empty())
            || self
                .exclusive_rows
                .get(&oid)
                .is_some_and(|rows| !rows.is_empty())
    }
}

/// An active transaction. State and lock sets are interior-mutable so a
/// shared `Arc<Transaction>` can cross threads; the page set and
/// deleted-page set are the B+-tree's latch-crabbing bookkeeping.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    lock_sets: Mutex<LockSets>,
    page_set: Mutex<Vec<PageWriteGuard>>,
    deleted_page_set: Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            lock_sets: Mutex::new(LockSets::default()),
            page_set: Mutex::new(Vec::new()),
            deleted_page_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub fn lock_sets(&self) -> MutexGuard<'_, LockSets> {
        self.lock_sets.lock()
    }

    /// Append a write-latched page to the crabbing chain.
    pub fn add_to_page_set(&self, guard: PageWriteGuard) {
        self.page_set.lock().push(guard);
    }

    pub fn page_set(&self) -> MutexGuard<'_, Vec<PageWriteGuard>> {
        self.page_set.lock()
    }

    /// Drain the crabbing chain in acquisition order.
    pub fn take_page_set(&self) -> Vec<PageWriteGuard> {
        std::mem::take(&mut *self.page_set.lock())
    }

    pub fn add_deleted_page(&self, page_id: PageId) {
        self.deleted_page_set.lock().insert(page_id);
    }

    pub fn take_deleted_pages(&self) -> HashSet<PageId> {
        std::mem::take(&mut *self.deleted_page_set.lock())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_lock_set_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        {
            let mut sets = txn.lock_sets();
            sets.insert_table(LockMode::IntentionShared, 7);
            sets.insert_row(LockMode::Shared, 7, Rid::new(1, 1));
        }

        let sets = txn.lock_sets();
        assert_eq!(sets.table_lock_mode(7), Some(LockMode::IntentionShared));
        assert_eq!(sets.row_lock_mode(7, Rid::new(1, 1)), Some(LockMode::Shared));
        assert!(sets.holds_rows_on(7));
        assert!(!sets.holds_rows_on(8));
    }

    #[test]
    fn test_row_set_compacts_empty_tables() {
        let txn = Transaction::new(3, IsolationLevel::ReadCommitted);
        let mut sets = txn.lock_sets();
        sets.insert_row(LockMode::Exclusive, 4, Rid::new(2, 5));
        sets.remove_row(LockMode::Exclusive, 4, Rid::new(2, 5));
        assert!(!sets.holds_rows_on(4));
        assert!(sets.exclusive_rows.is_empty());
    }
}
