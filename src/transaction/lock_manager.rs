use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::deadlock::WaitsForGraph;
use crate::transaction::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionAbort, TransactionState,
};

/// Multi-granularity lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }
}

/// Compatibility matrix: can `requested` be granted alongside a held lock?
pub fn compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (held, requested),
        (
            IntentionShared,
            IntentionShared | IntentionExclusive | Shared | SharedIntentionExclusive
        ) | (IntentionExclusive, IntentionShared | IntentionExclusive)
            | (Shared, IntentionShared | Shared)
            | (SharedIntentionExclusive, IntentionShared)
    )
}

/// Permitted upgrade transitions: IS -> {S, IX, SIX, X}, S -> {X, SIX},
/// IX -> {SIX, X}, SIX -> {X}. Row locks only ever upgrade S -> X.
fn upgrade_allowed(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (held, requested),
        (
            IntentionShared,
            Shared | IntentionExclusive | SharedIntentionExclusive | Exclusive
        ) | (Shared, Exclusive | SharedIntentionExclusive)
            | (IntentionExclusive, SharedIntentionExclusive | Exclusive)
            | (SharedIntentionExclusive, Exclusive)
    )
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct QueueInner {
    requests: VecDeque<LockRequest>,
    upgrading: Option<TxnId>,
}

/// Per-resource FIFO queue of lock requests plus the upgrade slot.
struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            cv: Condvar::new(),
        }
    }
}

enum Classification {
    AlreadyHeld,
    Upgrade(LockMode),
    Fresh,
}

/// Hierarchical table/row lock manager enforcing two-phase locking under
/// the transaction's isolation level. Misuse aborts the transaction first
/// and then surfaces a [`TransactionAbort`].
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    detection_enabled: AtomicBool,
    detection_thread: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            detection_enabled: AtomicBool::new(false),
            detection_thread: Mutex::new(None),
        }
    }

    /// Acquire a table lock, blocking until it is grantable. Returns
    /// `Ok(true)` on grant (including the no-op re-request of a held mode).
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        self.check_admission(txn, mode, false)?;
        let upgrade = match self.classify(txn, mode, oid, None)? {
            Classification::AlreadyHeld => return Ok(true),
            Classification::Upgrade(old_mode) => Some(old_mode),
            Classification::Fresh => None,
        };

        let mut map = self.table_lock_map.lock();
        let queue = map
            .entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone();
        let inner = queue.inner.lock();
        drop(map);

        self.acquire(txn, mode, oid, None, &queue, inner, upgrade)
    }

    /// Acquire a row lock. Intention modes are rejected, and the
    /// transaction must already hold a covering table lock.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        self.check_admission(txn, mode, true)?;
        self.check_row_hierarchy(txn, mode, oid)?;
        let upgrade = match self.classify(txn, mode, oid, Some(rid))? {
            Classification::AlreadyHeld => return Ok(true),
            Classification::Upgrade(old_mode) => Some(old_mode),
            Classification::Fresh => None,
        };

        let mut map = self.row_lock_map.lock();
        let queue = map
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone();
        let inner = queue.inner.lock();
        drop(map);

        self.acquire(txn, mode, oid, Some(rid), &queue, inner, upgrade)
    }

    /// Release a table lock. Aborts the transaction if it does not hold one
    /// or still holds row locks on the table.
    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
    ) -> Result<bool, TransactionAbort> {
        let (mode, rows_held) = {
            let sets = txn.lock_sets();
            (sets.table_lock_mode(oid), sets.holds_rows_on(oid))
        };
        let Some(mode) = mode else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if rows_held {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mut map = self.table_lock_map.lock();
        let queue = map
            .get(&oid)
            .expect("held table lock implies a request queue")
            .clone();
        let mut inner = queue.inner.lock();
        drop(map);

        Self::remove_request(&mut inner, txn.id());
        txn.lock_sets().remove_table(mode, oid);
        queue.cv.notify_all();
        drop(inner);

        self.update_state_on_unlock(txn, mode);
        Ok(true)
    }

    /// Release a row lock. Aborts the transaction if it does not hold one.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<bool, TransactionAbort> {
        let mode = txn.lock_sets().row_lock_mode(oid, rid);
        let Some(mode) = mode else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut map = self.row_lock_map.lock();
        let queue = map
            .get(&rid)
            .expect("held row lock implies a request queue")
            .clone();
        let mut inner = queue.inner.lock();
        drop(map);

        Self::remove_request(&mut inner, txn.id());
        txn.lock_sets().remove_row(mode, oid, rid);
        queue.cv.notify_all();
        drop(inner);

        self.update_state_on_unlock(txn, mode);
        Ok(true)
    }

    /// Drop every lock the transaction still holds, rows before tables.
    /// Used at commit/abort; performs no admission checks and no state
    /// transitions.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (row_locks, table_locks) = {
            let sets = txn.lock_sets();
            let mut rows: Vec<(TableOid, Rid, LockMode)> = Vec::new();
            for (&oid, rids) in &sets.shared_rows {
                rows.extend(rids.iter().map(|&rid| (oid, rid, LockMode::Shared)));
            }
            for (&oid, rids) in &sets.exclusive_rows {
                rows.extend(rids.iter().map(|&rid| (oid, rid, LockMode::Exclusive)));
            }
            let mut tables: Vec<(TableOid, LockMode)> = Vec::new();
            for (set, mode) in [
                (&sets.shared_tables, LockMode::Shared),
                (&sets.exclusive_tables, LockMode::Exclusive),
                (&sets.intention_shared_tables, LockMode::IntentionShared),
                (&sets.intention_exclusive_tables, LockMode::IntentionExclusive),
                (
                    &sets.shared_intention_exclusive_tables,
                    LockMode::SharedIntentionExclusive,
                ),
            ] {
                tables.extend(set.iter().map(|&oid| (oid, mode)));
            }
            (rows, tables)
        };

        for (oid, rid, mode) in row_locks {
            let queue = self.row_lock_map.lock().get(&rid).cloned();
            if let Some(queue) = queue {
                let mut inner = queue.inner.lock();
                Self::remove_request(&mut inner, txn.id());
                if inner.upgrading == Some(txn.id()) {
                    inner.upgrading = None;
                }
                queue.cv.notify_all();
            }
            txn.lock_sets().remove_row(mode, oid, rid);
        }
        for (oid, mode) in table_locks {
            let queue = self.table_lock_map.lock().get(&oid).cloned();
            if let Some(queue) = queue {
                let mut inner = queue.inner.lock();
                Self::remove_request(&mut inner, txn.id());
                if inner.upgrading == Some(txn.id()) {
                    inner.upgrading = None;
                }
                queue.cv.notify_all();
            }
            txn.lock_sets().remove_table(mode, oid);
        }
    }

    /// Start the background deadlock detector, waking every `interval`.
    pub fn run_cycle_detection(self: &Arc<Self>, interval: Duration) {
        self.detection_enabled.store(true, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let handle = thread::spawn(move || loop {
            thread::sleep(interval);
            let Some(manager) = weak.upgrade() else { break };
            if !manager.detection_enabled.load(Ordering::SeqCst) {
                break;
            }
            manager.detect_deadlocks();
        });
        *self.detection_thread.lock() = Some(handle);
    }

    /// Stop the detector and wait for the thread to exit.
    pub fn stop_cycle_detection(&self) {
        self.detection_enabled.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detection_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// One detection pass: abort the youngest member of every cycle in the
    /// wait-for graph and wake all waiters so victims unwind.
    pub fn detect_deadlocks(&self) {
        let (mut graph, txns) = self.build_graph();
        loop {
            let Some(victim_id) = graph.has_cycle() else {
                break;
            };
            log::warn!("deadlock: aborting youngest transaction {}", victim_id);
            if let Some(victim) = txns.get(&victim_id) {
                victim.set_state(TransactionState::Aborted);
            }
            graph.remove_txn(victim_id);
            self.broadcast_all_queues();
        }
    }

    /// Snapshot of the current wait-for graph, for inspection.
    pub fn waits_for_graph(&self) -> WaitsForGraph {
        self.build_graph().0
    }

    fn build_graph(&self) -> (WaitsForGraph, HashMap<TxnId, Arc<Transaction>>) {
        let mut graph = WaitsForGraph::new();
        let mut txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();

        for queue in self.all_queues() {
            let inner = queue.inner.lock();
            for waiter in inner.requests.iter().filter(|r| !r.granted) {
                if waiter.txn.state() == TransactionState::Aborted {
                    continue;
                }
                for holder in inner.requests.iter().filter(|r| r.granted) {
                    if holder.txn.id() != waiter.txn.id()
                        && !compatible(holder.mode, waiter.mode)
                    {
                        graph.add_edge(waiter.txn.id(), holder.txn.id());
                        txns.insert(waiter.txn.id(), waiter.txn.clone());
                        txns.insert(holder.txn.id(), holder.txn.clone());
                    }
                }
            }
        }
        (graph, txns)
    }

    fn all_queues(&self) -> Vec<Arc<LockRequestQueue>> {
        let mut queues: Vec<Arc<LockRequestQueue>> =
            self.table_lock_map.lock().values().cloned().collect();
        queues.extend(self.row_lock_map.lock().values().cloned());
        queues
    }

    fn broadcast_all_queues(&self) {
        for queue in self.all_queues() {
            // Take the queue latch so a waiter between its state check and
            // its wait cannot miss the wakeup.
            let _inner = queue.inner.lock();
            queue.cv.notify_all();
        }
    }

    /// Shared grant path for table and row requests: enqueue (upgrades jump
    /// ahead of waiters), then wait until every earlier request is granted
    /// and compatible.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<Rid>,
        queue: &Arc<LockRequestQueue>,
        mut inner: MutexGuard<'_, QueueInner>,
        upgrade: Option<LockMode>,
    ) -> Result<bool, TransactionAbort> {
        let txn_id = txn.id();

        if let Some(old_mode) = upgrade {
            if inner.upgrading.is_some_and(|id| id != txn_id) {
                drop(inner);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            inner.upgrading = Some(txn_id);
            Self::remove_request(&mut inner, txn_id);
            {
                let mut sets = txn.lock_sets();
                match rid {
                    Some(rid) => sets.remove_row(old_mode, oid, rid),
                    None => sets.remove_table(old_mode, oid),
                }
            }
            // The upgraded request jumps ahead of every waiting request.
            let position = inner
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(inner.requests.len());
            inner.requests.insert(
                position,
                LockRequest {
                    txn: txn.clone(),
                    mode,
                    granted: false,
                },
            );
        } else {
            inner.requests.push_back(LockRequest {
                txn: txn.clone(),
                mode,
                granted: false,
            });
        }

        loop {
            if txn.state() == TransactionState::Aborted {
                // Deadlock victim (or externally aborted): withdraw and
                // propagate the abort.
                Self::remove_request(&mut inner, txn_id);
                if inner.upgrading == Some(txn_id) {
                    inner.upgrading = None;
                }
                queue.cv.notify_all();
                return Err(TransactionAbort::new(txn_id, AbortReason::Deadlock));
            }
            if Self::grantable(&inner.requests, txn_id, mode) {
                break;
            }
            log::debug!("txn {} waiting for {:?} lock", txn_id, mode);
            queue.cv.wait(&mut inner);
        }

        if inner.upgrading == Some(txn_id) {
            inner.upgrading = None;
        }
        let request = inner
            .requests
            .iter_mut()
            .find(|r| r.txn.id() == txn_id)
            .expect("request stays queued until granted");
        request.granted = true;
        {
            let mut sets = txn.lock_sets();
            match rid {
                Some(rid) => sets.insert_row(mode, oid, rid),
                None => sets.insert_table(mode, oid),
            }
        }
        queue.cv.notify_all();
        Ok(true)
    }

    /// A request is grantable when every request strictly earlier in the
    /// queue is granted and compatible with it.
    fn grantable(requests: &VecDeque<LockRequest>, txn_id: TxnId, mode: LockMode) -> bool {
        for request in requests {
            if request.txn.id() == txn_id {
                return true;
            }
            if !request.granted || !compatible(request.mode, mode) {
                return false;
            }
        }
        false
    }

    fn remove_request(inner: &mut QueueInner, txn_id: TxnId) {
        if let Some(position) = inner.requests.iter().position(|r| r.txn.id() == txn_id) {
            inner.requests.remove(position);
        }
    }

    /// Admission rules by isolation level and 2PL phase.
    fn check_admission(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        is_row: bool,
    ) -> Result<(), TransactionAbort> {
        if is_row && mode.is_intention() {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        let state = txn.state();
        if state == TransactionState::Shrinking
            && matches!(mode, LockMode::Exclusive | LockMode::IntentionExclusive)
        {
            return Err(self.abort(txn, AbortReason::LockOnShrinking));
        }
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared
                        | LockMode::IntentionShared
                        | LockMode::SharedIntentionExclusive
                ) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, LockMode::IntentionShared | LockMode::Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// A row S lock needs at least intention-shared coverage on the table
    /// (any table lock dominates it); a row X lock needs IX, SIX, or X.
    fn check_row_hierarchy(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionAbort> {
        let table_mode = txn.lock_sets().table_lock_mode(oid);
        let covered = match mode {
            LockMode::Exclusive => matches!(
                table_mode,
                Some(
                    LockMode::IntentionExclusive
                        | LockMode::SharedIntentionExclusive
                        | LockMode::Exclusive
                )
            ),
            LockMode::Shared => table_mode.is_some(),
            _ => unreachable!("intention modes rejected before the hierarchy check"),
        };
        if covered {
            Ok(())
        } else {
            Err(self.abort(txn, AbortReason::TableLockNotPresent))
        }
    }

    /// Is this a no-op, an upgrade, or a fresh request?
    fn classify(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Option<Rid>,
    ) -> Result<Classification, TransactionAbort> {
        let held = {
            let sets = txn.lock_sets();
            match rid {
                Some(rid) => sets.row_lock_mode(oid, rid),
                None => sets.table_lock_mode(oid),
            }
        };
        match held {
            None => Ok(Classification::Fresh),
            Some(current) if current == mode => Ok(Classification::AlreadyHeld),
            Some(current) if upgrade_allowed(current, mode) => {
                Ok(Classification::Upgrade(current))
            }
            Some(_) => Err(self.abort(txn, AbortReason::IncompatibleUpgrade)),
        }
    }

    /// The first unlock of a "strict" mode moves GROWING to SHRINKING:
    /// S or X under REPEATABLE_READ, X otherwise.
    fn update_state_on_unlock(&self, txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let strict = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if strict {
            log::debug!("txn {} enters SHRINKING", txn.id());
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        txn.set_state(TransactionState::Aborted);
        TransactionAbort::new(txn.id(), reason)
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.detection_enabled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [
            IntentionShared,
            IntentionExclusive,
            Shared,
            SharedIntentionExclusive,
            Exclusive,
        ];
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, held) in modes.iter().enumerate() {
            for (j, requested) in modes.iter().enumerate() {
                assert_eq!(
                    compatible(*held, *requested),
                    expected[i][j],
                    "held {:?}, requested {:?}",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_upgrade_transitions() {
        use LockMode::*;
        assert!(upgrade_allowed(IntentionShared, Exclusive));
        assert!(upgrade_allowed(IntentionShared, Shared));
        assert!(upgrade_allowed(Shared, Exclusive));
        assert!(upgrade_allowed(Shared, SharedIntentionExclusive));
        assert!(upgrade_allowed(IntentionExclusive, Exclusive));
        assert!(upgrade_allowed(SharedIntentionExclusive, Exclusive));

        assert!(!upgrade_allowed(Exclusive, Shared));
        assert!(!upgrade_allowed(Shared, IntentionShared));
        assert!(!upgrade_allowed(SharedIntentionExclusive, Shared));
    }
}
