use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use simplebank_core::{Context, StorageError};

pub(crate) type TxId = u64;

/// How long a waiter sleeps before re-checking its context for cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// Exclusive row locks on accounts, held until the owning transaction ends.
#[derive(Default)]
pub(crate) struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

#[derive(Default)]
struct LockTable {
    owners: HashMap<i64, TxId>,
    /// Account each blocked transaction is waiting for.
    waiting: HashMap<TxId, i64>,
}

impl LockTable {
    /// Follows the wait-for chain starting at `from` and reports whether it
    /// reaches `target`.
    fn waits_for(&self, from: TxId, target: TxId) -> bool {
        let mut current = from;
        for _ in 0..=self.waiting.len() {
            if current == target {
                return true;
            }
            let Some(account_id) = self.waiting.get(&current) else {
                return false;
            };
            let Some(&owner) = self.owners.get(account_id) else {
                return false;
            };
            current = owner;
        }
        false
    }
}

impl LockManager {
    /// Blocks until `tx` owns the lock on `account_id`.
    ///
    /// Fails with `Deadlock` instead of waiting when the current owner is
    /// itself (transitively) waiting for `tx`, and with the context error once
    /// the context is cancelled or past its deadline.
    pub(crate) fn acquire(&self, ctx: &Context, tx: TxId, account_id: i64) -> Result<(), StorageError> {
        let mut table = self.table.lock();
        loop {
            let owner = match table.owners.get(&account_id) {
                None => {
                    table.owners.insert(account_id, tx);
                    table.waiting.remove(&tx);
                    return Ok(());
                }
                Some(&owner) if owner == tx => {
                    table.waiting.remove(&tx);
                    return Ok(());
                }
                Some(&owner) => owner,
            };

            if table.waits_for(owner, tx) {
                table.waiting.remove(&tx);
                tracing::debug!(tx, account_id, owner, "Deadlock detected");
                return Err(StorageError::Deadlock(format!(
                    "transaction {} waits for account {} locked by transaction {}",
                    tx, account_id, owner
                )));
            }

            if let Err(e) = ctx.check() {
                table.waiting.remove(&tx);
                return Err(e);
            }

            table.waiting.insert(tx, account_id);
            let slice_end = Instant::now() + WAIT_SLICE;
            let until = match ctx.deadline() {
                Some(deadline) => deadline.min(slice_end),
                None => slice_end,
            };
            self.released.wait_until(&mut table, until);
        }
    }

    pub(crate) fn release_all(&self, tx: TxId, account_ids: &[i64]) {
        let mut table = self.table.lock();
        for account_id in account_ids {
            if table.owners.get(account_id) == Some(&tx) {
                table.owners.remove(account_id);
            }
        }
        table.waiting.remove(&tx);
        drop(table);
        self.released.notify_all();
    }
}
