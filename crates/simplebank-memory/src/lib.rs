//! In-memory storage backend.
//!
//! Behaves like a row-locking SQL database under read committed isolation:
//! writes are staged per transaction and published on commit, balance
//! adjustments take an exclusive row lock held until the transaction ends,
//! and lock cycles are reported as `StorageError::Deadlock`.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

use parking_lot::RwLock;
use time::OffsetDateTime;

use simplebank_core::{
    Account, AddAccountBalanceParams, Context, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Database, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Queries, StorageError, Transaction, Transfer,
};

mod lock;

use lock::{LockManager, TxId};

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

pub struct InMemoryStorage {
    tables: RwLock<Tables>,
    locks: LockManager,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    tx_counter: AtomicU64,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            locks: LockManager::default(),
            account_seq: AtomicI64::new(1),
            entry_seq: AtomicI64::new(1),
            transfer_seq: AtomicI64::new(1),
            tx_counter: AtomicU64::new(1),
        }
    }
}

impl Database for InMemoryStorage {
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction + '_>, StorageError> {
        ctx.check()?;
        let id = self.tx_counter.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(tx_id = id, "In-memory transaction started");
        Ok(Box::new(MemoryTransaction {
            storage: self,
            id,
            accounts: BTreeMap::new(),
            entries: BTreeMap::new(),
            transfers: BTreeMap::new(),
            held: Vec::new(),
            done: false,
        }))
    }
}

/// Uncommitted writes of one transaction plus the row locks it holds.
pub struct MemoryTransaction<'a> {
    storage: &'a InMemoryStorage,
    id: TxId,
    /// Rows this transaction created or locked, with their staged values.
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    held: Vec<i64>,
    done: bool,
}

impl MemoryTransaction<'_> {
    fn lock_account(&mut self, ctx: &Context, id: i64) -> Result<(), StorageError> {
        if self.held.contains(&id) {
            return Ok(());
        }
        self.storage.locks.acquire(ctx, self.id, id)?;
        self.held.push(id);
        Ok(())
    }

    fn visible_account(&self, id: i64) -> Option<Account> {
        match self.accounts.get(&id) {
            Some(account) => Some(account.clone()),
            None => self.storage.tables.read().accounts.get(&id).cloned(),
        }
    }

    fn account_exists(&self, id: i64) -> bool {
        self.accounts.contains_key(&id) || self.storage.tables.read().accounts.contains_key(&id)
    }

    /// Locks the row, then stages its latest committed value.
    fn lock_and_stage(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        // Accounts are never deleted, so existence checked before locking
        // still holds afterwards.
        if !self.account_exists(id) {
            return Err(StorageError::AccountNotFound(id));
        }
        self.lock_account(ctx, id)?;
        let account = self
            .visible_account(id)
            .ok_or(StorageError::AccountNotFound(id))?;
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn release(&mut self) {
        if !self.done {
            self.storage.locks.release_all(self.id, &self.held);
            self.held.clear();
            self.done = true;
        }
    }
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

impl Queries for MemoryTransaction<'_> {
    fn create_account(&mut self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, StorageError> {
        ctx.check()?;
        let id = self.storage.account_seq.fetch_add(1, Ordering::SeqCst);
        self.lock_account(ctx, id)?;
        let account = Account {
            id,
            owner: params.owner.clone(),
            balance: params.balance,
            currency: params.currency.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    fn get_account(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        ctx.check()?;
        self.visible_account(id)
            .ok_or(StorageError::AccountNotFound(id))
    }

    fn get_account_for_update(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        ctx.check()?;
        self.lock_and_stage(ctx, id)
    }

    fn list_accounts(&mut self, ctx: &Context, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        ctx.check()?;
        let mut merged = self.storage.tables.read().accounts.clone();
        merged.extend(self.accounts.iter().map(|(id, a)| (*id, a.clone())));
        Ok(page(merged.into_values(), params.limit, params.offset))
    }

    fn add_account_balance(&mut self, ctx: &Context, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        ctx.check()?;
        let mut account = self.lock_and_stage(ctx, params.id)?;
        account.balance = account
            .balance
            .checked_add(params.amount)
            .ok_or(StorageError::BalanceOverflow(params.id))?;
        self.accounts.insert(params.id, account.clone());
        Ok(account)
    }

    fn create_entry(&mut self, ctx: &Context, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        ctx.check()?;
        if !self.account_exists(params.account_id) {
            return Err(StorageError::AccountNotFound(params.account_id));
        }
        let entry = Entry {
            id: self.storage.entry_seq.fetch_add(1, Ordering::SeqCst),
            account_id: params.account_id,
            amount: params.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    fn get_entry(&mut self, ctx: &Context, id: i64) -> Result<Entry, StorageError> {
        ctx.check()?;
        if let Some(entry) = self.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.storage
            .tables
            .read()
            .entries
            .get(&id)
            .cloned()
            .ok_or(StorageError::EntryNotFound(id))
    }

    fn list_entries(&mut self, ctx: &Context, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        ctx.check()?;
        let mut merged: BTreeMap<i64, Entry> = self
            .storage
            .tables
            .read()
            .entries
            .values()
            .filter(|e| e.account_id == params.account_id)
            .map(|e| (e.id, e.clone()))
            .collect();
        merged.extend(
            self.entries
                .values()
                .filter(|e| e.account_id == params.account_id)
                .map(|e| (e.id, e.clone())),
        );
        Ok(page(merged.into_values(), params.limit, params.offset))
    }

    fn create_transfer(&mut self, ctx: &Context, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        ctx.check()?;
        for account_id in [params.from_account_id, params.to_account_id] {
            if !self.account_exists(account_id) {
                return Err(StorageError::AccountNotFound(account_id));
            }
        }
        let transfer = Transfer {
            id: self.storage.transfer_seq.fetch_add(1, Ordering::SeqCst),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: OffsetDateTime::now_utc(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    fn get_transfer(&mut self, ctx: &Context, id: i64) -> Result<Transfer, StorageError> {
        ctx.check()?;
        if let Some(transfer) = self.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.storage
            .tables
            .read()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(StorageError::TransferNotFound(id))
    }

    fn list_transfers(&mut self, ctx: &Context, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        ctx.check()?;
        let matches = |t: &&Transfer| {
            t.from_account_id == params.from_account_id || t.to_account_id == params.to_account_id
        };
        let mut merged: BTreeMap<i64, Transfer> = self
            .storage
            .tables
            .read()
            .transfers
            .values()
            .filter(matches)
            .map(|t| (t.id, t.clone()))
            .collect();
        merged.extend(self.transfers.values().filter(matches).map(|t| (t.id, t.clone())));
        Ok(page(merged.into_values(), params.limit, params.offset))
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if self.done {
            return Err(StorageError::NoActiveTransaction);
        }
        let storage = self.storage;
        {
            let mut tables = storage.tables.write();
            tables.accounts.append(&mut self.accounts);
            tables.entries.append(&mut self.entries);
            tables.transfers.append(&mut self.transfers);
        }
        self.release();
        tracing::trace!(tx_id = self.id, "In-memory transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        if self.done {
            return Err(StorageError::NoActiveTransaction);
        }
        self.release();
        tracing::trace!(tx_id = self.id, "In-memory transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryTransaction<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
