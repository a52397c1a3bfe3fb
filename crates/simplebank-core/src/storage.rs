use crate::{
    context::Context,
    models::{
        read::{ListAccountsParams, ListEntriesParams, ListTransfersParams},
        write::{AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams},
        Account, Entry, Transfer,
    },
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("account not found: {0}")]
    AccountNotFound(i64),
    #[error("entry not found: {0}")]
    EntryNotFound(i64),
    #[error("transfer not found: {0}")]
    TransferNotFound(i64),
    #[error("balance overflow on account {0}")]
    BalanceOverflow(i64),
    #[error("deadlock detected: {0}")]
    Deadlock(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("no active transaction")]
    NoActiveTransaction,
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::AccountNotFound(_)
                | StorageError::EntryNotFound(_)
                | StorageError::TransferNotFound(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled | StorageError::DeadlineExceeded)
    }
}

/// Row-level ledger operations. Every call observes the context first, so a
/// cancelled or expired context fails the call without touching storage.
///
/// `add_account_balance` must be a single atomic "balance = balance + delta"
/// at the storage layer that leaves the row locked until the surrounding
/// transaction ends. The deadlock-avoidance ordering in `Store::transfer_tx`
/// relies on it.
pub trait Queries {
    fn create_account(&mut self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, StorageError>;
    fn get_account(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError>;
    fn get_account_for_update(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError>;
    fn list_accounts(&mut self, ctx: &Context, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError>;
    fn add_account_balance(&mut self, ctx: &Context, params: &AddAccountBalanceParams) -> Result<Account, StorageError>;

    fn create_entry(&mut self, ctx: &Context, params: &CreateEntryParams) -> Result<Entry, StorageError>;
    fn get_entry(&mut self, ctx: &Context, id: i64) -> Result<Entry, StorageError>;
    fn list_entries(&mut self, ctx: &Context, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError>;

    fn create_transfer(&mut self, ctx: &Context, params: &CreateTransferParams) -> Result<Transfer, StorageError>;
    fn get_transfer(&mut self, ctx: &Context, id: i64) -> Result<Transfer, StorageError>;
    fn list_transfers(&mut self, ctx: &Context, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError>;
}

/// An open database transaction. Dropping it without calling `commit` or
/// `rollback` rolls it back.
pub trait Transaction {
    /// Repository handle bound to this transaction.
    fn queries(&mut self) -> &mut dyn Queries;
    fn commit(self: Box<Self>) -> Result<(), StorageError>;
    fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Repository factory: every call to `begin` yields a fresh transaction that
/// is exclusively owned by the caller.
pub trait Database: Send + Sync {
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction + '_>, StorageError>;
}
