//! Core types and traits for SimpleBank storage backends.
//!
//! This crate provides the `Queries` / `Database` / `Transaction` traits that
//! every storage backend implements, plus the `Store` that runs units of work
//! inside a transaction and performs money transfers on top of it.

pub mod context;
pub mod error;
pub mod models;
pub mod storage;
pub mod store;
pub mod transfer;

// Re-export key types at crate root for convenience
pub use context::{CancelHook, Context};
pub use error::{ErrorKind, LedgerError};
pub use models::{Account, Entry, Transfer};
pub use models::write::{
    AddAccountBalanceParams, CreateAccountParams, CreateEntryParams, CreateTransferParams,
};
pub use models::read::{ListAccountsParams, ListEntriesParams, ListTransfersParams};
pub use storage::{Database, Queries, StorageError, Transaction};
pub use store::Store;
pub use transfer::{TransferTxParams, TransferTxResult};
