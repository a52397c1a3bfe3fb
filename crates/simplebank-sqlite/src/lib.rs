//! SQLite storage backend.
//!
//! A single connection serves every transaction; SQLite allows one writer at a
//! time, so transactions queue on the connection and run `BEGIN IMMEDIATE`.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::{ffi, params, Connection, ErrorCode, Row};
use time::OffsetDateTime;

use simplebank_core::{
    Account, AddAccountBalanceParams, Context, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Database, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Queries, StorageError, Transaction, Transfer,
};

/// How long `begin` waits for the connection before re-checking its context.
const WAIT_SLICE: Duration = Duration::from_millis(10);

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(other)?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(other)?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                balance INTEGER NOT NULL CHECK (typeof(balance) = 'integer'),
                currency TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (account_id) REFERENCES accounts(id)
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_account_id INTEGER NOT NULL,
                to_account_id INTEGER NOT NULL,
                amount INTEGER NOT NULL CHECK (amount > 0),
                created_at TEXT NOT NULL,
                FOREIGN KEY (from_account_id) REFERENCES accounts(id),
                FOREIGN KEY (to_account_id) REFERENCES accounts(id)
            );

            CREATE INDEX IF NOT EXISTS idx_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_transfers_pair ON transfers(from_account_id, to_account_id);
            ",
        )
        .map_err(other)?;
        Ok(())
    }

    fn acquire(&self, ctx: &Context) -> Result<MutexGuard<'_, Connection>, StorageError> {
        loop {
            ctx.check()?;
            let slice = match ctx.remaining() {
                Some(remaining) => remaining.min(WAIT_SLICE),
                None => WAIT_SLICE,
            };
            if let Some(conn) = self.conn.try_lock_for(slice) {
                return Ok(conn);
            }
        }
    }
}

impl Database for SqliteStorage {
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let conn = self.acquire(ctx)?;
        conn.execute_batch("BEGIN IMMEDIATE").map_err(other)?;
        tracing::trace!("SQLite transaction started");
        Ok(Box::new(SqliteTransaction { conn, done: false }))
    }
}

pub struct SqliteTransaction<'a> {
    conn: MutexGuard<'a, Connection>,
    done: bool,
}

fn other(e: rusqlite::Error) -> StorageError {
    StorageError::Other(e.to_string())
}

fn or_not_found(e: rusqlite::Error, not_found: StorageError) -> StorageError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => not_found,
        _ => other(e),
    }
}

fn is_check_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == ffi::SQLITE_CONSTRAINT_CHECK
    )
}

fn account_from_row(row: &Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        owner: row.get(1)?,
        balance: row.get(2)?,
        currency: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn entry_from_row(row: &Row) -> rusqlite::Result<Entry> {
    Ok(Entry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn transfer_from_row(row: &Row) -> rusqlite::Result<Transfer> {
    Ok(Transfer {
        id: row.get(0)?,
        from_account_id: row.get(1)?,
        to_account_id: row.get(2)?,
        amount: row.get(3)?,
        created_at: row.get(4)?,
    })
}

impl SqliteTransaction<'_> {
    fn ensure_account(&self, id: i64) -> Result<(), StorageError> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM accounts WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(other)?;
        if !exists {
            return Err(StorageError::AccountNotFound(id));
        }
        Ok(())
    }

    fn finish(&mut self, statement: &str) -> Result<(), StorageError> {
        if self.done {
            return Err(StorageError::NoActiveTransaction);
        }
        self.done = true;
        if let Err(e) = self.conn.execute_batch(statement) {
            // A failed COMMIT can leave the transaction open on the shared
            // connection.
            if !self.conn.is_autocommit() {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %rollback, "SQLite rollback after failed {} failed", statement);
                }
            }
            return Err(other(e));
        }
        Ok(())
    }
}

impl Queries for SqliteTransaction<'_> {
    fn create_account(&mut self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, StorageError> {
        ctx.check()?;
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency, created_at) VALUES (?1, ?2, ?3, ?4)
                     RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.owner, params.balance, params.currency, OffsetDateTime::now_utc()],
                account_from_row,
            )
            .map_err(other)
    }

    fn get_account(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        ctx.check()?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                params![id],
                account_from_row,
            )
            .map_err(|e| or_not_found(e, StorageError::AccountNotFound(id)))
    }

    fn get_account_for_update(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        // BEGIN IMMEDIATE already holds the database write lock.
        self.get_account(ctx, id)
    }

    fn list_accounts(&mut self, ctx: &Context, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        ctx.check()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM accounts ORDER BY id LIMIT ?1 OFFSET ?2",
                ACCOUNT_COLUMNS
            ))
            .map_err(other)?;
        let rows = stmt
            .query_map(params![params.limit, params.offset], account_from_row)
            .map_err(other)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(other)
    }

    fn add_account_balance(&mut self, ctx: &Context, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        ctx.check()?;
        self.conn
            .query_row(
                &format!(
                    "UPDATE accounts SET balance = balance + ?2 WHERE id = ?1 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                params![params.id, params.amount],
                account_from_row,
            )
            .map_err(|e| {
                if is_check_violation(&e) {
                    StorageError::BalanceOverflow(params.id)
                } else {
                    or_not_found(e, StorageError::AccountNotFound(params.id))
                }
            })
    }

    fn create_entry(&mut self, ctx: &Context, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        ctx.check()?;
        self.ensure_account(params.account_id)?;
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO entries (account_id, amount, created_at) VALUES (?1, ?2, ?3)
                     RETURNING {}",
                    ENTRY_COLUMNS
                ),
                params![params.account_id, params.amount, OffsetDateTime::now_utc()],
                entry_from_row,
            )
            .map_err(other)
    }

    fn get_entry(&mut self, ctx: &Context, id: i64) -> Result<Entry, StorageError> {
        ctx.check()?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .map_err(|e| or_not_found(e, StorageError::EntryNotFound(id)))
    }

    fn list_entries(&mut self, ctx: &Context, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        ctx.check()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM entries WHERE account_id = ?1 ORDER BY id LIMIT ?2 OFFSET ?3",
                ENTRY_COLUMNS
            ))
            .map_err(other)?;
        let rows = stmt
            .query_map(
                params![params.account_id, params.limit, params.offset],
                entry_from_row,
            )
            .map_err(other)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(other)
    }

    fn create_transfer(&mut self, ctx: &Context, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        ctx.check()?;
        self.ensure_account(params.from_account_id)?;
        self.ensure_account(params.to_account_id)?;
        self.conn
            .query_row(
                &format!(
                    "INSERT INTO transfers (from_account_id, to_account_id, amount, created_at)
                     VALUES (?1, ?2, ?3, ?4) RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                params![
                    params.from_account_id,
                    params.to_account_id,
                    params.amount,
                    OffsetDateTime::now_utc()
                ],
                transfer_from_row,
            )
            .map_err(other)
    }

    fn get_transfer(&mut self, ctx: &Context, id: i64) -> Result<Transfer, StorageError> {
        ctx.check()?;
        self.conn
            .query_row(
                &format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS),
                params![id],
                transfer_from_row,
            )
            .map_err(|e| or_not_found(e, StorageError::TransferNotFound(id)))
    }

    fn list_transfers(&mut self, ctx: &Context, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        ctx.check()?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM transfers
                 WHERE from_account_id = ?1 OR to_account_id = ?2
                 ORDER BY id LIMIT ?3 OFFSET ?4",
                TRANSFER_COLUMNS
            ))
            .map_err(other)?;
        let rows = stmt
            .query_map(
                params![
                    params.from_account_id,
                    params.to_account_id,
                    params.limit,
                    params.offset
                ],
                transfer_from_row,
            )
            .map_err(other)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(other)
    }
}

impl Transaction for SqliteTransaction<'_> {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::trace!("SQLite transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::trace!("SQLite transaction rolled back");
        Ok(())
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::warn!(error = %e, "SQLite rollback of abandoned transaction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(storage: &SqliteStorage, balances: &[i64]) -> Vec<Account> {
        let ctx = Context::background();
        let mut tx = storage.begin(&ctx).unwrap();
        let mut accounts = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            accounts.push(
                tx.queries()
                    .create_account(
                        &ctx,
                        &CreateAccountParams {
                            owner: format!("owner{}", i),
                            balance: *balance,
                            currency: "EUR".to_string(),
                        },
                    )
                    .unwrap(),
            );
        }
        tx.commit().unwrap();
        accounts
    }

    #[test]
    fn test_sqlite_add_account_balance_returns_updated_row() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let accounts = seed(&storage, &[100]);
        let ctx = Context::background();

        let mut tx = storage.begin(&ctx).unwrap();
        let updated = tx
            .queries()
            .add_account_balance(&ctx, &AddAccountBalanceParams { id: accounts[0].id, amount: -40 })
            .unwrap();
        tx.commit().unwrap();

        assert_eq!(updated.id, accounts[0].id);
        assert_eq!(updated.balance, 60);
        assert_eq!(updated.owner, accounts[0].owner);
        assert_eq!(updated.currency, "EUR");
    }

    #[test]
    fn test_sqlite_transaction_rollback() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let accounts = seed(&storage, &[100, 50]);
        let ctx = Context::background();

        let mut tx = storage.begin(&ctx).unwrap();
        let transfer = tx
            .queries()
            .create_transfer(
                &ctx,
                &CreateTransferParams {
                    from_account_id: accounts[0].id,
                    to_account_id: accounts[1].id,
                    amount: 10,
                },
            )
            .unwrap();
        tx.queries()
            .add_account_balance(&ctx, &AddAccountBalanceParams { id: accounts[0].id, amount: -10 })
            .unwrap();
        tx.rollback().unwrap();

        let mut tx = storage.begin(&ctx).unwrap();
        assert!(matches!(
            tx.queries().get_transfer(&ctx, transfer.id),
            Err(StorageError::TransferNotFound(_))
        ));
        let balance = tx.queries().get_account(&ctx, accounts[0].id).unwrap().balance;
        assert_eq!(balance, 100, "Balance should be unchanged after rollback");
    }

    #[test]
    fn test_sqlite_missing_account_is_not_found() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let accounts = seed(&storage, &[100]);
        let ctx = Context::background();
        let mut tx = storage.begin(&ctx).unwrap();
        let q = tx.queries();

        assert!(matches!(q.get_account(&ctx, 404), Err(StorageError::AccountNotFound(404))));
        assert!(matches!(
            q.add_account_balance(&ctx, &AddAccountBalanceParams { id: 404, amount: 1 }),
            Err(StorageError::AccountNotFound(404))
        ));
        assert!(matches!(
            q.create_entry(&ctx, &CreateEntryParams { account_id: 404, amount: 1 }),
            Err(StorageError::AccountNotFound(404))
        ));
        assert!(matches!(
            q.create_transfer(
                &ctx,
                &CreateTransferParams { from_account_id: 404, to_account_id: accounts[0].id, amount: 1 }
            ),
            Err(StorageError::AccountNotFound(404))
        ));
    }

    #[test]
    fn test_sqlite_balance_overflow_is_rejected() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let accounts = seed(&storage, &[i64::MAX]);
        let ctx = Context::background();
        let mut tx = storage.begin(&ctx).unwrap();

        let err = tx
            .queries()
            .add_account_balance(&ctx, &AddAccountBalanceParams { id: accounts[0].id, amount: 1 })
            .unwrap_err();
        assert!(matches!(err, StorageError::BalanceOverflow(_)), "got {:?}", err);
    }

    #[test]
    fn test_sqlite_begin_gives_up_at_deadline_while_connection_busy() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let _held = storage.begin(&Context::background()).unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(30));
        let err = storage.begin(&ctx).err().unwrap();
        assert!(matches!(err, StorageError::DeadlineExceeded));
    }

    #[test]
    fn test_sqlite_file_database_persists_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bank.db");
        let path = path.to_str().unwrap();

        let id = {
            let storage = SqliteStorage::new(path).unwrap();
            seed(&storage, &[75])[0].id
        };

        let storage = SqliteStorage::new(path).unwrap();
        let ctx = Context::background();
        let mut tx = storage.begin(&ctx).unwrap();
        let account = tx.queries().get_account(&ctx, id).unwrap();
        assert_eq!(account.balance, 75);

        let listed = tx
            .queries()
            .list_accounts(&ctx, &ListAccountsParams { limit: 10, offset: 0 })
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_sqlite_failed_commit_leaves_connection_usable() {
        let storage = SqliteStorage::new(":memory:").unwrap();
        let ctx = Context::background();

        let conn = storage.acquire(&ctx).unwrap();
        conn.execute_batch(
            "BEGIN IMMEDIATE;
             PRAGMA defer_foreign_keys = ON;
             INSERT INTO entries (account_id, amount, created_at) VALUES (999, 1, '2024-01-01');",
        )
        .unwrap();
        let tx = Box::new(SqliteTransaction { conn, done: false });
        assert!(tx.commit().is_err());

        let mut tx = storage.begin(&ctx).unwrap();
        let entries = tx
            .queries()
            .list_entries(&ctx, &ListEntriesParams { account_id: 999, limit: 10, offset: 0 })
            .unwrap();
        assert!(entries.is_empty());
    }
}
