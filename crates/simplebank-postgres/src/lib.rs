//! PostgreSQL storage backend.
//!
//! Each transaction runs on its own pooled connection, so transfers over
//! disjoint accounts proceed in parallel and conflicting ones queue on row
//! locks inside the server. Cancelling the transaction's context cancels
//! whatever statement the connection is running.

use std::time::{Duration, Instant};

use postgres::{error::SqlState, NoTls, Row};
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;

use simplebank_core::{
    Account, AddAccountBalanceParams, CancelHook, Context, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Database, Entry, ListAccountsParams, ListEntriesParams,
    ListTransfersParams, Queries, StorageError, Transaction, Transfer,
};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
const CHECKOUT_SLICE: Duration = Duration::from_millis(50);

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

type Manager = PostgresConnectionManager<NoTls>;

pub struct PostgresStorage {
    pool: r2d2::Pool<Manager>,
    connection_timeout: Duration,
}

impl PostgresStorage {
    pub fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_max_connections(connection_string, DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_max_connections(connection_string: &str, max_connections: u32) -> Result<Self, StorageError> {
        let config: postgres::Config = connection_string.parse().map_err(map_pg_error)?;
        Self::from_config(config, max_connections)
    }

    /// Opens a pool of at most `max_connections` connections and creates the
    /// schema if needed.
    pub fn from_config(config: postgres::Config, max_connections: u32) -> Result<Self, StorageError> {
        let pool = r2d2::Pool::builder()
            .max_size(max_connections.max(1))
            .min_idle(Some(1))
            .connection_timeout(DEFAULT_CONNECTION_TIMEOUT)
            .build(PostgresConnectionManager::new(config, NoTls))
            .map_err(pool_error)?;
        let storage = Self {
            pool,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        };
        storage.init_schema()?;
        tracing::debug!(max_connections, "PostgreSQL pool ready");
        Ok(storage)
    }

    /// Waits for a free connection in short slices so that a cancelled or
    /// expired context stops the wait.
    fn checkout(&self, ctx: &Context) -> Result<PooledConnection<Manager>, StorageError> {
        let limit = Instant::now() + self.connection_timeout;
        loop {
            ctx.check()?;
            let mut slice = CHECKOUT_SLICE.min(limit.saturating_duration_since(Instant::now()));
            if let Some(remaining) = ctx.remaining() {
                slice = slice.min(remaining);
            }
            match self.pool.get_timeout(slice.max(Duration::from_millis(1))) {
                Ok(conn) => return Ok(conn),
                Err(e) if Instant::now() >= limit => return Err(pool_error(e)),
                Err(_) => {}
            }
        }
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut client = self.checkout(&Context::background())?;
        client
            .batch_execute(
                "
            CREATE TABLE IF NOT EXISTS accounts (
                id BIGSERIAL PRIMARY KEY,
                owner VARCHAR NOT NULL,
                balance BIGINT NOT NULL,
                currency VARCHAR NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS entries (
                id BIGSERIAL PRIMARY KEY,
                account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE TABLE IF NOT EXISTS transfers (
                id BIGSERIAL PRIMARY KEY,
                from_account_id BIGINT NOT NULL REFERENCES accounts(id),
                to_account_id BIGINT NOT NULL REFERENCES accounts(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            );

            CREATE INDEX IF NOT EXISTS idx_pg_accounts_owner ON accounts(owner);
            CREATE INDEX IF NOT EXISTS idx_pg_entries_account ON entries(account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_from ON transfers(from_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_to ON transfers(to_account_id);
            CREATE INDEX IF NOT EXISTS idx_pg_transfers_pair ON transfers(from_account_id, to_account_id);
            ",
            )
            .map_err(map_pg_error)?;
        Ok(())
    }
}

impl Database for PostgresStorage {
    fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction + '_>, StorageError> {
        let mut conn = self.checkout(ctx)?;
        conn.batch_execute("BEGIN").map_err(map_pg_error)?;

        // The blocking client cannot cancel from inside the async runtime,
        // so the cancel request goes out on its own thread.
        let token = conn.cancel_token();
        let cancel = ctx.on_cancel(move || {
            std::thread::spawn(move || {
                if let Err(e) = token.cancel_query(NoTls) {
                    tracing::warn!(error = %e, "PostgreSQL cancel request failed");
                }
            });
        });

        let mut tx = PgTransaction {
            conn,
            cancel: Some(cancel),
            done: false,
        };
        if let Some(remaining) = ctx.remaining() {
            // Bound server-side waits by what is left of the deadline.
            let millis = remaining.as_millis().max(1);
            tx.conn
                .batch_execute(&format!(
                    "SET LOCAL statement_timeout = {millis}; SET LOCAL lock_timeout = {millis};"
                ))
                .map_err(|e| query_error(ctx, e))?;
        }
        tracing::trace!("PostgreSQL transaction started");
        Ok(Box::new(tx))
    }
}

pub struct PgTransaction {
    conn: PooledConnection<Manager>,
    cancel: Option<CancelHook>,
    done: bool,
}

fn pool_error(e: r2d2::Error) -> StorageError {
    StorageError::Other(format!("connection pool: {e}"))
}

fn map_pg_error(e: postgres::Error) -> StorageError {
    match e.code() {
        Some(code) if *code == SqlState::T_R_DEADLOCK_DETECTED => StorageError::Deadlock(
            e.as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string()),
        ),
        Some(code) if *code == SqlState::QUERY_CANCELED || *code == SqlState::LOCK_NOT_AVAILABLE => {
            StorageError::DeadlineExceeded
        }
        _ => StorageError::Other(e.to_string()),
    }
}

/// A statement cancelled on behalf of a cancelled context is a cancellation,
/// not a timeout.
fn query_error(ctx: &Context, e: postgres::Error) -> StorageError {
    if ctx.is_cancelled() && e.code() == Some(&SqlState::QUERY_CANCELED) {
        return StorageError::Cancelled;
    }
    map_pg_error(e)
}

fn violates_foreign_key(e: &postgres::Error, constraint: &str) -> bool {
    e.as_db_error().map_or(false, |db| {
        *db.code() == SqlState::FOREIGN_KEY_VIOLATION && db.constraint() == Some(constraint)
    })
}

fn is_out_of_range(e: &postgres::Error) -> bool {
    e.code() == Some(&SqlState::NUMERIC_VALUE_OUT_OF_RANGE)
}

fn account_from_row(row: &Row) -> Result<Account, StorageError> {
    Ok(Account {
        id: row.try_get(0).map_err(map_pg_error)?,
        owner: row.try_get(1).map_err(map_pg_error)?,
        balance: row.try_get(2).map_err(map_pg_error)?,
        currency: row.try_get(3).map_err(map_pg_error)?,
        created_at: row.try_get(4).map_err(map_pg_error)?,
    })
}

fn entry_from_row(row: &Row) -> Result<Entry, StorageError> {
    Ok(Entry {
        id: row.try_get(0).map_err(map_pg_error)?,
        account_id: row.try_get(1).map_err(map_pg_error)?,
        amount: row.try_get(2).map_err(map_pg_error)?,
        created_at: row.try_get(3).map_err(map_pg_error)?,
    })
}

fn transfer_from_row(row: &Row) -> Result<Transfer, StorageError> {
    Ok(Transfer {
        id: row.try_get(0).map_err(map_pg_error)?,
        from_account_id: row.try_get(1).map_err(map_pg_error)?,
        to_account_id: row.try_get(2).map_err(map_pg_error)?,
        amount: row.try_get(3).map_err(map_pg_error)?,
        created_at: row.try_get(4).map_err(map_pg_error)?,
    })
}

impl PgTransaction {
    fn finish(&mut self, statement: &str) -> Result<(), StorageError> {
        if self.done {
            return Err(StorageError::NoActiveTransaction);
        }
        self.done = true;
        drop(self.cancel.take());
        self.conn.batch_execute(statement).map_err(map_pg_error)
    }
}

impl Queries for PgTransaction {
    fn create_account(&mut self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_one(
                &format!(
                    "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                &[&params.owner, &params.balance, &params.currency],
            )
            .map_err(|e| query_error(ctx, e))?;
        account_from_row(&row)
    }

    fn get_account(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_opt(
                &format!("SELECT {} FROM accounts WHERE id = $1", ACCOUNT_COLUMNS),
                &[&id],
            )
            .map_err(|e| query_error(ctx, e))?
            .ok_or(StorageError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    fn get_account_for_update(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_opt(
                &format!(
                    "SELECT {} FROM accounts WHERE id = $1 FOR NO KEY UPDATE",
                    ACCOUNT_COLUMNS
                ),
                &[&id],
            )
            .map_err(|e| query_error(ctx, e))?
            .ok_or(StorageError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    fn list_accounts(&mut self, ctx: &Context, params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
        ctx.check()?;
        self.conn
            .query(
                &format!(
                    "SELECT {} FROM accounts ORDER BY id LIMIT $1 OFFSET $2",
                    ACCOUNT_COLUMNS
                ),
                &[&params.limit, &params.offset],
            )
            .map_err(|e| query_error(ctx, e))?
            .iter()
            .map(account_from_row)
            .collect()
    }

    fn add_account_balance(&mut self, ctx: &Context, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_opt(
                &format!(
                    "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {}",
                    ACCOUNT_COLUMNS
                ),
                &[&params.id, &params.amount],
            )
            .map_err(|e| {
                if is_out_of_range(&e) {
                    StorageError::BalanceOverflow(params.id)
                } else {
                    query_error(ctx, e)
                }
            })?
            .ok_or(StorageError::AccountNotFound(params.id))?;
        account_from_row(&row)
    }

    fn create_entry(&mut self, ctx: &Context, params: &CreateEntryParams) -> Result<Entry, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_one(
                &format!(
                    "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
                    ENTRY_COLUMNS
                ),
                &[&params.account_id, &params.amount],
            )
            .map_err(|e| {
                if violates_foreign_key(&e, "entries_account_id_fkey") {
                    StorageError::AccountNotFound(params.account_id)
                } else {
                    query_error(ctx, e)
                }
            })?;
        entry_from_row(&row)
    }

    fn get_entry(&mut self, ctx: &Context, id: i64) -> Result<Entry, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_opt(
                &format!("SELECT {} FROM entries WHERE id = $1", ENTRY_COLUMNS),
                &[&id],
            )
            .map_err(|e| query_error(ctx, e))?
            .ok_or(StorageError::EntryNotFound(id))?;
        entry_from_row(&row)
    }

    fn list_entries(&mut self, ctx: &Context, params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
        ctx.check()?;
        self.conn
            .query(
                &format!(
                    "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
                    ENTRY_COLUMNS
                ),
                &[&params.account_id, &params.limit, &params.offset],
            )
            .map_err(|e| query_error(ctx, e))?
            .iter()
            .map(entry_from_row)
            .collect()
    }

    fn create_transfer(&mut self, ctx: &Context, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_one(
                &format!(
                    "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3)
                     RETURNING {}",
                    TRANSFER_COLUMNS
                ),
                &[&params.from_account_id, &params.to_account_id, &params.amount],
            )
            .map_err(|e| {
                if violates_foreign_key(&e, "transfers_from_account_id_fkey") {
                    StorageError::AccountNotFound(params.from_account_id)
                } else if violates_foreign_key(&e, "transfers_to_account_id_fkey") {
                    StorageError::AccountNotFound(params.to_account_id)
                } else {
                    query_error(ctx, e)
                }
            })?;
        transfer_from_row(&row)
    }

    fn get_transfer(&mut self, ctx: &Context, id: i64) -> Result<Transfer, StorageError> {
        ctx.check()?;
        let row = self
            .conn
            .query_opt(
                &format!("SELECT {} FROM transfers WHERE id = $1", TRANSFER_COLUMNS),
                &[&id],
            )
            .map_err(|e| query_error(ctx, e))?
            .ok_or(StorageError::TransferNotFound(id))?;
        transfer_from_row(&row)
    }

    fn list_transfers(&mut self, ctx: &Context, params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
        ctx.check()?;
        self.conn
            .query(
                &format!(
                    "SELECT {} FROM transfers
                     WHERE from_account_id = $1 OR to_account_id = $2
                     ORDER BY id LIMIT $3 OFFSET $4",
                    TRANSFER_COLUMNS
                ),
                &[
                    &params.from_account_id,
                    &params.to_account_id,
                    &params.limit,
                    &params.offset,
                ],
            )
            .map_err(|e| query_error(ctx, e))?
            .iter()
            .map(transfer_from_row)
            .collect()
    }
}

impl Transaction for PgTransaction {
    fn queries(&mut self) -> &mut dyn Queries {
        self
    }

    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("COMMIT")?;
        tracing::trace!("PostgreSQL transaction committed");
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        self.finish("ROLLBACK")?;
        tracing::trace!("PostgreSQL transaction rolled back");
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        drop(self.cancel.take());
        if !self.done {
            if let Err(e) = self.conn.batch_execute("ROLLBACK") {
                tracing::warn!(error = %e, "PostgreSQL rollback of abandoned transaction failed");
            }
        }
    }
}
