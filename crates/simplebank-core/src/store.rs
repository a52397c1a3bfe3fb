use std::sync::Arc;

use uuid::Uuid;

use crate::{
    context::Context,
    error::LedgerError,
    models::{
        read::{ListAccountsParams, ListEntriesParams, ListTransfersParams},
        write::CreateAccountParams,
        Account, Entry, Transfer,
    },
    storage::{Database, Queries},
};

/// Runs units of work against a `Database` inside a transaction.
pub struct Store {
    db: Arc<dyn Database>,
}

impl Store {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Executes `unit_of_work` within a database transaction.
    ///
    /// Commits when it succeeds and rolls back when it fails. A failed
    /// rollback is reported as `LedgerError::Rollback` carrying both errors.
    /// A context cancelled while the unit of work ran also rolls back.
    pub fn exec_tx<T, F>(&self, ctx: &Context, unit_of_work: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut dyn Queries) -> Result<T, LedgerError>,
    {
        let tx_id = Uuid::new_v4();
        let span = tracing::debug_span!("tx", %tx_id, label = ctx.label());
        let _enter = span.enter();

        let mut tx = self.db.begin(ctx)?;
        tracing::debug!("Transaction started");

        let result = unit_of_work(tx.queries()).and_then(|value| {
            ctx.check()?;
            Ok(value)
        });

        match result {
            Ok(value) => {
                tx.commit().map_err(LedgerError::Commit)?;
                tracing::debug!("Transaction committed");
                Ok(value)
            }
            Err(err) => match tx.rollback() {
                Ok(()) => {
                    tracing::debug!(error = %err, "Transaction rolled back");
                    Err(err)
                }
                Err(rollback) => {
                    tracing::error!(error = %err, rollback_error = %rollback, "Transaction rollback failed");
                    Err(LedgerError::Rollback {
                        cause: Box::new(err),
                        rollback,
                    })
                }
            },
        }
    }

    pub fn create_account(&self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.create_account(ctx, params)?))
    }

    pub fn get_account(&self, ctx: &Context, id: i64) -> Result<Account, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.get_account(ctx, id)?))
    }

    pub fn list_accounts(&self, ctx: &Context, params: &ListAccountsParams) -> Result<Vec<Account>, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.list_accounts(ctx, params)?))
    }

    pub fn get_entry(&self, ctx: &Context, id: i64) -> Result<Entry, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.get_entry(ctx, id)?))
    }

    pub fn list_entries(&self, ctx: &Context, params: &ListEntriesParams) -> Result<Vec<Entry>, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.list_entries(ctx, params)?))
    }

    pub fn get_transfer(&self, ctx: &Context, id: i64) -> Result<Transfer, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.get_transfer(ctx, id)?))
    }

    pub fn list_transfers(&self, ctx: &Context, params: &ListTransfersParams) -> Result<Vec<Transfer>, LedgerError> {
        self.exec_tx(ctx, |q| Ok(q.list_transfers(ctx, params)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use time::OffsetDateTime;

    use super::*;
    use crate::{
        models::write::{AddAccountBalanceParams, CreateEntryParams, CreateTransferParams},
        storage::{StorageError, Transaction},
        ErrorKind,
    };

    /// Scripted backend: records every call, fails commit or rollback on
    /// demand, and answers reads with fixed rows.
    #[derive(Default)]
    pub(crate) struct ScriptedDatabase {
        pub calls: Mutex<Vec<String>>,
        pub fail_commit: bool,
        pub fail_rollback: bool,
        pub missing_account: Option<i64>,
    }

    impl ScriptedDatabase {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().push(call);
        }
    }

    struct ScriptedTx<'a> {
        db: &'a ScriptedDatabase,
    }

    fn account(id: i64, balance: i64) -> Account {
        Account {
            id,
            owner: format!("owner{}", id),
            balance,
            currency: "USD".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    impl ScriptedTx<'_> {
        fn check_account(&self, id: i64) -> Result<(), StorageError> {
            match self.db.missing_account {
                Some(missing) if missing == id => Err(StorageError::AccountNotFound(id)),
                _ => Ok(()),
            }
        }
    }

    impl Queries for ScriptedTx<'_> {
        fn create_account(&mut self, ctx: &Context, params: &CreateAccountParams) -> Result<Account, StorageError> {
            ctx.check()?;
            self.db.record(format!("create_account {}", params.owner));
            Ok(account(1, params.balance))
        }

        fn get_account(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
            ctx.check()?;
            self.db.record(format!("get_account {}", id));
            self.check_account(id)?;
            Ok(account(id, 100))
        }

        fn get_account_for_update(&mut self, ctx: &Context, id: i64) -> Result<Account, StorageError> {
            self.get_account(ctx, id)
        }

        fn list_accounts(&mut self, ctx: &Context, _params: &ListAccountsParams) -> Result<Vec<Account>, StorageError> {
            ctx.check()?;
            Ok(vec![])
        }

        fn add_account_balance(&mut self, ctx: &Context, params: &AddAccountBalanceParams) -> Result<Account, StorageError> {
            ctx.check()?;
            self.db.record(format!("add_account_balance {} {}", params.id, params.amount));
            self.check_account(params.id)?;
            Ok(account(params.id, 100 + params.amount))
        }

        fn create_entry(&mut self, ctx: &Context, params: &CreateEntryParams) -> Result<Entry, StorageError> {
            ctx.check()?;
            self.db.record(format!("create_entry {} {}", params.account_id, params.amount));
            self.check_account(params.account_id)?;
            Ok(Entry {
                id: 1,
                account_id: params.account_id,
                amount: params.amount,
                created_at: OffsetDateTime::now_utc(),
            })
        }

        fn get_entry(&mut self, _ctx: &Context, id: i64) -> Result<Entry, StorageError> {
            Err(StorageError::EntryNotFound(id))
        }

        fn list_entries(&mut self, _ctx: &Context, _params: &ListEntriesParams) -> Result<Vec<Entry>, StorageError> {
            Ok(vec![])
        }

        fn create_transfer(&mut self, ctx: &Context, params: &CreateTransferParams) -> Result<Transfer, StorageError> {
            ctx.check()?;
            self.db.record(format!(
                "create_transfer {} {} {}",
                params.from_account_id, params.to_account_id, params.amount
            ));
            self.check_account(params.from_account_id)?;
            self.check_account(params.to_account_id)?;
            Ok(Transfer {
                id: 1,
                from_account_id: params.from_account_id,
                to_account_id: params.to_account_id,
                amount: params.amount,
                created_at: OffsetDateTime::now_utc(),
            })
        }

        fn get_transfer(&mut self, _ctx: &Context, id: i64) -> Result<Transfer, StorageError> {
            Err(StorageError::TransferNotFound(id))
        }

        fn list_transfers(&mut self, _ctx: &Context, _params: &ListTransfersParams) -> Result<Vec<Transfer>, StorageError> {
            Ok(vec![])
        }
    }

    impl Transaction for ScriptedTx<'_> {
        fn queries(&mut self) -> &mut dyn Queries {
            self
        }

        fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.db.record("commit".to_string());
            if self.db.fail_commit {
                return Err(StorageError::Other("commit refused".to_string()));
            }
            Ok(())
        }

        fn rollback(self: Box<Self>) -> Result<(), StorageError> {
            self.db.record("rollback".to_string());
            if self.db.fail_rollback {
                return Err(StorageError::Other("connection reset".to_string()));
            }
            Ok(())
        }
    }

    impl Database for ScriptedDatabase {
        fn begin(&self, ctx: &Context) -> Result<Box<dyn Transaction + '_>, StorageError> {
            ctx.check()?;
            self.record("begin".to_string());
            Ok(Box::new(ScriptedTx { db: self }))
        }
    }

    fn store(db: ScriptedDatabase) -> (Arc<ScriptedDatabase>, Store) {
        let db = Arc::new(db);
        (db.clone(), Store::new(db))
    }

    #[test]
    fn test_exec_tx_commits_on_success() {
        let (db, store) = store(ScriptedDatabase::default());
        let ctx = Context::background();

        let acct = store.get_account(&ctx, 3).unwrap();

        assert_eq!(acct.id, 3);
        assert_eq!(db.calls(), vec!["begin", "get_account 3", "commit"]);
    }

    #[test]
    fn test_exec_tx_rolls_back_and_returns_original_error() {
        let (db, store) = store(ScriptedDatabase {
            missing_account: Some(9),
            ..Default::default()
        });

        let err = store.get_account(&Context::background(), 9).unwrap_err();

        assert!(matches!(err, LedgerError::Storage(StorageError::AccountNotFound(9))));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(db.calls(), vec!["begin", "get_account 9", "rollback"]);
    }

    #[test]
    fn test_exec_tx_reports_rollback_failure_with_both_errors() {
        let (_db, store) = store(ScriptedDatabase {
            missing_account: Some(9),
            fail_rollback: true,
            ..Default::default()
        });

        let err = store.get_account(&Context::background(), 9).unwrap_err();

        match &err {
            LedgerError::Rollback { cause, rollback } => {
                assert!(matches!(**cause, LedgerError::Storage(StorageError::AccountNotFound(9))));
                assert_eq!(rollback.to_string(), "connection reset");
            }
            other => panic!("Expected Rollback, got {:?}", other),
        }
        assert!(err.is_indeterminate());
    }

    #[test]
    fn test_exec_tx_surfaces_commit_error() {
        let (_db, store) = store(ScriptedDatabase {
            fail_commit: true,
            ..Default::default()
        });

        let err = store.get_account(&Context::background(), 1).unwrap_err();

        assert!(matches!(err, LedgerError::Commit(StorageError::Other(_))));
        assert!(!err.is_indeterminate());
    }

    #[test]
    fn test_exec_tx_rolls_back_when_cancelled_during_unit_of_work() {
        let (db, store) = store(ScriptedDatabase::default());
        let ctx = Context::background();

        let err = store
            .exec_tx(&ctx, |q| {
                let acct = q.get_account(&ctx, 1)?;
                ctx.cancel();
                Ok(acct)
            })
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(db.calls(), vec!["begin", "get_account 1", "rollback"]);
    }

    #[test]
    fn test_exec_tx_does_not_begin_with_cancelled_context() {
        let (db, store) = store(ScriptedDatabase::default());
        let ctx = Context::background();
        ctx.cancel();

        let err = store.get_account(&ctx, 1).unwrap_err();

        assert!(matches!(err, LedgerError::Storage(StorageError::Cancelled)));
        assert!(db.calls().is_empty());
    }
}
