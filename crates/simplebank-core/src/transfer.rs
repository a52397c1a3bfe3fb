use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    error::LedgerError,
    models::{
        write::{AddAccountBalanceParams, CreateEntryParams, CreateTransferParams},
        Account, Entry, Transfer,
    },
    storage::{Queries, StorageError},
    store::Store,
};

/// Input of a money transfer. `amount` is in the smallest currency unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::Validation(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::Validation(format!(
                "cannot transfer from account {} to itself",
                self.from_account_id
            )));
        }
        Ok(())
    }
}

/// Everything a transfer created or changed, as seen at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    /// Source account after the debit.
    pub from_account: Account,
    /// Destination account after the credit.
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

impl Store {
    /// Moves `amount` from one account to another.
    ///
    /// Creates the transfer record and both entries, then adjusts both
    /// balances in one database transaction. Balances are always adjusted
    /// lower account id first, so two transfers over the same pair of
    /// accounts request their row locks in the same order whatever their
    /// direction and cannot deadlock each other.
    pub fn transfer_tx(&self, ctx: &Context, params: &TransferTxParams) -> Result<TransferTxResult, LedgerError> {
        params.validate()?;

        let TransferTxParams {
            from_account_id,
            to_account_id,
            amount,
        } = *params;

        self.exec_tx(ctx, |q| {
            tracing::debug!("create transfer");
            let transfer = q.create_transfer(
                ctx,
                &CreateTransferParams {
                    from_account_id,
                    to_account_id,
                    amount,
                },
            )?;

            tracing::debug!("create entry 1");
            let from_entry = q.create_entry(
                ctx,
                &CreateEntryParams {
                    account_id: from_account_id,
                    amount: -amount,
                },
            )?;

            tracing::debug!("create entry 2");
            let to_entry = q.create_entry(
                ctx,
                &CreateEntryParams {
                    account_id: to_account_id,
                    amount,
                },
            )?;

            let (from_account, to_account) = if from_account_id < to_account_id {
                add_money(ctx, q, from_account_id, -amount, to_account_id, amount)?
            } else {
                let (to_account, from_account) =
                    add_money(ctx, q, to_account_id, amount, from_account_id, -amount)?;
                (from_account, to_account)
            };

            Ok(TransferTxResult {
                transfer,
                from_account,
                to_account,
                from_entry,
                to_entry,
            })
        })
    }
}

/// Adds `amount1` to the first account, then `amount2` to the second, in that
/// order.
fn add_money(
    ctx: &Context,
    q: &mut dyn Queries,
    account_id1: i64,
    amount1: i64,
    account_id2: i64,
    amount2: i64,
) -> Result<(Account, Account), StorageError> {
    tracing::debug!(account_id = account_id1, amount = amount1, "add account balance");
    let account1 = q.add_account_balance(
        ctx,
        &AddAccountBalanceParams {
            id: account_id1,
            amount: amount1,
        },
    )?;

    tracing::debug!(account_id = account_id2, amount = amount2, "add account balance");
    let account2 = q.add_account_balance(
        ctx,
        &AddAccountBalanceParams {
            id: account_id2,
            amount: amount2,
        },
    )?;

    Ok((account1, account2))
}
