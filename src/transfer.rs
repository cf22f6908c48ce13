//! Transfer engine
//!
//! Moves funds between two accounts in one atomic unit of work:
//!
//! ```text
//! validate ──▶ run_atomic ┬─ create transfer (from, to, amount)
//!                         ├─ create entry (from, -amount)
//!                         ├─ create entry (to,   +amount)
//!                         └─ add_account_balance × 2, smaller account id first
//! ```
//!
//! # Lock ordering
//!
//! Every transfer touches exactly two account rows. Both balance updates lock
//! their row until commit, so two transfers between the same pair running in
//! opposite directions would deadlock if each locked its own debit side first.
//! Updating the smaller id first, whatever the direction, gives every caller
//! the same global order and rules out a circular wait.
//!
//! The engine keeps no state of its own and never retries. A
//! [`LedgerError::is_retryable`] failure was fully rolled back and the whole
//! call may be repeated.

use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::context::Context;
use crate::error::LedgerError;
use crate::models::{
    Account, AddAccountBalanceParams, CreateEntryParams, CreateTransferParams, Entry, Transfer,
};
use crate::store::{Queries, Store, run_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidAmount(self.amount));
        }
        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::SameAccount(self.from_account_id));
        }
        Ok(())
    }
}

/// Everything a committed transfer created or changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    /// Debited account after the update
    pub from_account: Account,
    /// Credited account after the update
    pub to_account: Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTxParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositTxResult {
    pub entry: Entry,
    pub account: Account,
}

/// Execute one transfer atomically
///
/// Fails with `InvalidArgument` before touching the store for a non-positive
/// amount or a self-transfer. Any later failure rolls back every row the
/// attempt wrote, including the transfer record.
pub async fn transfer_tx<S>(
    store: &S,
    ctx: &Context,
    params: TransferTxParams,
) -> Result<TransferTxResult, LedgerError>
where
    S: Store + ?Sized,
{
    params.validate()?;

    let TransferTxParams {
        from_account_id,
        to_account_id,
        amount,
    } = params;

    let result = run_atomic(store, ctx, move |tx| {
        async move {
            let transfer = tx
                .create_transfer(CreateTransferParams {
                    from_account_id,
                    to_account_id,
                    amount,
                })
                .await?;
            debug!(transfer_id = transfer.id, "Transfer record created");

            let from_entry = tx
                .create_entry(CreateEntryParams {
                    account_id: from_account_id,
                    amount: -amount,
                })
                .await?;
            let to_entry = tx
                .create_entry(CreateEntryParams {
                    account_id: to_account_id,
                    amount,
                })
                .await?;

            let (from_account, to_account) = if from_account_id < to_account_id {
                add_money(tx, from_account_id, -amount, to_account_id, amount).await?
            } else {
                let (to_account, from_account) =
                    add_money(tx, to_account_id, amount, from_account_id, -amount).await?;
                (from_account, to_account)
            };

            Ok(TransferTxResult {
                transfer,
                from_entry,
                to_entry,
                from_account,
                to_account,
            })
        }
        .boxed()
    })
    .await?;

    info!(
        transfer_id = result.transfer.id,
        from_account_id,
        to_account_id,
        amount,
        from_balance = result.from_account.balance,
        to_balance = result.to_account.balance,
        "Transfer committed"
    );
    Ok(result)
}

/// Apply two balance deltas in the given order; the caller passes the
/// smaller account id first
async fn add_money<Q>(
    q: &mut Q,
    first_id: i64,
    first_amount: i64,
    second_id: i64,
    second_amount: i64,
) -> Result<(Account, Account), LedgerError>
where
    Q: Queries + ?Sized,
{
    let first = q
        .add_account_balance(AddAccountBalanceParams {
            id: first_id,
            amount: first_amount,
        })
        .await?;
    let second = q
        .add_account_balance(AddAccountBalanceParams {
            id: second_id,
            amount: second_amount,
        })
        .await?;
    Ok((first, second))
}

/// Credit money entering the ledger: one entry plus the balance update
pub async fn deposit_tx<S>(
    store: &S,
    ctx: &Context,
    params: DepositTxParams,
) -> Result<DepositTxResult, LedgerError>
where
    S: Store + ?Sized,
{
    if params.amount <= 0 {
        return Err(LedgerError::InvalidAmount(params.amount));
    }
    let DepositTxParams { account_id, amount } = params;

    let result = run_atomic(store, ctx, move |tx| {
        async move {
            let entry = tx
                .create_entry(CreateEntryParams { account_id, amount })
                .await?;
            let account = tx
                .add_account_balance(AddAccountBalanceParams {
                    id: account_id,
                    amount,
                })
                .await?;
            Ok(DepositTxResult { entry, account })
        }
        .boxed()
    })
    .await?;

    info!(
        account_id,
        amount,
        balance = result.account.balance,
        "Deposit committed"
    );
    Ok(result)
}

/// Shareable handle the transport layer holds on to
pub struct TransferEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Store> TransferEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn execute(
        &self,
        ctx: &Context,
        params: TransferTxParams,
    ) -> Result<TransferTxResult, LedgerError> {
        transfer_tx(&*self.store, ctx, params).await
    }

    pub async fn deposit(
        &self,
        ctx: &Context,
        params: DepositTxParams,
    ) -> Result<DepositTxResult, LedgerError> {
        deposit_tx(&*self.store, ctx, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::models::{CreateAccountParams, ListEntriesParams, ListTransfersParams};
    use crate::store::MemoryStore;

    async fn seed(store: &MemoryStore, balances: &[i64]) -> Vec<Account> {
        let mut conn = store.acquire(&Context::background()).await.unwrap();
        let mut accounts = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            accounts.push(
                conn.create_account(CreateAccountParams {
                    owner: format!("owner{}", i),
                    balance: *balance,
                    currency: "USD".to_string(),
                })
                .await
                .unwrap(),
            );
        }
        accounts
    }

    #[test]
    fn test_validate() {
        let ok = TransferTxParams {
            from_account_id: 1,
            to_account_id: 2,
            amount: 10,
        };
        assert!(ok.validate().is_ok());

        let zero = TransferTxParams { amount: 0, ..ok };
        assert_eq!(zero.validate(), Err(LedgerError::InvalidAmount(0)));

        let negative = TransferTxParams { amount: -5, ..ok };
        assert_eq!(
            negative.validate().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let same = TransferTxParams {
            to_account_id: 1,
            ..ok
        };
        assert_eq!(same.validate(), Err(LedgerError::SameAccount(1)));
    }

    #[tokio::test]
    async fn test_single_transfer_moves_funds() {
        let store = MemoryStore::new();
        let accounts = seed(&store, &[100, 50]).await;
        let (a, b) = (&accounts[0], &accounts[1]);

        let result = transfer_tx(
            &store,
            &Context::background(),
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: b.id,
                amount: 30,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.transfer.amount, 30);
        assert_eq!(result.from_entry.amount, -30);
        assert_eq!(result.from_entry.account_id, a.id);
        assert_eq!(result.to_entry.amount, 30);
        assert_eq!(result.to_entry.account_id, b.id);
        assert_eq!(result.from_account.id, a.id);
        assert_eq!(result.from_account.balance, 70);
        assert_eq!(result.to_account.id, b.id);
        assert_eq!(result.to_account.balance, 80);
    }

    #[tokio::test]
    async fn test_reverse_direction_keeps_result_sides() {
        let store = MemoryStore::new();
        let accounts = seed(&store, &[100, 50]).await;
        let (a, b) = (&accounts[0], &accounts[1]);

        // Larger id is the debit side here, so it is updated second
        let result = transfer_tx(
            &store,
            &Context::background(),
            TransferTxParams {
                from_account_id: b.id,
                to_account_id: a.id,
                amount: 20,
            },
        )
        .await
        .unwrap();

        assert_eq!(result.from_account.id, b.id);
        assert_eq!(result.from_account.balance, 30);
        assert_eq!(result.to_account.id, a.id);
        assert_eq!(result.to_account.balance, 120);
    }

    #[tokio::test]
    async fn test_missing_account_leaves_no_rows() {
        let store = MemoryStore::new();
        let accounts = seed(&store, &[100]).await;
        let a = &accounts[0];

        let err = transfer_tx(
            &store,
            &Context::background(),
            TransferTxParams {
                from_account_id: a.id,
                to_account_id: 9_999,
                amount: 10,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut conn = store.acquire(&Context::background()).await.unwrap();
        assert_eq!(conn.get_account(a.id).await.unwrap().balance, 100);
        let transfers = conn
            .list_transfers(ListTransfersParams {
                from_account_id: a.id,
                to_account_id: a.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert!(transfers.is_empty());
    }

    #[tokio::test]
    async fn test_deposit_adds_entry() {
        let store = MemoryStore::new();
        let accounts = seed(&store, &[0]).await;
        let a = &accounts[0];
        let engine = TransferEngine::new(Arc::new(store));

        let result = engine
            .deposit(
                &Context::background(),
                DepositTxParams {
                    account_id: a.id,
                    amount: 250,
                },
            )
            .await
            .unwrap();
        assert_eq!(result.account.balance, 250);
        assert_eq!(result.entry.amount, 250);

        let err = engine
            .deposit(
                &Context::background(),
                DepositTxParams {
                    account_id: a.id,
                    amount: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount(0));

        let mut conn = engine.store().acquire(&Context::background()).await.unwrap();
        let entries = conn
            .list_entries(ListEntriesParams {
                account_id: a.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }
}
