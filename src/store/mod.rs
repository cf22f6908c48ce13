//! Ledger store
//!
//! Two layers:
//!
//! - [`Queries`]: the entity repository. Plain row accessors for accounts,
//!   entries and transfers with no business logic.
//! - [`Store`] + [`run_atomic`]: the transactional store. A unit of work gets a
//!   [`Transaction`] handle and either commits as a whole or rolls back.
//!
//! ```text
//! caller ──▶ transfer_tx ──▶ run_atomic(store, ctx, |tx| ...) ──▶ Queries on tx ──▶ commit
//!                                   │
//!                                   └── error / cancel / panic ──▶ rollback
//! ```
//!
//! Backends: [`PgStore`] (PostgreSQL via sqlx) and [`MemoryStore`]
//! (in-process, real row locks).

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::panic::{AssertUnwindSafe, resume_unwind};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::warn;

use crate::context::Context;
use crate::error::LedgerError;
use crate::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer,
};

/// Entity repository
///
/// Implemented both by ambient connections (every call commits on its own)
/// and by open transactions (calls become visible on commit).
#[async_trait]
pub trait Queries: Send {
    async fn create_account(&mut self, params: CreateAccountParams)
    -> Result<Account, LedgerError>;

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError>;

    /// Like [`Queries::get_account`], but holds an exclusive row lock until the
    /// enclosing transaction ends
    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError>;

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError>;

    /// Atomic `balance += amount`, returning the updated row. Locks the row.
    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError>;

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError>;

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError>;

    async fn list_entries(&mut self, params: ListEntriesParams)
    -> Result<Vec<Entry>, LedgerError>;

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError>;

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError>;

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError>;
}

/// An open transaction scope
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Queries {
    async fn commit(self) -> Result<(), LedgerError>;

    async fn rollback(self) -> Result<(), LedgerError>;

    /// Give up on the transaction without waiting for a statement that may
    /// still be running on it; the backend rolls it back once it is idle
    async fn abort(self);
}

/// Transactional store backend
#[async_trait]
pub trait Store: Send + Sync {
    type Conn: Queries;
    type Tx: Transaction;

    /// Ambient (auto-commit) repository handle
    async fn acquire(&self, ctx: &Context) -> Result<Self::Conn, LedgerError>;

    /// Open a read-committed transaction bound to `ctx`
    async fn begin(&self, ctx: &Context) -> Result<Self::Tx, LedgerError>;
}

/// Run `unit` inside one transaction
///
/// Commits when `unit` returns `Ok`. Rolls back and returns the error when
/// `unit` fails. When `ctx` ends first the transaction is aborted without
/// waiting on the connection. A panic inside `unit` rolls back before the
/// unwind resumes.
pub async fn run_atomic<S, T, F>(store: &S, ctx: &Context, unit: F) -> Result<T, LedgerError>
where
    S: Store + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, LedgerError>> + Send,
{
    ctx.check()?;
    let mut tx = store.begin(ctx).await?;

    let finished = {
        let work = AssertUnwindSafe(unit(&mut tx)).catch_unwind();
        tokio::select! {
            biased;
            reason = ctx.done() => Err(reason),
            result = work => Ok(result),
        }
    };

    let outcome = match finished {
        Ok(outcome) => outcome,
        Err(reason) => {
            // The dropped unit may have left a statement blocked on a row lock
            warn!(code = reason.code(), "Context ended mid-transaction, aborting");
            tx.abort().await;
            return Err(reason);
        }
    };

    match outcome {
        Ok(Ok(value)) => {
            // The context may have ended between the last statement and here
            if let Some(reason) = ctx.err() {
                rollback_quietly(tx, &reason).await;
                return Err(reason);
            }
            tx.commit().await?;
            Ok(value)
        }
        Ok(Err(e)) => {
            rollback_quietly(tx, &e).await;
            Err(e)
        }
        Err(panic) => {
            let reason = LedgerError::Internal("unit of work panicked".to_string());
            rollback_quietly(tx, &reason).await;
            resume_unwind(panic)
        }
    }
}

async fn rollback_quietly<X: Transaction>(tx: X, cause: &LedgerError) {
    warn!(code = cause.code(), error = %cause, "Rolling back transaction");
    if let Err(e) = tx.rollback().await {
        // Dropping the handle still discards the transaction
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open(owner: &str, balance: i64) -> CreateAccountParams {
        CreateAccountParams {
            owner: owner.to_string(),
            balance,
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let store = MemoryStore::new();
        let ctx = Context::background();

        let account = run_atomic(&store, &ctx, |tx| {
            async move { tx.create_account(open("alice", 100)).await }.boxed()
        })
        .await
        .unwrap();

        let mut conn = store.acquire(&ctx).await.unwrap();
        assert_eq!(conn.get_account(account.id).await.unwrap(), account);
    }

    #[tokio::test]
    async fn test_error_rolls_back_everything() {
        let store = MemoryStore::new();
        let ctx = Context::background();
        let mut conn = store.acquire(&ctx).await.unwrap();
        let account = conn.create_account(open("bob", 50)).await.unwrap();

        let err = run_atomic(&store, &ctx, |tx| {
            async move {
                tx.create_entry(CreateEntryParams {
                    account_id: account.id,
                    amount: 25,
                })
                .await?;
                tx.add_account_balance(AddAccountBalanceParams {
                    id: account.id,
                    amount: 25,
                })
                .await?;
                tx.get_account(9_999).await
            }
            .boxed()
        })
        .await
        .unwrap_err();

        assert_eq!(err, LedgerError::account_not_found(9_999));
        assert_eq!(conn.get_account(account.id).await.unwrap().balance, 50);
        let entries = conn
            .list_entries(ListEntriesParams {
                account_id: account.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_panic_rolls_back_then_resumes() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let ctx = Context::background();
        let account = store
            .acquire(&ctx)
            .await
            .unwrap()
            .create_account(open("carol", 10))
            .await
            .unwrap();

        let task_store = store.clone();
        let joined = tokio::spawn(async move {
            let ctx = Context::background();
            let _: Result<(), LedgerError> = run_atomic(&*task_store, &ctx, |tx| {
                async move {
                    let updated = tx
                        .add_account_balance(AddAccountBalanceParams {
                            id: account.id,
                            amount: 1_000,
                        })
                        .await?;
                    assert!(updated.balance < 0, "boom");
                    Ok(())
                }
                .boxed()
            })
            .await;
        })
        .await;
        assert!(joined.unwrap_err().is_panic());

        // Lock released and write discarded
        let mut conn = store.acquire(&ctx).await.unwrap();
        let reread = conn
            .add_account_balance(AddAccountBalanceParams {
                id: account.id,
                amount: 0,
            })
            .await
            .unwrap();
        assert_eq!(reread.balance, 10);
    }

    #[tokio::test]
    async fn test_canceled_context_never_begins() {
        let store = MemoryStore::new();
        let (ctx, handle) = Context::background().with_cancel();
        handle.cancel();

        let err = run_atomic(&store, &ctx, |tx| {
            async move { tx.create_account(open("dave", 1)).await }.boxed()
        })
        .await
        .unwrap_err();
        assert_eq!(err, LedgerError::Canceled);

        let mut conn = store.acquire(&Context::background()).await.unwrap();
        let accounts = conn
            .list_accounts(ListAccountsParams {
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_while_waiting_rolls_back() {
        let store = MemoryStore::new();
        let bg = Context::background();
        let account = store
            .acquire(&bg)
            .await
            .unwrap()
            .create_account(open("erin", 0))
            .await
            .unwrap();

        // Hold the row lock in a separate transaction
        let mut holder = store.begin(&bg).await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let err = run_atomic(&store, &ctx, |tx| {
            async move {
                tx.create_entry(CreateEntryParams {
                    account_id: account.id,
                    amount: 5,
                })
                .await?;
                tx.add_account_balance(AddAccountBalanceParams {
                    id: account.id,
                    amount: 5,
                })
                .await
            }
            .boxed()
        })
        .await
        .unwrap_err();
        assert_eq!(err, LedgerError::DeadlineExceeded);

        holder.rollback().await.unwrap();
        let mut conn = store.acquire(&bg).await.unwrap();
        let entries = conn
            .list_entries(ListEntriesParams {
                account_id: account.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert_eq!(conn.get_account(account.id).await.unwrap().balance, 0);
    }
}
