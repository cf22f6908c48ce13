//! In-process ledger store
//!
//! Read-committed semantics with real row locks, so the transfer engine's
//! lock ordering matters here exactly as it does on PostgreSQL.
//!
//! - Committed rows live in [`Tables`] behind an async `RwLock`.
//! - A [`MemoryTx`] buffers its writes in a private overlay and publishes them
//!   in one step on commit.
//! - `get_account_for_update` / `add_account_balance` take a per-account
//!   `tokio::sync::Mutex` and hold the guard until commit or rollback.
//! - Ids come from sequences that are not rolled back, like PostgreSQL
//!   `BIGSERIAL`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, trace};

use super::{Queries, Store, Transaction};
use crate::context::Context;
use crate::error::LedgerError;
use crate::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, check_page,
};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
}

#[derive(Debug)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: DashMap<i64, Arc<Mutex<()>>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    lock_timeout: Option<Duration>,
}

impl Shared {
    fn next(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-memory [`Store`]
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store whose lock waits are bounded only by the caller's context
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Store that fails a row-lock wait with [`LedgerError::LockConflict`]
    /// after `timeout`, mirroring PostgreSQL `lock_timeout`
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self::build(Some(timeout))
    }

    fn build(lock_timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: DashMap::new(),
                account_seq: AtomicI64::new(0),
                entry_seq: AtomicI64::new(0),
                transfer_seq: AtomicI64::new(0),
                lock_timeout,
            }),
        }
    }

    fn begin_tx(&self) -> MemoryTx {
        MemoryTx {
            shared: self.shared.clone(),
            accounts: HashMap::new(),
            entries: Vec::new(),
            transfers: Vec::new(),
            locks: HashMap::new(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Conn = MemoryConn;
    type Tx = MemoryTx;

    async fn acquire(&self, ctx: &Context) -> Result<MemoryConn, LedgerError> {
        ctx.check()?;
        Ok(MemoryConn {
            store: self.clone(),
        })
    }

    async fn begin(&self, ctx: &Context) -> Result<MemoryTx, LedgerError> {
        ctx.check()?;
        Ok(self.begin_tx())
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Open in-memory transaction
///
/// Dropping it discards the overlay and releases every row lock it holds.
pub struct MemoryTx {
    shared: Arc<Shared>,
    /// Accounts created or updated by this transaction
    accounts: HashMap<i64, Account>,
    entries: Vec<Entry>,
    transfers: Vec<Transfer>,
    locks: HashMap<i64, OwnedMutexGuard<()>>,
}

impl MemoryTx {
    /// Own write first, then the latest committed row
    async fn visible_account(&self, id: i64) -> Option<Account> {
        if let Some(account) = self.accounts.get(&id) {
            return Some(account.clone());
        }
        self.shared.tables.read().await.accounts.get(&id).cloned()
    }

    async fn require_account(&self, id: i64) -> Result<Account, LedgerError> {
        self.visible_account(id)
            .await
            .ok_or_else(|| LedgerError::account_not_found(id))
    }

    /// Block until this transaction holds the row lock for `id`
    async fn lock_row(&mut self, id: i64) -> Result<(), LedgerError> {
        if self.locks.contains_key(&id) {
            return Ok(());
        }

        let lock = self.shared.row_locks.entry(id).or_default().clone();
        let guard = match self.shared.lock_timeout {
            Some(timeout) => tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| {
                    LedgerError::LockConflict(format!(
                        "lock wait on account {} exceeded {:?}",
                        id, timeout
                    ))
                })?,
            None => lock.lock_owned().await,
        };

        trace!(account_id = id, "Row lock acquired");
        self.locks.insert(id, guard);
        Ok(())
    }

    /// Lock the row, then read it; committed state is final once the lock is held
    async fn locked_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        // Accounts are never deleted, so existence checked before locking holds
        self.require_account(id).await?;
        self.lock_row(id).await?;
        self.require_account(id).await
    }

    async fn apply(&mut self) {
        let mut tables = self.shared.tables.write().await;
        for (id, account) in self.accounts.drain() {
            tables.accounts.insert(id, account);
        }
        for entry in self.entries.drain(..) {
            tables.entries.insert(entry.id, entry);
        }
        for transfer in self.transfers.drain(..) {
            tables.transfers.insert(transfer.id, transfer);
        }
    }
}

fn page<T>(rows: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    rows.skip(offset as usize).take(limit as usize).collect()
}

/// Committed rows and this transaction's own rows interleave by id
fn page_by_id<T>(
    rows: impl Iterator<Item = T>,
    id: impl Fn(&T) -> i64,
    limit: i64,
    offset: i64,
) -> Vec<T> {
    let mut rows: Vec<T> = rows.collect();
    rows.sort_by_key(|row| id(row));
    page(rows.into_iter(), limit, offset)
}

#[async_trait]
impl Queries for MemoryTx {
    async fn create_account(
        &mut self,
        params: CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let account = Account {
            id: Shared::next(&self.shared.account_seq),
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        self.require_account(id).await
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError> {
        self.locked_account(id).await
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        check_page(params.limit, params.offset)?;
        let mut merged = self.shared.tables.read().await.accounts.clone();
        merged.extend(self.accounts.iter().map(|(id, a)| (*id, a.clone())));
        Ok(page(merged.into_values(), params.limit, params.offset))
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        let mut account = self.locked_account(params.id).await?;
        account.balance = account
            .balance
            .checked_add(params.amount)
            .ok_or(LedgerError::BalanceOverflow(params.id))?;
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        if self.visible_account(params.account_id).await.is_none() {
            return Err(LedgerError::MissingReference(format!(
                "entries.account_id = {}",
                params.account_id
            )));
        }
        let entry = Entry {
            id: Shared::next(&self.shared.entry_seq),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        if let Some(entry) = self.entries.iter().find(|e| e.id == id) {
            return Ok(entry.clone());
        }
        self.shared
            .tables
            .read()
            .await
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::entry_not_found(id))
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        check_page(params.limit, params.offset)?;
        let tables = self.shared.tables.read().await;
        let rows = tables
            .entries
            .values()
            .chain(self.entries.iter())
            .filter(|e| e.account_id == params.account_id)
            .cloned();
        Ok(page_by_id(rows, |e| e.id, params.limit, params.offset))
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        if params.amount <= 0 {
            return Err(LedgerError::ConstraintViolation(format!(
                "transfers.amount must be positive, got {}",
                params.amount
            )));
        }
        for (column, id) in [
            ("from_account_id", params.from_account_id),
            ("to_account_id", params.to_account_id),
        ] {
            if self.visible_account(id).await.is_none() {
                return Err(LedgerError::MissingReference(format!(
                    "transfers.{} = {}",
                    column, id
                )));
            }
        }
        let transfer = Transfer {
            id: Shared::next(&self.shared.transfer_seq),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };
        self.transfers.push(transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        if let Some(transfer) = self.transfers.iter().find(|t| t.id == id) {
            return Ok(transfer.clone());
        }
        self.shared
            .tables
            .read()
            .await
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::transfer_not_found(id))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        check_page(params.limit, params.offset)?;
        let tables = self.shared.tables.read().await;
        let rows = tables
            .transfers
            .values()
            .chain(self.transfers.iter())
            .filter(|t| {
                t.from_account_id == params.from_account_id
                    || t.to_account_id == params.to_account_id
            })
            .cloned();
        Ok(page_by_id(rows, |t| t.id, params.limit, params.offset))
    }
}

#[async_trait]
impl Transaction for MemoryTx {
    async fn commit(mut self) -> Result<(), LedgerError> {
        debug!(
            accounts = self.accounts.len(),
            entries = self.entries.len(),
            transfers = self.transfers.len(),
            "Committing memory transaction"
        );
        self.apply().await;
        // Row locks are released only after the new rows are visible
        self.locks.clear();
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        debug!(locks = self.locks.len(), "Rolling back memory transaction");
        Ok(())
    }

    async fn abort(self) {
        debug!(locks = self.locks.len(), "Aborting memory transaction");
    }
}

// ============================================================================
// Ambient connection
// ============================================================================

/// Auto-commit handle: every call runs in its own short transaction
pub struct MemoryConn {
    store: MemoryStore,
}

impl MemoryConn {
    async fn once<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: for<'t> FnOnce(
            &'t mut MemoryTx,
        ) -> futures::future::BoxFuture<'t, Result<T, LedgerError>>,
    {
        let mut tx = self.store.begin_tx();
        let value = op(&mut tx).await?;
        tx.commit().await?;
        Ok(value)
    }
}

#[async_trait]
impl Queries for MemoryConn {
    async fn create_account(
        &mut self,
        params: CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        self.once(|tx| tx.create_account(params)).await
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        self.once(|tx| tx.get_account(id)).await
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError> {
        // Lock is released as soon as the implicit transaction commits
        self.once(|tx| tx.get_account_for_update(id)).await
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        self.once(|tx| tx.list_accounts(params)).await
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        self.once(|tx| tx.add_account_balance(params))
            .await
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        self.once(|tx| tx.create_entry(params)).await
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        self.once(|tx| tx.get_entry(id)).await
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        self.once(|tx| tx.list_entries(params)).await
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        self.once(|tx| tx.create_transfer(params)).await
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        self.once(|tx| tx.get_transfer(id)).await
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        self.once(|tx| tx.list_transfers(params)).await
    }
}
