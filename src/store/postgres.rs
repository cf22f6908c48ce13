//! PostgreSQL ledger store
//!
//! Repository queries run against any `PgConnection`: a pooled connection
//! for ambient calls, or an open `sqlx::Transaction` for units of work.
//! Row locks are PostgreSQL's own (`UPDATE` and `SELECT ... FOR NO KEY UPDATE`);
//! `lock_timeout` bounds how long a transaction waits for one.
//!
//! A transaction that outlives its caller's context is aborted with
//! `pg_cancel_backend` on its server process, then dropped; sqlx issues the
//! `ROLLBACK` once the connection is idle again.

use std::ops::DerefMut;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use tracing::{debug, warn};

use super::{Queries, Store, Transaction};
use crate::context::Context;
use crate::error::LedgerError;
use crate::models::{
    Account, AddAccountBalanceParams, CreateAccountParams, CreateEntryParams,
    CreateTransferParams, Entry, ListAccountsParams, ListEntriesParams, ListTransfersParams,
    Transfer, check_page,
};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

/// PostgreSQL-backed [`Store`]
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Abort a transaction's row-lock wait after `timeout` (SQLSTATE 55P03)
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Ambient handle: one pooled connection, every statement auto-commits
pub type PgConn = PgQueries<PoolConnection<Postgres>>;

/// Open transaction
pub type PgTx = PgQueries<sqlx::Transaction<'static, Postgres>>;

#[async_trait]
impl Store for PgStore {
    type Conn = PgConn;
    type Tx = PgTx;

    async fn acquire(&self, ctx: &Context) -> Result<PgConn, LedgerError> {
        ctx.check()?;
        let conn = self.pool.acquire().await?;
        Ok(PgQueries {
            conn,
            backend: None,
        })
    }

    async fn begin(&self, ctx: &Context) -> Result<PgTx, LedgerError> {
        ctx.check()?;
        let mut tx = self.pool.begin().await?;
        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *tx)
            .await?;

        // SET does not take bind parameters; both values are plain integers
        if let Some(timeout) = self.lock_timeout {
            sqlx::query(&format!("SET LOCAL lock_timeout = {}", timeout.as_millis()))
                .execute(&mut *tx)
                .await?;
        }
        if let Some(remaining) = ctx.remaining() {
            let millis = remaining.as_millis().max(1);
            sqlx::query(&format!("SET LOCAL statement_timeout = {}", millis))
                .execute(&mut *tx)
                .await?;
        }

        Ok(PgQueries {
            conn: tx,
            backend: Some(Backend {
                pool: self.pool.clone(),
                pid,
            }),
        })
    }
}

/// Server process behind an open transaction
struct Backend {
    pool: PgPool,
    pid: i32,
}

impl Backend {
    /// Cancel whatever statement the process is running, from another connection
    async fn cancel_statement(&self) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT pg_cancel_backend($1)")
            .bind(self.pid)
            .fetch_one(&self.pool)
            .await
    }
}

/// Repository bound to a PostgreSQL connection or transaction
pub struct PgQueries<C> {
    conn: C,
    /// Set for transactions only
    backend: Option<Backend>,
}

#[async_trait]
impl<C> Queries for PgQueries<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn create_account(
        &mut self,
        params: CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(&params.owner)
        .bind(params.balance)
        .bind(&params.currency)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn get_account(&mut self, id: i64) -> Result<Account, LedgerError> {
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1 LIMIT 1",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::account_not_found(id))
    }

    async fn get_account_for_update(&mut self, id: i64) -> Result<Account, LedgerError> {
        // NO KEY UPDATE does not block the KEY SHARE lock taken by FK inserts
        sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::account_not_found(id))
    }

    async fn list_accounts(
        &mut self,
        params: ListAccountsParams,
    ) -> Result<Vec<Account>, LedgerError> {
        check_page(params.limit, params.offset)?;
        let rows = sqlx::query_as::<_, Account>(&format!(
            "SELECT {} FROM accounts ORDER BY id LIMIT $1 OFFSET $2",
            ACCOUNT_COLUMNS
        ))
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows)
    }

    async fn add_account_balance(
        &mut self,
        params: AddAccountBalanceParams,
    ) -> Result<Account, LedgerError> {
        sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {}",
            ACCOUNT_COLUMNS
        ))
        .bind(params.amount)
        .bind(params.id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::account_not_found(params.id))
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry, LedgerError> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {}",
            ENTRY_COLUMNS
        ))
        .bind(params.account_id)
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(entry)
    }

    async fn get_entry(&mut self, id: i64) -> Result<Entry, LedgerError> {
        sqlx::query_as::<_, Entry>(&format!(
            "SELECT {} FROM entries WHERE id = $1 LIMIT 1",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::entry_not_found(id))
    }

    async fn list_entries(
        &mut self,
        params: ListEntriesParams,
    ) -> Result<Vec<Entry>, LedgerError> {
        check_page(params.limit, params.offset)?;
        let rows = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3",
            ENTRY_COLUMNS
        ))
        .bind(params.account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows)
    }

    async fn create_transfer(
        &mut self,
        params: CreateTransferParams,
    ) -> Result<Transfer, LedgerError> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {}",
            TRANSFER_COLUMNS
        ))
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.amount)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: i64) -> Result<Transfer, LedgerError> {
        sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {} FROM transfers WHERE id = $1 LIMIT 1",
            TRANSFER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?
        .ok_or_else(|| LedgerError::transfer_not_found(id))
    }

    async fn list_transfers(
        &mut self,
        params: ListTransfersParams,
    ) -> Result<Vec<Transfer>, LedgerError> {
        check_page(params.limit, params.offset)?;
        let rows = sqlx::query_as::<_, Transfer>(&format!(
            r#"SELECT {} FROM transfers
               WHERE from_account_id = $1 OR to_account_id = $2
               ORDER BY id LIMIT $3 OFFSET $4"#,
            TRANSFER_COLUMNS
        ))
        .bind(params.from_account_id)
        .bind(params.to_account_id)
        .bind(params.limit)
        .bind(params.offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl Transaction for PgTx {
    async fn commit(self) -> Result<(), LedgerError> {
        self.conn.commit().await?;
        debug!("PostgreSQL transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.conn.rollback().await?;
        Ok(())
    }

    async fn abort(self) {
        let PgQueries { conn, backend } = self;
        if let Some(backend) = backend {
            match backend.cancel_statement().await {
                Ok(signaled) => debug!(pid = backend.pid, signaled, "Backend cancel requested"),
                Err(e) => warn!(pid = backend.pid, error = %e, "Backend cancel failed"),
            }
        }
        // Drop queues the ROLLBACK instead of waiting on the connection here
        drop(conn);
    }
}
