//! Simple Bank - double-entry ledger core
//!
//! Accounts, append-only entries and transfers, with a transfer engine that
//! stays deadlock-free under any mix of concurrent callers.
//!
//! # Modules
//!
//! - [`models`] - Account, Entry, Transfer rows and repository parameters
//! - [`error`] - Error taxonomy shared by every layer
//! - [`context`] - Cancellation and deadlines for store calls
//! - [`store`] - Entity repository, transactional store, PostgreSQL and in-memory backends
//! - [`transfer`] - Transfer engine (`transfer_tx`) and deposits
//! - [`db`] - PostgreSQL pool and schema
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod store;
pub mod transfer;

// Convenient re-exports at crate root
pub use context::{CancelHandle, Context};
pub use error::{ErrorKind, LedgerError};
pub use models::{Account, Entry, Transfer};
pub use store::{MemoryStore, PgStore, Queries, Store, Transaction, run_atomic};
pub use transfer::{
    DepositTxParams, DepositTxResult, TransferEngine, TransferTxParams, TransferTxResult,
    deposit_tx, transfer_tx,
};
