//! Ledger rows and repository parameters
//!
//! All amounts are signed 64-bit integers in minor currency units (cents).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::LedgerError;

/// Upper bound for a single page of a list query
pub const MAX_PAGE_SIZE: i64 = 1000;

// ============================================================================
// Rows
// ============================================================================

/// Bank account
///
/// `balance` is maintained incrementally by the transfer engine and always
/// equals the opening balance plus the sum of the account's entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: i64,
    pub owner: String,
    pub balance: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only ledger line: one signed balance change on one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Entry {
    pub id: i64,
    pub account_id: i64,
    /// Negative = debit, positive = credit
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Completed movement of funds, backed by exactly two entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Transfer {
    pub id: i64,
    pub from_account_id: i64,
    pub to_account_id: i64,
    /// Always positive
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAccountBalanceParams {
    pub id: i64,
    /// Signed delta applied to the current balance
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Matches transfers leaving `from_account_id` OR arriving at `to_account_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Validate a `LIMIT`/`OFFSET` pair before it reaches the store
pub fn check_page(limit: i64, offset: i64) -> Result<(), LedgerError> {
    if !(1..=MAX_PAGE_SIZE).contains(&limit) || offset < 0 {
        return Err(LedgerError::InvalidPage { limit, offset });
    }
    Ok(())
}
