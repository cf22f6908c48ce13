//! Ledger Error Types
//!
//! Every failure surfaced by the repository, the transactional store and the
//! transfer engine is a [`LedgerError`]. Callers classify it with
//! [`LedgerError::kind`] and decide on retries with [`LedgerError::is_retryable`].

use thiserror::Error;

/// Coarse classification used by transport layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad parameters (non-positive amount, equal account ids, bad page)
    InvalidArgument,
    /// A referenced row does not exist
    NotFound,
    /// The caller's context was canceled before commit
    Canceled,
    /// The caller's deadline passed before commit
    DeadlineExceeded,
    /// Lock-wait timeout, deadlock victim or serialization failure; safe to retry
    Conflict,
    /// Unexpected store failure
    Internal,
}

/// Ledger error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero, got {0}")]
    InvalidAmount(i64),

    #[error("Source and target account cannot be the same: {0}")]
    SameAccount(i64),

    #[error("Invalid page: limit={limit} offset={offset}")]
    InvalidPage { limit: i64, offset: i64 },

    #[error("Balance of account {0} would overflow")]
    BalanceOverflow(i64),

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    // === Lookup Errors ===
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Referenced row does not exist: {0}")]
    MissingReference(String),

    // === Context Errors ===
    #[error("Operation canceled")]
    Canceled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    // === Transient Errors ===
    #[error("Lock conflict: {0}")]
    LockConflict(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn account_not_found(id: i64) -> Self {
        LedgerError::NotFound {
            entity: "account",
            id,
        }
    }

    pub fn entry_not_found(id: i64) -> Self {
        LedgerError::NotFound { entity: "entry", id }
    }

    pub fn transfer_not_found(id: i64) -> Self {
        LedgerError::NotFound {
            entity: "transfer",
            id,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount(_)
            | LedgerError::SameAccount(_)
            | LedgerError::InvalidPage { .. }
            | LedgerError::BalanceOverflow(_)
            | LedgerError::ConstraintViolation(_) => ErrorKind::InvalidArgument,
            LedgerError::NotFound { .. } | LedgerError::MissingReference(_) => ErrorKind::NotFound,
            LedgerError::Canceled => ErrorKind::Canceled,
            LedgerError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            LedgerError::LockConflict(_) | LedgerError::Unavailable(_) => ErrorKind::Conflict,
            LedgerError::DatabaseError(_) | LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-invoking the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::SameAccount(_) => "SAME_ACCOUNT",
            LedgerError::InvalidPage { .. } => "INVALID_PAGE",
            LedgerError::BalanceOverflow(_) => "BALANCE_OVERFLOW",
            LedgerError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            LedgerError::NotFound { .. } => "NOT_FOUND",
            LedgerError::MissingReference(_) => "MISSING_REFERENCE",
            LedgerError::Canceled => "CANCELED",
            LedgerError::DeadlineExceeded => "DEADLINE_EXCEEDED",
            LedgerError::LockConflict(_) => "LOCK_CONFLICT",
            LedgerError::Unavailable(_) => "UNAVAILABLE",
            LedgerError::DatabaseError(_) => "DATABASE_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Canceled => 499,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::Conflict => 409,
            ErrorKind::Internal => 500,
        }
    }
}

/// PostgreSQL SQLSTATE codes the ledger distinguishes
mod sqlstate {
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &str = "55P03";
    pub const QUERY_CANCELED: &str = "57014";
    pub const FOREIGN_KEY_VIOLATION: &str = "23503";
    pub const CHECK_VIOLATION: &str = "23514";
    pub const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";
    pub const INVALID_ROW_COUNT_IN_LIMIT: &str = "2201W";
    pub const INVALID_ROW_COUNT_IN_OFFSET: &str = "2201X";
}

impl From<sqlx::Error> for LedgerError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let message = db.message().to_string();
                match db.code().as_deref() {
                    Some(sqlstate::SERIALIZATION_FAILURE)
                    | Some(sqlstate::DEADLOCK_DETECTED)
                    | Some(sqlstate::LOCK_NOT_AVAILABLE) => LedgerError::LockConflict(message),
                    // statement_timeout is derived from the caller's deadline
                    Some(sqlstate::QUERY_CANCELED) => LedgerError::DeadlineExceeded,
                    Some(sqlstate::FOREIGN_KEY_VIOLATION) => LedgerError::MissingReference(message),
                    Some(sqlstate::CHECK_VIOLATION)
                    | Some(sqlstate::NUMERIC_VALUE_OUT_OF_RANGE)
                    | Some(sqlstate::INVALID_ROW_COUNT_IN_LIMIT)
                    | Some(sqlstate::INVALID_ROW_COUNT_IN_OFFSET) => {
                        LedgerError::ConstraintViolation(message)
                    }
                    _ => LedgerError::DatabaseError(e.to_string()),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                LedgerError::Unavailable(e.to_string())
            }
            _ => LedgerError::DatabaseError(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(LedgerError::SameAccount(1).kind(), ErrorKind::InvalidArgument);
        assert_eq!(LedgerError::InvalidAmount(0).kind(), ErrorKind::InvalidArgument);
        assert_eq!(LedgerError::account_not_found(9).kind(), ErrorKind::NotFound);
        assert_eq!(LedgerError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(LedgerError::DeadlineExceeded.kind(), ErrorKind::DeadlineExceeded);
        assert_eq!(
            LedgerError::LockConflict("x".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(LedgerError::Internal("x".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_only_conflicts_are_retryable() {
        assert!(LedgerError::LockConflict("deadlock".into()).is_retryable());
        assert!(LedgerError::Unavailable("pool".into()).is_retryable());
        assert!(!LedgerError::Canceled.is_retryable());
        assert!(!LedgerError::account_not_found(1).is_retryable());
        assert!(!LedgerError::DatabaseError("boom".into()).is_retryable());
    }

    #[test]
    fn test_http_status() {
        assert_eq!(LedgerError::InvalidAmount(-5).http_status(), 400);
        assert_eq!(LedgerError::transfer_not_found(3).http_status(), 404);
        assert_eq!(LedgerError::Canceled.http_status(), 499);
        assert_eq!(LedgerError::DeadlineExceeded.http_status(), 504);
        assert_eq!(LedgerError::LockConflict("x".into()).http_status(), 409);
        assert_eq!(LedgerError::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            LedgerError::account_not_found(42).to_string(),
            "account not found: 42"
        );
        assert_eq!(LedgerError::SameAccount(7).code(), "SAME_ACCOUNT");
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = LedgerError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_row_not_found_is_internal() {
        let err = LedgerError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
