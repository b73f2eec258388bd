//! Stock operation errors.

use thiserror::Error;

use lotkeeper_core::{DomainError, LotId};

/// Failure of a stock operation (issue, receive, adjust).
///
/// `issue` only ever returns the first four variants. Everything except
/// `PersistenceFailure` is detected before any mutation, so no rollback is
/// needed and retrying the same request yields the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    /// Malformed input (missing item key, non-positive quantity, ...).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No lot has ever been received for the item key.
    #[error("item not found: {item_key}")]
    ItemNotFound { item_key: String },

    /// Lots exist but their summed on-hand quantity cannot cover the request.
    #[error("insufficient stock for {item_key}: requested {requested}, available {available}")]
    InsufficientStock {
        item_key: String,
        requested: i64,
        available: i64,
    },

    /// The underlying store failed mid-transaction; the transaction was rolled back.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Adjustment targeted a lot that does not exist.
    #[error("lot not found: {0}")]
    LotNotFound(LotId),
}

impl StockError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::PersistenceFailure(msg.into())
    }

    /// Whether the caller may safely re-submit the identical request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PersistenceFailure(_))
    }
}

impl From<DomainError> for StockError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => Self::InvalidRequest(msg),
            DomainError::InvariantViolation(msg) => Self::InvalidRequest(msg),
            DomainError::Conflict(msg) => Self::PersistenceFailure(msg),
        }
    }
}
