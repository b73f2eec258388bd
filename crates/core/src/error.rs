//! Errors raised by lot, movement and identifier rules.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rule failure. All variants but `Conflict` are deterministic: retrying the
/// same input fails the same way.
///
/// Storage problems are never expressed here; see the infra `StoreError`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed input: empty item key, non-positive movement, ...
    #[error("validation failed: {0}")]
    Validation(String),

    /// A state rule would break (negative on-hand quantity, overflow).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier did not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A versioned record changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
