//! Optimistic concurrency primitives for versioned records.

use crate::error::{DomainError, DomainResult};

/// The version a record was read at, to be re-checked before writing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExpectedVersion(pub u64);

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        self.0 == actual
    }

    pub fn check(self, actual: u64) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "stale read (expected version {}, actual {actual})",
                self.0
            )))
        }
    }
}

/// Anything whose state changes bump a monotonically increasing version.
pub trait Versioned {
    fn version(&self) -> u64;
}
