//! Collaborator boundaries for stock persistence.
//!
//! The allocator never talks to a database directly. It works against a
//! `StockTransaction`: a scoped unit of work exposing the lot store and the
//! movement ledger. Committing publishes every staged change at once; dropping
//! the transaction without committing discards them.

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryStockStore, InMemoryTransaction};
pub use postgres::{PostgresStockStore, PostgresTransaction};

use thiserror::Error;

use lotkeeper_core::{DomainError, LotId};
use lotkeeper_inventory::{IssueRecord, ItemKey, MinimumStock, MovementRecord, StockError, StockLot};

/// Storage-level failure.
///
/// These are infrastructure errors as opposed to the domain errors in
/// `StockError`. `Conflict` is the only one a caller should retry in-process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A lot read by this transaction changed before commit
    /// (optimistic version mismatch, serialization failure, deadlock).
    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("lot not found: {0}")]
    LotNotFound(LotId),

    /// A write would break a stored invariant (e.g. negative quantity).
    #[error("store invariant violated: {0}")]
    Invariant(String),

    /// Driver, connection or lock failure.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => StoreError::Conflict(msg),
            other => StoreError::Invariant(other.to_string()),
        }
    }
}

impl From<StoreError> for StockError {
    fn from(err: StoreError) -> Self {
        StockError::PersistenceFailure(err.to_string())
    }
}

/// Read and write access to stock lots within a transaction.
pub trait LotStore {
    /// Lots of `item_key` with `quantity_on_hand > 0`, oldest first
    /// (`received_order`, then `lot_id`).
    fn list_available_lots(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError>;

    /// Whether any lot, exhausted or not, was ever received for `item_key`.
    fn has_lots(&mut self, item_key: &ItemKey) -> Result<bool, StoreError>;

    /// Every lot of `item_key` in FIFO order, exhausted ones included.
    fn lots_for_item(&mut self, item_key: &ItemKey) -> Result<Vec<StockLot>, StoreError>;

    fn get_lot(&mut self, lot_id: LotId) -> Result<Option<StockLot>, StoreError>;

    /// Subtract `amount` from the lot's on-hand quantity.
    ///
    /// Fails with `Invariant` if the lot holds less than `amount`.
    fn apply_deduction(&mut self, lot_id: LotId, amount: i64) -> Result<(), StoreError>;

    /// Insert a new lot or overwrite one previously read in this transaction.
    fn save_lot(&mut self, lot: StockLot) -> Result<(), StoreError>;

    /// Reserve the next FIFO position for a lot about to be received.
    fn next_received_order(&mut self) -> Result<u64, StoreError>;

    /// Every lot of every item, grouped by item key and FIFO within each.
    fn all_lots(&mut self) -> Result<Vec<StockLot>, StoreError>;

    fn minimum_stocks(&mut self) -> Result<Vec<MinimumStock>, StoreError>;

    /// Set or replace the low-stock threshold of one item.
    fn set_minimum_stock(&mut self, threshold: MinimumStock) -> Result<(), StoreError>;
}

/// Append-only history of stock movements and issuances.
pub trait MovementLedger {
    fn append(&mut self, movement: MovementRecord) -> Result<(), StoreError>;

    fn record_issue(&mut self, record: IssueRecord) -> Result<(), StoreError>;

    fn movements_for_lot(&mut self, lot_id: LotId) -> Result<Vec<MovementRecord>, StoreError>;

    /// Issue records, newest first.
    fn issue_records(&mut self) -> Result<Vec<IssueRecord>, StoreError>;
}

/// A unit of work over lots and the ledger.
///
/// Implementations must roll back on drop when neither `commit` nor
/// `rollback` was called.
pub trait StockTransaction: LotStore + MovementLedger {
    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self) -> Result<(), StoreError>;
}

/// Hands out transactions.
pub trait TransactionSource: Send + Sync {
    type Tx: StockTransaction;

    fn begin(&self) -> Result<Self::Tx, StoreError>;
}
