//! Stock service: owns transaction scope for every stock operation.
//!
//! Each operation runs in its own transaction acquired from the store. The
//! transaction is committed only when the operation succeeds; on any error it
//! is rolled back (explicitly, or by drop while unwinding). Optimistic
//! concurrency conflicts re-run the whole operation from a fresh read.

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use lotkeeper_core::LotId;
use lotkeeper_inventory::{
    summarize, AdjustLot, IssueRecord, IssueRequest, IssueResult, ItemKey, MinimumStock, MovementRecord,
    ReceiveStock, StockError, StockLevel, StockLot,
};

use crate::config::ServiceConfig;
use crate::issuance::allocate_issue;
use crate::store::{LotStore, MovementLedger, StockTransaction, StoreError, TransactionSource};

/// Entry point for issuing, receiving and adjusting stock.
#[derive(Debug)]
pub struct StockService<S> {
    store: S,
    config: ServiceConfig,
}

impl<S> StockService<S>
where
    S: TransactionSource,
{
    pub fn new(store: S, config: ServiceConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Issue stock FIFO across the item's lots.
    ///
    /// Either every lot deduction, movement and the issue record commit
    /// together, or nothing does.
    #[instrument(
        skip(self, request),
        fields(item_key = %request.item_key, quantity = request.quantity, actor_id = %request.actor_id)
    )]
    pub fn issue(&self, request: &IssueRequest) -> Result<IssueResult, StockError> {
        let outcome = self.in_transaction("issue", |tx| allocate_issue(tx, request, Utc::now()));

        match &outcome {
            Ok(result) => info!(
                issue_id = %result.issue_id,
                lots = result.allocations.len(),
                "stock issued"
            ),
            Err(StockError::InsufficientStock { requested, available, .. }) => {
                warn!(requested, available, "insufficient stock")
            }
            Err(StockError::PersistenceFailure(reason)) => error!(%reason, "issue rolled back"),
            Err(err) => warn!(error = %err, "issue rejected"),
        }
        outcome
    }

    /// Record a new lot for an item.
    #[instrument(skip(self, cmd), fields(item_key = %cmd.item_key, quantity = cmd.quantity))]
    pub fn receive(&self, cmd: &ReceiveStock) -> Result<StockLot, StockError> {
        let lot = self.in_transaction("receive", |tx| {
            let order = tx.next_received_order()?;
            let (lot, movement) = cmd.into_lot(LotId::new(), order, Utc::now())?;
            tx.save_lot(lot.clone())?;
            if let Some(movement) = movement {
                tx.append(movement)?;
            }
            Ok(lot)
        })?;
        info!(lot_id = %lot.lot_id(), received_order = lot.received_order(), "lot received");
        Ok(lot)
    }

    /// Add to or remove from one lot, recording the reason.
    #[instrument(skip(self, cmd), fields(lot_id = %cmd.lot_id, delta = cmd.delta))]
    pub fn adjust(&self, cmd: &AdjustLot) -> Result<(StockLot, MovementRecord), StockError> {
        cmd.validate()?;
        let adjusted = self.in_transaction("adjust", |tx| {
            let mut lot = tx.get_lot(cmd.lot_id)?.ok_or(StockError::LotNotFound(cmd.lot_id))?;
            let movement = cmd.apply_to(&mut lot, Utc::now())?;
            tx.save_lot(lot.clone())?;
            tx.append(movement.clone())?;
            Ok((lot, movement))
        })?;
        info!(quantity_on_hand = adjusted.0.quantity_on_hand(), "lot adjusted");
        Ok(adjusted)
    }

    /// Total on-hand quantity across every lot of the item.
    pub fn available_quantity(&self, item_key: &str) -> Result<i64, StockError> {
        Ok(self.lots_for_item(item_key)?.iter().map(StockLot::quantity_on_hand).sum())
    }

    /// All lots of the item in FIFO order, exhausted ones included.
    pub fn lots_for_item(&self, item_key: &str) -> Result<Vec<StockLot>, StockError> {
        let key = ItemKey::parse(item_key)?;
        self.read(|tx| tx.lots_for_item(&key))
    }

    pub fn movements_for_lot(&self, lot_id: LotId) -> Result<Vec<MovementRecord>, StockError> {
        self.read(|tx| tx.movements_for_lot(lot_id))
    }

    /// Issue records, newest first.
    pub fn issued_items(&self) -> Result<Vec<IssueRecord>, StockError> {
        self.read(|tx| tx.issue_records())
    }

    /// Set the quantity at or below which the item is reported as low.
    #[instrument(skip(self))]
    pub fn set_minimum_stock(&self, item_key: &str, minimum: i64) -> Result<MinimumStock, StockError> {
        let threshold = MinimumStock::new(ItemKey::parse(item_key)?, minimum)?;
        self.in_transaction("set_minimum_stock", |tx| {
            tx.set_minimum_stock(threshold.clone())?;
            Ok(())
        })?;
        info!("minimum stock set");
        Ok(threshold)
    }

    /// On-hand totals for every item that has lots or a threshold.
    pub fn stock_summary(&self) -> Result<Vec<StockLevel>, StockError> {
        self.read(|tx| {
            let lots = tx.all_lots()?;
            let minimums = tx.minimum_stocks()?;
            summarize(&lots, &minimums).map_err(StoreError::from)
        })
    }

    /// Items at or below their minimum stock.
    pub fn low_stock(&self) -> Result<Vec<StockLevel>, StockError> {
        let mut levels = self.stock_summary()?;
        levels.retain(StockLevel::is_low);
        Ok(levels)
    }

    fn read<R>(&self, op: impl FnOnce(&mut S::Tx) -> Result<R, StoreError>) -> Result<R, StockError> {
        let mut tx = self.store.begin()?;
        let value = op(&mut tx)?;
        tx.rollback()?;
        Ok(value)
    }

    fn in_transaction<R>(
        &self,
        operation: &'static str,
        mut op: impl FnMut(&mut S::Tx) -> Result<R, StockError>,
    ) -> Result<R, StockError> {
        let mut attempt: u32 = 0;
        loop {
            let mut tx = self.store.begin()?;
            let value = match op(&mut tx) {
                Ok(value) => value,
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback() {
                        error!(operation, error = %rollback_err, "rollback failed");
                    }
                    return Err(err);
                }
            };

            match tx.commit() {
                Ok(()) => return Ok(value),
                Err(err) if err.is_conflict() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %err, "commit conflict; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
