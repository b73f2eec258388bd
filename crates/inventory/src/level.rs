//! Per-item stock levels: on-hand totals and minimum-stock thresholds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use lotkeeper_core::{DomainError, DomainResult};

use crate::lot::{ItemKey, StockLot};

/// Minimum quantity an item should keep on hand before it counts as low.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimumStock {
    pub item_key: ItemKey,
    pub minimum: i64,
}

impl MinimumStock {
    pub fn new(item_key: ItemKey, minimum: i64) -> DomainResult<Self> {
        if minimum < 0 {
            return Err(DomainError::validation("minimum stock must be zero or greater"));
        }
        Ok(Self { item_key, minimum })
    }
}

/// Total on hand for one item across all of its lots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub item_key: ItemKey,
    pub total_quantity: i64,
    pub lot_count: usize,
    pub minimum_stock: Option<i64>,
}

impl StockLevel {
    /// At or below the threshold. Items without a threshold are never low.
    pub fn is_low(&self) -> bool {
        self.minimum_stock
            .is_some_and(|minimum| self.total_quantity <= minimum)
    }
}

/// One level per item that has lots or a threshold, ordered by item key.
///
/// An item with a threshold but no lots reports zero on hand.
pub fn summarize(lots: &[StockLot], minimums: &[MinimumStock]) -> DomainResult<Vec<StockLevel>> {
    let mut levels: BTreeMap<ItemKey, StockLevel> = BTreeMap::new();

    for lot in lots {
        let level = levels
            .entry(lot.item_key().clone())
            .or_insert_with(|| StockLevel {
                item_key: lot.item_key().clone(),
                total_quantity: 0,
                lot_count: 0,
                minimum_stock: None,
            });
        level.total_quantity = level
            .total_quantity
            .checked_add(lot.quantity_on_hand())
            .ok_or_else(|| DomainError::invariant(format!("stock total of {} overflows", lot.item_key())))?;
        level.lot_count += 1;
    }

    for threshold in minimums {
        levels
            .entry(threshold.item_key.clone())
            .or_insert_with(|| StockLevel {
                item_key: threshold.item_key.clone(),
                total_quantity: 0,
                lot_count: 0,
                minimum_stock: None,
            })
            .minimum_stock = Some(threshold.minimum);
    }

    Ok(levels.into_values().collect())
}
