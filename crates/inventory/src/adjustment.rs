//! Receiving new lots and manual per-lot corrections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotkeeper_core::{LotId, UserId};

use crate::error::StockError;
use crate::lot::{ItemKey, StockLot};
use crate::movement::{Direction, MovementRecord, REASON_RECEIVED};

/// Command: record a new receipt (lot) of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveStock {
    pub item_key: String,
    pub quantity: i64,
    pub actor_id: UserId,
    pub notes: Option<String>,
}

impl ReceiveStock {
    /// Build the new lot and, for a non-empty receipt, its inbound movement.
    pub fn into_lot(
        &self,
        lot_id: LotId,
        received_order: u64,
        received_at: DateTime<Utc>,
    ) -> Result<(StockLot, Option<MovementRecord>), StockError> {
        if self.quantity < 0 {
            return Err(StockError::invalid("quantity must be zero or greater"));
        }
        let item_key = ItemKey::parse(&self.item_key)?;
        let lot = StockLot::received(lot_id, item_key, self.quantity, received_order, received_at)?;

        let movement = if self.quantity > 0 {
            Some(MovementRecord::new(
                lot_id,
                self.quantity,
                Direction::In,
                REASON_RECEIVED,
                self.actor_id,
                received_at,
            )?)
        } else {
            None
        };

        Ok((lot, movement))
    }
}

/// Command: add to or remove from a single lot with a stated reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustLot {
    pub lot_id: LotId,
    /// Positive adds stock, negative removes it.
    pub delta: i64,
    pub reason: String,
    pub actor_id: UserId,
}

impl AdjustLot {
    pub fn validate(&self) -> Result<(), StockError> {
        if self.delta == 0 {
            return Err(StockError::invalid("delta cannot be zero"));
        }
        if self.reason.trim().is_empty() {
            return Err(StockError::invalid("reason is required"));
        }
        Ok(())
    }

    /// Apply to `lot` and return the movement to append.
    ///
    /// On error the lot is left unchanged.
    pub fn apply_to(&self, lot: &mut StockLot, at: DateTime<Utc>) -> Result<MovementRecord, StockError> {
        self.validate()?;
        if lot.lot_id() != self.lot_id {
            return Err(StockError::invalid("adjustment targets a different lot"));
        }

        let magnitude = self
            .delta
            .checked_abs()
            .ok_or_else(|| StockError::invalid("delta out of range"))?;
        let direction = if self.delta > 0 {
            lot.add(magnitude)?;
            Direction::In
        } else {
            if magnitude > lot.quantity_on_hand() {
                return Err(StockError::invalid(format!(
                    "cannot remove {magnitude} items, only {} in stock",
                    lot.quantity_on_hand()
                )));
            }
            lot.deduct(magnitude)?;
            Direction::Out
        };

        MovementRecord::new(self.lot_id, magnitude, direction, self.reason.trim(), self.actor_id, at)
            .map_err(StockError::from)
    }
}
