use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotkeeper_core::{DomainError, DomainResult, Entity, LotId, ValueObject, Versioned};

/// Logical item identifier shared by every lot of the same item.
///
/// Trimmed and non-empty; matching is exact and case-sensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemKey(String);

impl ItemKey {
    pub fn parse(raw: impl AsRef<str>) -> DomainResult<Self> {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Err(DomainError::validation("item key cannot be empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for ItemKey {}

impl core::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ItemKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ItemKey> for String {
    fn from(value: ItemKey) -> Self {
        value.0
    }
}

/// One receipt of an item, with its own remaining quantity.
///
/// An exhausted lot (`quantity_on_hand == 0`) stays a valid record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLot {
    lot_id: LotId,
    item_key: ItemKey,
    quantity_on_hand: i64,
    received_order: u64,
    received_at: DateTime<Utc>,
    version: u64,
}

impl StockLot {
    /// A freshly received lot (version 0).
    pub fn received(
        lot_id: LotId,
        item_key: ItemKey,
        quantity: i64,
        received_order: u64,
        received_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        Self::restore(lot_id, item_key, quantity, received_order, received_at, 0)
    }

    /// Rebuild a lot from persisted state.
    pub fn restore(
        lot_id: LotId,
        item_key: ItemKey,
        quantity_on_hand: i64,
        received_order: u64,
        received_at: DateTime<Utc>,
        version: u64,
    ) -> DomainResult<Self> {
        if quantity_on_hand < 0 {
            return Err(DomainError::invariant("lot quantity cannot be negative"));
        }
        Ok(Self {
            lot_id,
            item_key,
            quantity_on_hand,
            received_order,
            received_at,
            version,
        })
    }

    pub fn lot_id(&self) -> LotId {
        self.lot_id
    }

    pub fn item_key(&self) -> &ItemKey {
        &self.item_key
    }

    pub fn quantity_on_hand(&self) -> i64 {
        self.quantity_on_hand
    }

    pub fn received_order(&self) -> u64 {
        self.received_order
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.quantity_on_hand == 0
    }

    /// FIFO precedence: oldest receipt first, lot id breaks ties.
    pub fn fifo_key(&self) -> (u64, LotId) {
        (self.received_order, self.lot_id)
    }

    pub fn deduct(&mut self, amount: i64) -> DomainResult<()> {
        if amount <= 0 {
            return Err(DomainError::validation("deduction must be positive"));
        }
        if amount > self.quantity_on_hand {
            return Err(DomainError::invariant(format!(
                "lot {} holds {}, cannot deduct {}",
                self.lot_id, self.quantity_on_hand, amount
            )));
        }
        self.quantity_on_hand -= amount;
        self.version += 1;
        Ok(())
    }

    pub fn add(&mut self, amount: i64) -> DomainResult<()> {
        if amount <= 0 {
            return Err(DomainError::validation("addition must be positive"));
        }
        self.quantity_on_hand = self
            .quantity_on_hand
            .checked_add(amount)
            .ok_or_else(|| DomainError::invariant("lot quantity overflow"))?;
        self.version += 1;
        Ok(())
    }
}

impl Entity for StockLot {
    type Id = LotId;

    fn id(&self) -> &Self::Id {
        &self.lot_id
    }
}

impl Versioned for StockLot {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Sort lots into FIFO order in place.
pub(crate) fn sort_fifo(lots: &mut [StockLot]) {
    lots.sort_by_key(StockLot::fifo_key);
}
