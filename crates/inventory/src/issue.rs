//! FIFO issuance: request validation, allocation planning and results.
//!
//! Planning is pure. It never touches storage; the caller applies the plan
//! inside its own transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotkeeper_core::{DomainResult, IssueId, LotId, UserId};

use crate::error::StockError;
use crate::lot::{sort_fifo, ItemKey, StockLot};
use crate::movement::{Direction, MovementRecord, REASON_ISSUED};

/// Request to remove stock of one item for external use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequest {
    pub item_key: String,
    pub quantity: i64,
    pub actor_id: UserId,
    pub notes: Option<String>,
}

/// An `IssueRequest` whose item key and quantity passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedIssue {
    pub item_key: ItemKey,
    pub quantity: i64,
}

impl IssueRequest {
    pub fn new(
        item_key: impl Into<String>,
        quantity: i64,
        actor_id: UserId,
        notes: Option<String>,
    ) -> Self {
        Self {
            item_key: item_key.into(),
            quantity,
            actor_id,
            notes,
        }
    }

    pub fn validate(&self) -> Result<ValidatedIssue, StockError> {
        if self.quantity <= 0 {
            return Err(StockError::invalid(format!(
                "quantity must be a positive integer, got {}",
                self.quantity
            )));
        }
        let item_key = ItemKey::parse(&self.item_key)?;
        Ok(ValidatedIssue {
            item_key,
            quantity: self.quantity,
        })
    }
}

/// Quantity drawn from a single lot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub lot_id: LotId,
    pub quantity: i64,
}

/// Deterministic FIFO allocation of a request across lots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuePlan {
    pub item_key: ItemKey,
    pub requested: i64,
    pub available: i64,
    pub allocations: Vec<Allocation>,
}

impl IssuePlan {
    pub fn total_allocated(&self) -> i64 {
        self.allocations.iter().map(|a| a.quantity).sum()
    }

    /// One outbound `Issued` movement per allocation, in allocation order.
    pub fn movements(
        &self,
        issue_id: IssueId,
        actor_id: UserId,
        issued_at: DateTime<Utc>,
    ) -> DomainResult<Vec<MovementRecord>> {
        self.allocations
            .iter()
            .map(|a| {
                MovementRecord::new(a.lot_id, a.quantity, Direction::Out, REASON_ISSUED, actor_id, issued_at)
                    .map(|m| m.with_issue(issue_id))
            })
            .collect()
    }
}

/// Plan a FIFO issuance of `requested` units of `item_key` over `lots`.
///
/// Lots of other items and exhausted lots are ignored. Lots are drawn oldest
/// `received_order` first, `lot_id` ascending on ties. Availability is checked
/// before anything is allocated, so a short request plans nothing.
pub fn plan_issue(item_key: &ItemKey, requested: i64, lots: &[StockLot]) -> Result<IssuePlan, StockError> {
    if requested <= 0 {
        return Err(StockError::invalid(format!(
            "quantity must be a positive integer, got {requested}"
        )));
    }

    let mut candidates: Vec<StockLot> = lots
        .iter()
        .filter(|l| l.item_key() == item_key && l.quantity_on_hand() > 0)
        .cloned()
        .collect();
    sort_fifo(&mut candidates);

    let available = candidates
        .iter()
        .try_fold(0i64, |acc, l| acc.checked_add(l.quantity_on_hand()))
        .ok_or_else(|| StockError::invalid(format!("available quantity of {item_key} overflows")))?;

    if available < requested {
        return Err(StockError::InsufficientStock {
            item_key: item_key.to_string(),
            requested,
            available,
        });
    }

    let mut remaining = requested;
    let mut allocations = Vec::new();
    for lot in &candidates {
        if remaining == 0 {
            break;
        }
        let take = lot.quantity_on_hand().min(remaining);
        allocations.push(Allocation {
            lot_id: lot.lot_id(),
            quantity: take,
        });
        remaining -= take;
    }

    Ok(IssuePlan {
        item_key: item_key.clone(),
        requested,
        available,
        allocations,
    })
}

/// Caller-facing confirmation of a committed issuance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueResult {
    pub issue_id: IssueId,
    pub request: IssueRequest,
    pub allocations: Vec<Allocation>,
    pub movements: Vec<MovementRecord>,
    pub issued_at: DateTime<Utc>,
}

impl IssueResult {
    pub fn total_issued(&self) -> i64 {
        self.allocations.iter().map(|a| a.quantity).sum()
    }
}

/// Persisted summary of one issuance (one per successful `issue`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRecord {
    pub issue_id: IssueId,
    pub item_key: ItemKey,
    pub quantity: i64,
    /// Oldest lot drawn from.
    pub first_lot_id: LotId,
    pub issued_by: UserId,
    pub notes: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl IssueRecord {
    pub fn for_plan(
        issue_id: IssueId,
        plan: &IssuePlan,
        request: &IssueRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, StockError> {
        let first = plan
            .allocations
            .first()
            .ok_or_else(|| StockError::invalid("issue plan has no allocations"))?;
        Ok(Self {
            issue_id,
            item_key: plan.item_key.clone(),
            quantity: plan.requested,
            first_lot_id: first.lot_id,
            issued_by: request.actor_id,
            notes: request.notes.clone(),
            issued_at,
        })
    }
}
