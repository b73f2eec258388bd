//! FIFO allocator: applies an issuance plan through a caller-owned transaction.

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use lotkeeper_core::IssueId;
use lotkeeper_inventory::{plan_issue, IssueRecord, IssueRequest, IssueResult, StockError};

use crate::store::{LotStore, MovementLedger};

/// Issue `request` inside `tx`, drawing from the oldest lots first.
///
/// Every check happens before the first write: an invalid request, an unknown
/// item or a shortfall returns without touching `tx`. A store failure while
/// writing surfaces as `PersistenceFailure`; the caller must then drop (roll
/// back) the transaction, which may already hold partial writes.
#[instrument(
    skip(tx, request),
    fields(item_key = %request.item_key, quantity = request.quantity, actor_id = %request.actor_id),
    err
)]
pub fn allocate_issue<T>(
    tx: &mut T,
    request: &IssueRequest,
    issued_at: DateTime<Utc>,
) -> Result<IssueResult, StockError>
where
    T: LotStore + MovementLedger + ?Sized,
{
    let valid = request.validate()?;

    let lots = tx.list_available_lots(&valid.item_key)?;
    if lots.is_empty() && !tx.has_lots(&valid.item_key)? {
        return Err(StockError::ItemNotFound {
            item_key: valid.item_key.to_string(),
        });
    }

    let plan = plan_issue(&valid.item_key, valid.quantity, &lots)?;
    let issue_id = IssueId::new();
    let movements = plan.movements(issue_id, request.actor_id, issued_at)?;
    let record = IssueRecord::for_plan(issue_id, &plan, request, issued_at)?;

    for (allocation, movement) in plan.allocations.iter().zip(&movements) {
        tx.apply_deduction(allocation.lot_id, allocation.quantity)?;
        tx.append(movement.clone())?;
        debug!(lot_id = %allocation.lot_id, quantity = allocation.quantity, "deducted from lot");
    }
    tx.record_issue(record)?;

    Ok(IssueResult {
        issue_id,
        request: request.clone(),
        allocations: plan.allocations,
        movements,
        issued_at,
    })
}
