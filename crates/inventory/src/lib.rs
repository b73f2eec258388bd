//! Stock lot domain module.
//!
//! This crate contains the business rules for lots, movements and FIFO
//! issuance, implemented purely as deterministic domain logic (no IO, no
//! storage). Persistence and transaction scope live in `lotkeeper-infra`.

pub mod adjustment;
pub mod error;
pub mod issue;
pub mod level;
pub mod lot;
pub mod movement;

pub use adjustment::{AdjustLot, ReceiveStock};
pub use error::StockError;
pub use issue::{
    plan_issue, Allocation, IssuePlan, IssueRecord, IssueRequest, IssueResult, ValidatedIssue,
};
pub use level::{summarize, MinimumStock, StockLevel};
pub use lot::{ItemKey, StockLot};
pub use movement::{Direction, MovementRecord, REASON_ISSUED, REASON_RECEIVED};
