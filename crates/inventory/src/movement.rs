use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lotkeeper_core::{DomainError, DomainResult, Entity, IssueId, LotId, MovementId, UserId};

/// Reason code recorded for FIFO issuance.
pub const REASON_ISSUED: &str = "Issued";

/// Reason code recorded when a lot is received.
pub const REASON_RECEIVED: &str = "Received";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    pub fn parse(raw: &str) -> DomainResult<Self> {
        match raw {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(DomainError::validation(format!("unknown direction '{other}'"))),
        }
    }
}

/// Immutable audit entry for one quantity change on one lot.
///
/// Append-only: ledgers never update or delete these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecord {
    pub movement_id: MovementId,
    pub lot_id: LotId,
    /// Positive magnitude; the sign lives in `direction`.
    pub quantity_delta: i64,
    pub direction: Direction,
    pub reason_code: String,
    pub actor_id: UserId,
    pub recorded_at: DateTime<Utc>,
    /// Set when the movement is part of an issuance.
    pub issue_id: Option<IssueId>,
}

impl MovementRecord {
    pub fn new(
        lot_id: LotId,
        quantity_delta: i64,
        direction: Direction,
        reason_code: impl Into<String>,
        actor_id: UserId,
        recorded_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        if quantity_delta <= 0 {
            return Err(DomainError::validation("movement quantity must be positive"));
        }
        let reason_code = reason_code.into();
        if reason_code.trim().is_empty() {
            return Err(DomainError::validation("movement reason cannot be empty"));
        }
        Ok(Self {
            movement_id: MovementId::new(),
            lot_id,
            quantity_delta,
            direction,
            reason_code,
            actor_id,
            recorded_at,
            issue_id: None,
        })
    }

    pub fn with_issue(mut self, issue_id: IssueId) -> Self {
        self.issue_id = Some(issue_id);
        self
    }

    /// Quantity change with sign applied (`out` is negative).
    pub fn signed_delta(&self) -> i64 {
        match self.direction {
            Direction::In => self.quantity_delta,
            Direction::Out => -self.quantity_delta,
        }
    }
}

impl Entity for MovementRecord {
    type Id = MovementId;

    fn id(&self) -> &Self::Id {
        &self.movement_id
    }
}
