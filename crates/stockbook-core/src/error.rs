use thiserror::Error;
use uuid::Uuid;

use crate::models::{BatchId, EventId, LocationId, PlanId, PlanStatus};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LedgerError {
    #[error("invalid movement: {0}")]
    InvalidMovement(String),

    #[error(
        "only {available} units now available for batch {batch_id} at location {location_id} ({requested} requested)"
    )]
    InsufficientStock {
        batch_id: BatchId,
        location_id: LocationId,
        requested: i64,
        available: i64,
    },

    #[error(
        "batch {batch_id} at location {location_id} changed concurrently: expected {expected} units, found {actual}"
    )]
    Conflict {
        batch_id: BatchId,
        location_id: LocationId,
        expected: i64,
        actual: i64,
    },

    #[error("merge requires at least two distinct batches")]
    EmptyMergeSet,

    #[error("cannot merge batches of different products: {expected} and {found}")]
    MixedProduct { expected: String, found: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    #[error("transfer plan {plan_id} is {status}, not draft")]
    PlanNotDraft { plan_id: PlanId, status: PlanStatus },

    #[error("consumption event {event_id} is already attributed")]
    AlreadyAttributed { event_id: EventId },

    #[error("storage failure: {0}")]
    Storage(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    pub fn invalid(message: impl Into<String>) -> Self {
        LedgerError::InvalidMovement(message.into())
    }

    pub fn batch_not_found(id: BatchId) -> Self {
        LedgerError::NotFound { kind: "batch", id }
    }

    pub fn location_not_found(id: LocationId) -> Self {
        LedgerError::NotFound {
            kind: "location",
            id,
        }
    }

    pub fn plan_not_found(id: PlanId) -> Self {
        LedgerError::NotFound {
            kind: "transfer plan",
            id,
        }
    }

    pub fn event_not_found(id: EventId) -> Self {
        LedgerError::NotFound {
            kind: "consumption event",
            id,
        }
    }

    /// Outcomes of racing another writer; re-planning against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientStock { .. } | LedgerError::Conflict { .. }
        )
    }

    /// Input and precondition violations. These are never retried automatically.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidMovement(_)
                | LedgerError::EmptyMergeSet
                | LedgerError::MixedProduct { .. }
                | LedgerError::NotFound { .. }
        )
    }
}
