use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{BatchId, LedgerEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Receipt,
    Transfer,
    Adjustment,
    Reconciliation,
    Split,
    Merge,
    Assembly,
    PlanBooked,
    PlanDiscarded,
    Attribution,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Receipt => "receipt",
            OperationKind::Transfer => "transfer",
            OperationKind::Adjustment => "adjustment",
            OperationKind::Reconciliation => "reconciliation",
            OperationKind::Split => "split",
            OperationKind::Merge => "merge",
            OperationKind::Assembly => "assembly",
            OperationKind::PlanBooked => "plan_booked",
            OperationKind::PlanDiscarded => "plan_discarded",
            OperationKind::Attribution => "attribution",
        }
    }
}

/// What one committed operation wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub created_batches: Vec<BatchId>,
    pub entries: Vec<LedgerEntry>,
    pub committed_at: DateTime<Utc>,
}

impl CommitReceipt {
    pub fn entry_ids(&self) -> Vec<i64> {
        self.entries.iter().map(|entry| entry.id).collect()
    }
}
