use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockbook_core::{
    BatchId, CommitReceipt, ConsumptionKind, EntryId, LifecycleStage, LocationId, LocationKind,
};
use stockbook_inventory::Component;
use uuid::Uuid;

pub const LEDGER_COMMITTED_CHANNEL: &str = "ledger.committed";
pub const SALES_RECORDED_CHANNEL: &str = "sales.recorded";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterLocationRequest {
    pub code: String,
    pub name: String,
    pub kind: LocationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordReceiptRequest {
    pub sku: String,
    pub product_name: String,
    pub location_id: LocationId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub source_reference: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    pub stage: Option<LifecycleStage>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptResponse {
    pub batch_id: BatchId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub batch_id: BatchId,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub quantity: i64,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdjustmentRequest {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    /// Signed: positive adds stock, negative removes it.
    pub quantity: i64,
    pub reason: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub counted: i64,
    pub reason: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryResponse {
    /// Absent when the operation had nothing to write.
    pub entry_id: Option<EntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitBatchRequest {
    pub quantity: i64,
    pub from_location: Option<LocationId>,
    pub destination: Option<LocationId>,
    pub note: Option<String>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeBatchesRequest {
    pub batch_ids: Vec<BatchId>,
    pub destination: Option<LocationId>,
    pub note: Option<String>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembleRequest {
    pub components: Vec<Component>,
    pub sku: String,
    pub product_name: String,
    pub quantity: i64,
    pub location_id: LocationId,
    pub note: Option<String>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceStageRequest {
    pub stage: LifecycleStage,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePlanRequest {
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub note: Option<String>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddPlanLineRequest {
    pub batch_id: BatchId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanActionRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConsumptionRequest {
    pub external_ref: String,
    pub sku: String,
    pub quantity: i64,
    pub event_date: NaiveDate,
    #[serde(default = "default_consumption_kind")]
    pub kind: ConsumptionKind,
    /// Attribute immediately instead of leaving the event for the backlog worker.
    #[serde(default)]
    pub attribute_now: bool,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBacklogRequest {
    pub limit: Option<usize>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Published after every committed ledger operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCommittedEvent {
    pub operation: String,
    pub operation_id: Option<Uuid>,
    pub batch_ids: Vec<BatchId>,
    pub entry_ids: Vec<EntryId>,
    pub committed_at: DateTime<Utc>,
}

impl LedgerCommittedEvent {
    pub fn new(operation: &str, batch_ids: Vec<BatchId>) -> Self {
        Self {
            operation: operation.to_string(),
            operation_id: None,
            batch_ids,
            entry_ids: Vec::new(),
            committed_at: Utc::now(),
        }
    }

    pub fn from_receipt(receipt: &CommitReceipt) -> Self {
        let mut batch_ids: Vec<BatchId> =
            receipt.entries.iter().map(|entry| entry.batch_id).collect();
        batch_ids.sort_unstable();
        batch_ids.dedup();
        Self {
            operation: receipt.kind.as_str().to_string(),
            operation_id: Some(receipt.operation_id),
            batch_ids,
            entry_ids: receipt.entry_ids(),
            committed_at: receipt.committed_at,
        }
    }
}

/// A sale or loss reported by a sales channel, consumed by the attribution worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SalesRecordedEvent {
    pub external_ref: String,
    pub sku: String,
    pub quantity: i64,
    pub event_date: NaiveDate,
    #[serde(default = "default_consumption_kind")]
    pub kind: ConsumptionKind,
}

fn default_actor() -> String {
    "warehouse-agent".to_string()
}

fn default_consumption_kind() -> ConsumptionKind {
    ConsumptionKind::Sale
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sales_events_default_to_sale() {
        let event: SalesRecordedEvent = serde_json::from_str(
            r#"{"external_ref":"amz-114","sku":"SKU-A","quantity":2,"event_date":"2025-04-02"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, ConsumptionKind::Sale);
        assert_eq!(event.quantity, 2);
    }

    #[test]
    fn requests_default_the_actor() {
        let request: PlanActionRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.actor, "warehouse-agent");

        let loss: RecordConsumptionRequest = serde_json::from_str(
            r#"{"external_ref":"cnt-9","sku":"SKU-A","quantity":1,"event_date":"2025-04-02","kind":"loss"}"#,
        )
        .unwrap();
        assert_eq!(loss.kind, ConsumptionKind::Loss);
        assert!(!loss.attribute_now);
    }
}
