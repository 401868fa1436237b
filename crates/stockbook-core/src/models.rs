use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type EntryId = i64;
pub type BatchId = Uuid;
pub type LocationId = Uuid;
pub type PlanId = Uuid;
pub type EventId = Uuid;

/// Why a ledger entry exists. Closed set: reports and attribution match on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    InitialReceipt,
    TransferOut,
    TransferIn,
    AdjustmentAdd,
    AdjustmentRemove,
    Reconciliation,
    AssemblyConsumption,
    AssemblyOutput,
    BatchSplitOut,
    BatchSplitIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Either,
}

impl MovementType {
    pub const ALL: [MovementType; 10] = [
        MovementType::InitialReceipt,
        MovementType::TransferOut,
        MovementType::TransferIn,
        MovementType::AdjustmentAdd,
        MovementType::AdjustmentRemove,
        MovementType::Reconciliation,
        MovementType::AssemblyConsumption,
        MovementType::AssemblyOutput,
        MovementType::BatchSplitOut,
        MovementType::BatchSplitIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::InitialReceipt => "initial_receipt",
            MovementType::TransferOut => "transfer_out",
            MovementType::TransferIn => "transfer_in",
            MovementType::AdjustmentAdd => "adjustment_add",
            MovementType::AdjustmentRemove => "adjustment_remove",
            MovementType::Reconciliation => "reconciliation",
            MovementType::AssemblyConsumption => "assembly_consumption",
            MovementType::AssemblyOutput => "assembly_output",
            MovementType::BatchSplitOut => "batch_split_out",
            MovementType::BatchSplitIn => "batch_split_in",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    pub fn direction(&self) -> Direction {
        match self {
            MovementType::InitialReceipt
            | MovementType::TransferIn
            | MovementType::AdjustmentAdd
            | MovementType::AssemblyOutput
            | MovementType::BatchSplitIn => Direction::Inbound,
            MovementType::TransferOut
            | MovementType::AdjustmentRemove
            | MovementType::AssemblyConsumption
            | MovementType::BatchSplitOut => Direction::Outbound,
            MovementType::Reconciliation => Direction::Either,
        }
    }

    /// Whether a signed quantity is consistent with this movement's direction.
    pub fn admits(&self, quantity: i64) -> bool {
        match self.direction() {
            Direction::Inbound => quantity > 0,
            Direction::Outbound => quantity < 0,
            Direction::Either => quantity != 0,
        }
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logistics stage of a batch. Recorded as history; never gates ledger operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Ordered,
    Factory,
    Inspected,
    ReadyToShip,
    InTransit,
    Warehouse,
    Amazon,
}

impl LifecycleStage {
    pub const ALL: [LifecycleStage; 7] = [
        LifecycleStage::Ordered,
        LifecycleStage::Factory,
        LifecycleStage::Inspected,
        LifecycleStage::ReadyToShip,
        LifecycleStage::InTransit,
        LifecycleStage::Warehouse,
        LifecycleStage::Amazon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleStage::Ordered => "ordered",
            LifecycleStage::Factory => "factory",
            LifecycleStage::Inspected => "inspected",
            LifecycleStage::ReadyToShip => "ready_to_ship",
            LifecycleStage::InTransit => "in_transit",
            LifecycleStage::Warehouse => "warehouse",
            LifecycleStage::Amazon => "amazon",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|stage| stage.as_str() == value)
    }
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Batch {
    pub id: BatchId,
    pub sku: String,
    pub product_name: String,
    pub original_quantity: i64,
    pub unit_cost: Decimal,
    /// Receipt date used for FIFO ordering. Derived batches inherit the earliest
    /// receipt date among their parents.
    pub received_at: DateTime<Utc>,
    pub stage: LifecycleStage,
    pub source_reference: Option<String>,
    pub parents: Vec<BatchId>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Supplier,
    Warehouse,
    FulfillmentCenter,
    Transit,
}

impl LocationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocationKind::Supplier => "supplier",
            LocationKind::Warehouse => "warehouse",
            LocationKind::FulfillmentCenter => "fulfillment_center",
            LocationKind::Transit => "transit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            LocationKind::Supplier,
            LocationKind::Warehouse,
            LocationKind::FulfillmentCenter,
            LocationKind::Transit,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub id: LocationId,
    pub code: String,
    pub name: String,
    pub kind: LocationKind,
    pub created_at: DateTime<Utc>,
}

/// A movement not yet written to the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewEntry {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub movement_type: MovementType,
    pub unit_cost: Decimal,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub id: EntryId,
    /// Groups the entries written by one atomic operation.
    pub operation_id: Uuid,
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub movement_type: MovementType,
    pub unit_cost: Decimal,
    pub total_cost: Decimal,
    pub reason: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageTransition {
    pub batch_id: BatchId,
    pub from: LifecycleStage,
    pub to: LifecycleStage,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StockPosition {
    pub batch_id: BatchId,
    pub sku: String,
    pub product_name: String,
    pub location_id: LocationId,
    pub total_in: i64,
    pub total_out: i64,
    pub on_hand: i64,
    pub unit_cost: Decimal,
    pub total_value: Decimal,
    pub first_received_at: DateTime<Utc>,
    pub last_movement_at: DateTime<Utc>,
    /// Lowest entry id contributing to the position; breaks receipt-date ties by commit order.
    pub first_entry_id: EntryId,
}

impl StockPosition {
    pub fn is_depleted(&self) -> bool {
        self.on_hand <= 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PositionFilter {
    pub batch_id: Option<BatchId>,
    pub location_id: Option<LocationId>,
    pub sku: Option<String>,
    #[serde(default)]
    pub include_depleted: bool,
}

impl PositionFilter {
    pub fn for_batch(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Self::default()
        }
    }

    pub fn for_sku(sku: impl Into<String>) -> Self {
        Self {
            sku: Some(sku.into()),
            ..Self::default()
        }
    }

    pub fn at(batch_id: BatchId, location_id: LocationId) -> Self {
        Self {
            batch_id: Some(batch_id),
            location_id: Some(location_id),
            include_depleted: true,
            ..Self::default()
        }
    }

    pub fn with_depleted(mut self) -> Self {
        self.include_depleted = true;
        self
    }

    pub fn matches(&self, position: &StockPosition) -> bool {
        self.batch_id.is_none_or(|id| id == position.batch_id)
            && self.location_id.is_none_or(|id| id == position.location_id)
            && self.sku.as_deref().is_none_or(|sku| sku == position.sku)
            && (self.include_depleted || !position.is_depleted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Booked,
    Discarded,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Draft => "draft",
            PlanStatus::Booked => "booked",
            PlanStatus::Discarded => "discarded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(PlanStatus::Draft),
            "booked" => Some(PlanStatus::Booked),
            "discarded" => Some(PlanStatus::Discarded),
            _ => None,
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferLine {
    pub batch_id: BatchId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferPlan {
    pub id: PlanId,
    pub from_location: LocationId,
    pub to_location: LocationId,
    pub status: PlanStatus,
    pub lines: Vec<TransferLine>,
    pub note: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// Quantity held by one draft plan line against its source location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reservation {
    pub plan_id: PlanId,
    pub plan_created_at: DateTime<Utc>,
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub quantity: i64,
}

impl Reservation {
    /// Drafting order between plans: creation time, then id.
    pub fn drafted_before(&self, plan_id: PlanId, drafted_at: DateTime<Utc>) -> bool {
        (self.plan_created_at, self.plan_id) < (drafted_at, plan_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumptionKind {
    Sale,
    Loss,
}

impl ConsumptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumptionKind::Sale => "sale",
            ConsumptionKind::Loss => "loss",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sale" => Some(ConsumptionKind::Sale),
            "loss" => Some(ConsumptionKind::Loss),
            _ => None,
        }
    }
}

/// An external sale or loss waiting to be (or already) attributed to batches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumptionEvent {
    pub id: EventId,
    pub external_ref: String,
    pub sku: String,
    pub quantity: i64,
    pub event_date: NaiveDate,
    pub kind: ConsumptionKind,
    pub recorded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionDraw {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub cogs: Decimal,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionRecord {
    pub event_id: EventId,
    /// Operation that wrote the outbound entries, one per draw, in draw order.
    pub operation_id: Uuid,
    pub sku: String,
    pub kind: ConsumptionKind,
    pub event_date: NaiveDate,
    pub requested: i64,
    pub draws: Vec<AttributionDraw>,
    pub unattributed: i64,
    pub cogs: Decimal,
    pub attributed_at: DateTime<Utc>,
}

impl AttributionRecord {
    pub fn attributed(&self) -> i64 {
        self.draws.iter().map(|draw| draw.quantity).sum()
    }

    pub fn shortfall(&self) -> Option<UnattributedShortfall> {
        (self.unattributed > 0).then(|| UnattributedShortfall {
            event_id: self.event_id,
            sku: self.sku.clone(),
            units: self.unattributed,
        })
    }
}

/// Consumption that found no supply. Reported, never raised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnattributedShortfall {
    pub event_id: EventId,
    pub sku: String,
    pub units: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntryFilter {
    pub batch_id: Option<BatchId>,
    pub location_id: Option<LocationId>,
    pub operation_id: Option<Uuid>,
}

impl EntryFilter {
    pub fn for_batch(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.batch_id.is_none_or(|id| id == entry.batch_id)
            && self.location_id.is_none_or(|id| id == entry.location_id)
            && self.operation_id.is_none_or(|id| id == entry.operation_id)
    }
}
