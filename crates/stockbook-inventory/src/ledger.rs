use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockbook_core::{
    AvailabilityCheck, Batch, BatchId, Commit, CommitReceipt, EntryFilter, EntryId, LedgerEntry,
    LedgerError, LedgerResult, LedgerStore, LifecycleStage, Location, LocationId, LocationKind,
    MovementType, NewEntry, OperationKind, PositionFilter, ReservationScope, StageTransition,
    StockPosition, round_cost,
};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub sku: String,
    pub product_name: String,
    pub location_id: LocationId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub source_reference: Option<String>,
    /// Defaults to the time of recording.
    pub received_at: Option<DateTime<Utc>>,
    pub stage: Option<LifecycleStage>,
}

/// Receipts, transfers, adjustments and the read paths over the ledger.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub async fn register_location(
        &self,
        code: &str,
        name: &str,
        kind: LocationKind,
    ) -> LedgerResult<Location> {
        let code = code.trim();
        if code.is_empty() {
            return Err(LedgerError::invalid("location code is required"));
        }
        self.store
            .register_location(Location {
                id: Uuid::new_v4(),
                code: code.to_string(),
                name: name.trim().to_string(),
                kind,
                created_at: Utc::now(),
            })
            .await
    }

    /// Writes a single entry. Every other write in this crate is a bundle of these.
    pub async fn append(&self, entry: NewEntry, actor: &str) -> LedgerResult<EntryId> {
        let kind = operation_for(entry.movement_type);
        let receipt = self
            .store
            .commit(Commit::new(kind, actor).with_entry(entry))
            .await?;
        first_entry_id(&receipt)
    }

    pub async fn record_receipt(&self, receipt: Receipt, actor: &str) -> LedgerResult<BatchId> {
        if receipt.quantity <= 0 {
            return Err(LedgerError::invalid("received quantity must be positive"));
        }
        let sku = receipt.sku.trim();
        if sku.is_empty() {
            return Err(LedgerError::invalid("sku is required"));
        }

        // Cost basis is held at COST_SCALE by every backend.
        let unit_cost = round_cost(receipt.unit_cost);
        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            product_name: receipt.product_name.trim().to_string(),
            original_quantity: receipt.quantity,
            unit_cost,
            received_at: receipt.received_at.unwrap_or(now),
            stage: receipt.stage.unwrap_or(LifecycleStage::Warehouse),
            source_reference: receipt.source_reference,
            parents: Vec::new(),
            note: None,
            created_at: now,
        };
        let batch_id = batch.id;
        let entry = NewEntry {
            batch_id,
            location_id: receipt.location_id,
            quantity: receipt.quantity,
            movement_type: MovementType::InitialReceipt,
            unit_cost,
            reason: batch.source_reference.clone(),
        };

        self.store
            .commit(
                Commit::new(OperationKind::Receipt, actor)
                    .with_batch(batch)
                    .with_entry(entry),
            )
            .await?;

        info!(%batch_id, sku, quantity = receipt.quantity, "batch received");
        Ok(batch_id)
    }

    /// Outbound half of a booked transfer. Honors every draft reservation on the source.
    pub async fn record_transfer_out(
        &self,
        batch_id: BatchId,
        from: LocationId,
        quantity: i64,
        actor: &str,
    ) -> LedgerResult<EntryId> {
        let batch = self.known_batch(batch_id).await?;
        let commit = Commit::new(OperationKind::Transfer, actor)
            .with_check(AvailabilityCheck {
                batch_id,
                location_id: from,
                quantity: positive(quantity)?,
                scope: ReservationScope::AllDrafts,
            })
            .with_entry(movement(&batch, from, -quantity, MovementType::TransferOut, None));
        first_entry_id(&self.store.commit(commit).await?)
    }

    /// Inbound half of a booked transfer.
    pub async fn record_transfer_in(
        &self,
        batch_id: BatchId,
        to: LocationId,
        quantity: i64,
        actor: &str,
    ) -> LedgerResult<EntryId> {
        let batch = self.known_batch(batch_id).await?;
        let entry = movement(&batch, to, positive(quantity)?, MovementType::TransferIn, None);
        first_entry_id(
            &self
                .store
                .commit(Commit::new(OperationKind::Transfer, actor).with_entry(entry))
                .await?,
        )
    }

    /// Both halves of a transfer in one commit.
    pub async fn transfer(
        &self,
        batch_id: BatchId,
        from: LocationId,
        to: LocationId,
        quantity: i64,
        actor: &str,
    ) -> LedgerResult<CommitReceipt> {
        if from == to {
            return Err(LedgerError::invalid("transfer source and destination match"));
        }
        let batch = self.known_batch(batch_id).await?;
        let quantity = positive(quantity)?;
        let commit = Commit::new(OperationKind::Transfer, actor)
            .with_check(AvailabilityCheck {
                batch_id,
                location_id: from,
                quantity,
                scope: ReservationScope::AllDrafts,
            })
            .with_entry(movement(&batch, from, -quantity, MovementType::TransferOut, None))
            .with_entry(movement(&batch, to, quantity, MovementType::TransferIn, None));
        self.store.commit(commit).await
    }

    pub async fn record_adjustment(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
        signed_quantity: i64,
        reason: &str,
        actor: &str,
    ) -> LedgerResult<EntryId> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::invalid("adjustments require a reason"));
        }
        let batch = self.known_batch(batch_id).await?;
        let movement_type = if signed_quantity >= 0 {
            MovementType::AdjustmentAdd
        } else {
            MovementType::AdjustmentRemove
        };
        self.append(
            movement(
                &batch,
                location_id,
                signed_quantity,
                movement_type,
                Some(reason.to_string()),
            ),
            actor,
        )
        .await
    }

    /// Brings a position in line with a physical count. Returns `None` when nothing differs.
    pub async fn reconcile(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
        counted: i64,
        reason: &str,
        actor: &str,
    ) -> LedgerResult<Option<EntryId>> {
        if counted < 0 {
            return Err(LedgerError::invalid("counted quantity cannot be negative"));
        }
        let batch = self.known_batch(batch_id).await?;
        let on_hand = self.on_hand(batch_id, location_id).await?;
        let difference = counted - on_hand;
        if difference == 0 {
            return Ok(None);
        }

        let entry = movement(
            &batch,
            location_id,
            difference,
            MovementType::Reconciliation,
            Some(reason.trim().to_string()).filter(|reason| !reason.is_empty()),
        );
        let commit = Commit::new(OperationKind::Reconciliation, actor)
            .with_entry(entry)
            .expecting(batch_id, location_id, on_hand);
        let receipt = self.store.commit(commit).await?;

        info!(%batch_id, %location_id, on_hand, counted, "position reconciled");
        first_entry_id(&receipt).map(Some)
    }

    pub async fn batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.store
            .batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::batch_not_found(batch_id))
    }

    pub async fn ledger_for(&self, batch_id: BatchId) -> LedgerResult<Vec<LedgerEntry>> {
        self.batch(batch_id).await?;
        self.store.entries(&EntryFilter::for_batch(batch_id)).await
    }

    pub async fn positions_for(&self, filter: &PositionFilter) -> LedgerResult<Vec<StockPosition>> {
        self.store.positions(filter).await
    }

    pub async fn on_hand(&self, batch_id: BatchId, location_id: LocationId) -> LedgerResult<i64> {
        Ok(self
            .store
            .positions(&PositionFilter::at(batch_id, location_id))
            .await?
            .iter()
            .map(|position| position.on_hand)
            .sum())
    }

    /// Net quantity across every location.
    pub async fn net_position(&self, batch_id: BatchId) -> LedgerResult<i64> {
        Ok(self
            .store
            .positions(&PositionFilter::for_batch(batch_id).with_depleted())
            .await?
            .iter()
            .map(|position| position.on_hand)
            .sum())
    }

    /// Every ancestor recorded by split, merge or assembly, nearest first.
    pub async fn lineage(&self, batch_id: BatchId) -> LedgerResult<Vec<Batch>> {
        let root = self.batch(batch_id).await?;
        let mut seen: HashSet<BatchId> = HashSet::from([root.id]);
        let mut queue: VecDeque<BatchId> = root.parents.into_iter().collect();
        let mut ancestors = Vec::new();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(parent) = self.store.batch(id).await? {
                queue.extend(parent.parents.iter().copied());
                ancestors.push(parent);
            }
        }

        Ok(ancestors)
    }

    /// Records a logistics stage change. Re-entering the current stage is a no-op.
    pub async fn advance_stage(
        &self,
        batch_id: BatchId,
        stage: LifecycleStage,
        actor: &str,
    ) -> LedgerResult<Option<StageTransition>> {
        let batch = self.batch(batch_id).await?;
        if batch.stage == stage {
            return Ok(None);
        }

        let transition = StageTransition {
            batch_id,
            from: batch.stage,
            to: stage,
            actor: actor.to_string(),
            recorded_at: Utc::now(),
        };
        self.store.record_stage(transition.clone()).await?;
        info!(%batch_id, from = %transition.from, to = %transition.to, "batch stage advanced");
        Ok(Some(transition))
    }

    pub async fn stage_history(&self, batch_id: BatchId) -> LedgerResult<Vec<StageTransition>> {
        self.store.stage_history(batch_id).await
    }

    /// Looks up a batch a movement refers to. Unknown batches are a malformed movement.
    pub(crate) async fn known_batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.store
            .batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::invalid(format!("unknown batch {batch_id}")))
    }
}

pub(crate) fn movement(
    batch: &Batch,
    location_id: LocationId,
    quantity: i64,
    movement_type: MovementType,
    reason: Option<String>,
) -> NewEntry {
    NewEntry {
        batch_id: batch.id,
        location_id,
        quantity,
        movement_type,
        unit_cost: batch.unit_cost,
        reason,
    }
}

pub(crate) fn positive(quantity: i64) -> LedgerResult<i64> {
    if quantity <= 0 {
        return Err(LedgerError::invalid("quantity must be positive"));
    }
    Ok(quantity)
}

fn first_entry_id(receipt: &CommitReceipt) -> LedgerResult<EntryId> {
    receipt
        .entries
        .first()
        .map(|entry| entry.id)
        .ok_or_else(|| LedgerError::Storage("commit returned no entries".to_string()))
}

fn operation_for(movement_type: MovementType) -> OperationKind {
    match movement_type {
        MovementType::InitialReceipt => OperationKind::Receipt,
        MovementType::TransferOut | MovementType::TransferIn => OperationKind::Transfer,
        MovementType::AdjustmentAdd | MovementType::AdjustmentRemove => OperationKind::Adjustment,
        MovementType::Reconciliation => OperationKind::Reconciliation,
        MovementType::AssemblyConsumption | MovementType::AssemblyOutput => {
            OperationKind::Assembly
        }
        MovementType::BatchSplitOut | MovementType::BatchSplitIn => OperationKind::Split,
    }
}
