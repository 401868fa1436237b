use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use stockbook_core::{
    AttributionRecord, BalanceSheet, Batch, BatchBalance, BatchId, Commit, CommitReceipt,
    ConsumptionEvent, EntryFilter, EventId, LedgerEntry, LedgerError, LedgerResult, LedgerStore,
    Location, LocationId, PlanId, PlanStatus, PositionFilter, Reservation, StageTransition,
    StockPosition, TransferLine, TransferPlan, line_cost, project, validate,
};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct LedgerState {
    sequence: i64,
    locations: HashMap<LocationId, Location>,
    batches: HashMap<BatchId, Batch>,
    entries: Vec<LedgerEntry>,
    stages: Vec<StageTransition>,
    plans: HashMap<PlanId, TransferPlan>,
    consumption: HashMap<EventId, ConsumptionEvent>,
    attributions: HashMap<EventId, AttributionRecord>,
}

impl LedgerState {
    fn sheet_for(&self, commit: &Commit) -> BalanceSheet {
        let touched = commit.touched_batches();
        let mut sheet = BalanceSheet {
            locations: commit
                .touched_locations()
                .into_iter()
                .filter(|id| self.locations.contains_key(id))
                .collect(),
            ..BalanceSheet::default()
        };

        for id in &touched {
            if let Some(batch) = self.batches.get(id) {
                sheet.batches.insert(
                    *id,
                    BatchBalance {
                        original_quantity: batch.original_quantity,
                        net: 0,
                    },
                );
            }
        }

        for entry in self
            .entries
            .iter()
            .filter(|entry| touched.contains(&entry.batch_id))
        {
            *sheet
                .positions
                .entry((entry.batch_id, entry.location_id))
                .or_insert(0) += entry.quantity;
            if let Some(balance) = sheet.batches.get_mut(&entry.batch_id) {
                balance.net += entry.quantity;
            }
        }

        sheet.reservations = self
            .reservations(None, None)
            .into_iter()
            .filter(|r| touched.contains(&r.batch_id))
            .collect();

        sheet.plan_status = commit.plan_update.and_then(|update| {
            self.plans
                .get(&update.plan_id)
                .map(|plan| (plan.id, plan.status))
        });
        sheet.event_processed = commit.event_id().and_then(|event_id| {
            self.consumption
                .get(&event_id)
                .map(|event| (event.id, event.processed_at.is_some()))
        });

        sheet
    }

    fn reservations(
        &self,
        batch_id: Option<BatchId>,
        location_id: Option<LocationId>,
    ) -> Vec<Reservation> {
        self.plans
            .values()
            .filter(|plan| plan.status == PlanStatus::Draft)
            .filter(|plan| location_id.is_none_or(|id| id == plan.from_location))
            .flat_map(|plan| {
                plan.lines.iter().map(|line| Reservation {
                    plan_id: plan.id,
                    plan_created_at: plan.created_at,
                    batch_id: line.batch_id,
                    location_id: plan.from_location,
                    quantity: line.quantity,
                })
            })
            .filter(|r| batch_id.is_none_or(|id| id == r.batch_id))
            .collect()
    }
}

/// Ledger store held in process memory. One write lock serializes every commit.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn commit(&self, commit: Commit) -> LedgerResult<CommitReceipt> {
        let mut state = self.state.write().await;

        let sheet = state.sheet_for(&commit);
        validate(&commit, &sheet)?;

        // Everything fallible runs before the first write to `state`.
        let committed_at = Utc::now();
        let mut entries = Vec::with_capacity(commit.entries.len());
        for (offset, entry) in (1..).zip(commit.entries) {
            entries.push(LedgerEntry {
                id: state.sequence + offset,
                operation_id: commit.operation_id,
                batch_id: entry.batch_id,
                location_id: entry.location_id,
                quantity: entry.quantity,
                movement_type: entry.movement_type,
                unit_cost: entry.unit_cost,
                total_cost: line_cost(entry.quantity, entry.unit_cost)?,
                reason: entry.reason,
                actor: commit.actor.clone(),
                created_at: committed_at,
            });
        }

        let created_batches = commit.new_batches.iter().map(|batch| batch.id).collect();
        for batch in commit.new_batches {
            state.batches.insert(batch.id, batch);
        }
        state.sequence += entries.len() as i64;
        state.entries.extend(entries.iter().cloned());

        if let Some(update) = commit.plan_update {
            if let Some(plan) = state.plans.get_mut(&update.plan_id) {
                plan.status = update.status;
                plan.closed_at = Some(committed_at);
            }
        }

        if let Some(mut record) = commit.attribution {
            record.operation_id = commit.operation_id;
            record.attributed_at = committed_at;
            if let Some(event) = state.consumption.get_mut(&record.event_id) {
                event.processed_at = Some(committed_at);
            }
            state.attributions.insert(record.event_id, record);
        }

        Ok(CommitReceipt {
            operation_id: commit.operation_id,
            kind: commit.kind,
            created_batches,
            entries,
            committed_at,
        })
    }

    async fn register_location(&self, location: Location) -> LedgerResult<Location> {
        let mut state = self.state.write().await;
        if state
            .locations
            .values()
            .any(|existing| existing.code == location.code)
        {
            return Err(LedgerError::invalid(format!(
                "location code {} already registered",
                location.code
            )));
        }
        state.locations.insert(location.id, location.clone());
        Ok(location)
    }

    async fn location(&self, id: LocationId) -> LedgerResult<Option<Location>> {
        Ok(self.state.read().await.locations.get(&id).cloned())
    }

    async fn locations(&self) -> LedgerResult<Vec<Location>> {
        let state = self.state.read().await;
        let mut locations: Vec<Location> = state.locations.values().cloned().collect();
        locations.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(locations)
    }

    async fn batch(&self, id: BatchId) -> LedgerResult<Option<Batch>> {
        Ok(self.state.read().await.batches.get(&id).cloned())
    }

    async fn batches_for_sku(&self, sku: &str) -> LedgerResult<Vec<Batch>> {
        let state = self.state.read().await;
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|batch| batch.sku == sku)
            .cloned()
            .collect();
        batches.sort_by_key(|batch| (batch.received_at, batch.created_at, batch.id));
        Ok(batches)
    }

    async fn record_stage(&self, transition: StageTransition) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let batch = state
            .batches
            .get_mut(&transition.batch_id)
            .ok_or_else(|| LedgerError::batch_not_found(transition.batch_id))?;
        batch.stage = transition.to;
        state.stages.push(transition);
        Ok(())
    }

    async fn stage_history(&self, batch_id: BatchId) -> LedgerResult<Vec<StageTransition>> {
        let state = self.state.read().await;
        Ok(state
            .stages
            .iter()
            .filter(|transition| transition.batch_id == batch_id)
            .cloned()
            .collect())
    }

    async fn entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect())
    }

    async fn positions(&self, filter: &PositionFilter) -> LedgerResult<Vec<StockPosition>> {
        let state = self.state.read().await;
        Ok(project(&state.batches, &state.entries, filter))
    }

    async fn create_plan(&self, plan: TransferPlan) -> LedgerResult<TransferPlan> {
        let mut state = self.state.write().await;
        if state.plans.contains_key(&plan.id) {
            return Err(LedgerError::invalid(format!(
                "transfer plan {} already exists",
                plan.id
            )));
        }
        state.plans.insert(plan.id, plan.clone());
        Ok(plan)
    }

    async fn add_plan_line(
        &self,
        plan_id: PlanId,
        line: TransferLine,
    ) -> LedgerResult<TransferPlan> {
        let mut state = self.state.write().await;
        let plan = state
            .plans
            .get_mut(&plan_id)
            .ok_or_else(|| LedgerError::plan_not_found(plan_id))?;
        if plan.status != PlanStatus::Draft {
            return Err(LedgerError::PlanNotDraft {
                plan_id,
                status: plan.status,
            });
        }
        plan.lines.push(line);
        Ok(plan.clone())
    }

    async fn plan(&self, id: PlanId) -> LedgerResult<Option<TransferPlan>> {
        Ok(self.state.read().await.plans.get(&id).cloned())
    }

    async fn draft_reservations(
        &self,
        batch_id: Option<BatchId>,
        location_id: Option<LocationId>,
    ) -> LedgerResult<Vec<Reservation>> {
        Ok(self.state.read().await.reservations(batch_id, location_id))
    }

    async fn record_consumption(&self, event: ConsumptionEvent) -> LedgerResult<ConsumptionEvent> {
        let mut state = self.state.write().await;
        if let Some(existing) = state
            .consumption
            .values()
            .find(|existing| existing.external_ref == event.external_ref)
        {
            return Ok(existing.clone());
        }
        state.consumption.insert(event.id, event.clone());
        Ok(event)
    }

    async fn consumption(&self, id: EventId) -> LedgerResult<Option<ConsumptionEvent>> {
        Ok(self.state.read().await.consumption.get(&id).cloned())
    }

    async fn pending_consumption(&self, limit: usize) -> LedgerResult<Vec<ConsumptionEvent>> {
        let state = self.state.read().await;
        let mut pending: Vec<ConsumptionEvent> = state
            .consumption
            .values()
            .filter(|event| event.processed_at.is_none())
            .cloned()
            .collect();
        pending.sort_by_key(|event| (event.event_date, event.recorded_at, event.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn attribution(&self, event_id: EventId) -> LedgerResult<Option<AttributionRecord>> {
        Ok(self.state.read().await.attributions.get(&event_id).cloned())
    }

    async fn attributions_for_sku(&self, sku: &str) -> LedgerResult<Vec<AttributionRecord>> {
        let state = self.state.read().await;
        let mut records: Vec<AttributionRecord> = state
            .attributions
            .values()
            .filter(|record| record.sku == sku)
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.attributed_at, record.event_id));
        Ok(records)
    }

    async fn operation_entries(&self, operation_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.operation_id == operation_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use stockbook_core::{LifecycleStage, LocationKind, MovementType, NewEntry, OperationKind};

    use super::*;

    async fn seeded() -> (InMemoryLedgerStore, LocationId) {
        let store = InMemoryLedgerStore::new();
        let location = store
            .register_location(Location {
                id: Uuid::new_v4(),
                code: "WH-1".to_string(),
                name: "Main warehouse".to_string(),
                kind: LocationKind::Warehouse,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        (store, location.id)
    }

    fn receipt(location_id: LocationId, quantity: i64) -> Commit {
        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            sku: "SKU-1".to_string(),
            product_name: "Widget".to_string(),
            original_quantity: quantity,
            unit_cost: Decimal::new(2, 0),
            received_at: now,
            stage: LifecycleStage::Warehouse,
            source_reference: None,
            parents: Vec::new(),
            note: None,
            created_at: now,
        };
        Commit::new(OperationKind::Receipt, "tester")
            .with_entry(NewEntry {
                batch_id: batch.id,
                location_id,
                quantity,
                movement_type: MovementType::InitialReceipt,
                unit_cost: batch.unit_cost,
                reason: None,
            })
            .with_batch(batch)
    }

    #[tokio::test]
    async fn entry_ids_follow_commit_order() {
        let (store, location) = seeded().await;
        let first = store.commit(receipt(location, 10)).await.unwrap();
        let second = store.commit(receipt(location, 20)).await.unwrap();

        assert_eq!(first.entry_ids(), vec![1]);
        assert_eq!(second.entry_ids(), vec![2]);
        assert_eq!(first.entries[0].total_cost, Decimal::new(20, 0));
    }

    #[tokio::test]
    async fn rejected_commit_leaves_no_trace() {
        let (store, location) = seeded().await;
        let receipt = store.commit(receipt(location, 10)).await.unwrap();
        let batch_id = receipt.created_batches[0];

        let mut commit = Commit::new(OperationKind::Adjustment, "tester");
        for quantity in [-4, -7] {
            commit = commit.with_entry(NewEntry {
                batch_id,
                location_id: location,
                quantity,
                movement_type: MovementType::AdjustmentRemove,
                unit_cost: Decimal::new(2, 0),
                reason: None,
            });
        }

        let err = store.commit(commit).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(
            store
                .entries(&EntryFilter::for_batch(batch_id))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn overflowing_receipt_is_refused_whole() {
        let (store, location) = seeded().await;
        let mut commit = receipt(location, i64::MAX);
        commit.new_batches[0].unit_cost = Decimal::new(100_000_000_000, 0);
        commit.entries[0].unit_cost = Decimal::new(100_000_000_000, 0);
        let batch_id = commit.new_batches[0].id;

        let err = store.commit(commit).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMovement(_)));
        assert_eq!(store.batch(batch_id).await.unwrap(), None);
        assert!(store.batches_for_sku("SKU-1").await.unwrap().is_empty());

        let next = store.commit(receipt(location, 1)).await.unwrap();
        assert_eq!(next.entry_ids(), vec![1]);
    }

    #[tokio::test]
    async fn duplicate_location_codes_are_refused() {
        let (store, _) = seeded().await;
        let err = store
            .register_location(Location {
                id: Uuid::new_v4(),
                code: "WH-1".to_string(),
                name: "Shadow".to_string(),
                kind: LocationKind::Warehouse,
                created_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidMovement(_)));
    }
}
