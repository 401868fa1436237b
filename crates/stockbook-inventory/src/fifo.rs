//! FIFO attribution of external consumption (sales, losses) to batches.
//!
//! Every consumption event is attributed at most once: the commit that writes its draws
//! also flips the event's processed marker, and the store refuses a second attribution.
//! Draws are planned against a snapshot and re-validated at commit; a lost race re-plans.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockbook_core::{
    AttributionDraw, AttributionRecord, BatchId, Commit, ConsumptionEvent, ConsumptionKind,
    EventId, LedgerError, LedgerResult, LedgerStore, MovementType, NewEntry, OperationKind,
    PositionFilter, StockPosition, UnattributedShortfall, line_cost,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionSettings {
    /// Re-plans allowed after losing a race with a concurrent writer.
    pub max_retries: u32,
    pub backlog_limit: usize,
}

impl Default for AttributionSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backlog_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumptionInput {
    pub external_ref: String,
    pub sku: String,
    pub quantity: i64,
    pub event_date: NaiveDate,
    pub kind: ConsumptionKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BacklogReport {
    pub events_processed: usize,
    pub units_attributed: i64,
    pub cogs: Decimal,
    pub unattributed_units: i64,
    pub shortfalls: Vec<UnattributedShortfall>,
    pub failures: Vec<BacklogFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BacklogFailure {
    pub event_id: EventId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepletionLine {
    pub batch_id: BatchId,
    pub received_at: DateTime<Utc>,
    pub received: i64,
    pub unit_cost: Decimal,
    pub attributed: i64,
    pub cogs: Decimal,
    pub remaining: i64,
}

#[derive(Clone)]
pub struct FifoAttributor {
    store: Arc<dyn LedgerStore>,
    settings: AttributionSettings,
}

impl FifoAttributor {
    pub fn new(store: Arc<dyn LedgerStore>, settings: AttributionSettings) -> Self {
        Self { store, settings }
    }

    pub fn settings(&self) -> AttributionSettings {
        self.settings
    }

    /// Queues a consumption event. Re-recording the same external ref returns the original.
    pub async fn record_consumption(
        &self,
        input: ConsumptionInput,
    ) -> LedgerResult<ConsumptionEvent> {
        if input.quantity <= 0 {
            return Err(LedgerError::invalid("consumed quantity must be positive"));
        }
        let sku = input.sku.trim();
        let external_ref = input.external_ref.trim();
        if sku.is_empty() || external_ref.is_empty() {
            return Err(LedgerError::invalid(
                "consumption needs a sku and an external reference",
            ));
        }

        self.store
            .record_consumption(ConsumptionEvent {
                id: Uuid::new_v4(),
                external_ref: external_ref.to_string(),
                sku: sku.to_string(),
                quantity: input.quantity,
                event_date: input.event_date,
                kind: input.kind,
                recorded_at: Utc::now(),
                processed_at: None,
            })
            .await
    }

    /// Records and immediately attributes one consumption.
    pub async fn attribute(
        &self,
        sku: &str,
        quantity: i64,
        event_date: NaiveDate,
        kind: ConsumptionKind,
        actor: &str,
    ) -> LedgerResult<AttributionRecord> {
        let event = self
            .record_consumption(ConsumptionInput {
                external_ref: format!("direct:{}", Uuid::new_v4()),
                sku: sku.to_string(),
                quantity,
                event_date,
                kind,
            })
            .await?;
        self.attribute_event(event.id, actor).await
    }

    /// Attributes a stored event, or returns its existing record if already attributed.
    pub async fn attribute_event(
        &self,
        event_id: EventId,
        actor: &str,
    ) -> LedgerResult<AttributionRecord> {
        let event = self
            .store
            .consumption(event_id)
            .await?
            .ok_or_else(|| LedgerError::event_not_found(event_id))?;

        if event.processed_at.is_some() {
            return self.existing_record(event_id).await;
        }

        let mut attempt = 0;
        loop {
            let positions = self
                .store
                .positions(&PositionFilter::for_sku(event.sku.clone()))
                .await?;
            let (record, entries) = plan_draws(&event, &positions)?;
            let mut commit = Commit::new(OperationKind::Attribution, actor);
            for entry in entries {
                commit = commit.with_entry(entry);
            }

            match self.store.commit(commit.attributing(record)).await {
                Ok(receipt) => {
                    let record = self.existing_record(event_id).await?;
                    info!(
                        %event_id,
                        sku = %record.sku,
                        draws = receipt.entries.len(),
                        cogs = %record.cogs,
                        "consumption attributed"
                    );
                    if let Some(shortfall) = record.shortfall() {
                        warn!(
                            %event_id,
                            sku = %shortfall.sku,
                            units = shortfall.units,
                            "consumption exceeds available supply"
                        );
                    }
                    return Ok(record);
                }
                Err(LedgerError::AlreadyAttributed { .. }) => {
                    return self.existing_record(event_id).await;
                }
                Err(err) if err.is_retryable() && attempt < self.settings.max_retries => {
                    attempt += 1;
                    info!(
                        %event_id,
                        attempt,
                        "re-planning attribution after concurrent change: {err}"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Attributes pending events oldest first. Safe to re-run after a partial failure.
    pub async fn run_backlog(
        &self,
        limit: Option<usize>,
        actor: &str,
    ) -> LedgerResult<BacklogReport> {
        let pending = self
            .store
            .pending_consumption(limit.unwrap_or(self.settings.backlog_limit))
            .await?;

        let mut report = BacklogReport::default();
        for event in pending {
            match self.attribute_event(event.id, actor).await {
                Ok(record) => {
                    report.events_processed += 1;
                    report.units_attributed += record.attributed();
                    report.cogs = report.cogs.saturating_add(record.cogs);
                    report.unattributed_units += record.unattributed;
                    report.shortfalls.extend(record.shortfall());
                }
                Err(LedgerError::Storage(message)) => {
                    return Err(LedgerError::Storage(message));
                }
                Err(err) => report.failures.push(BacklogFailure {
                    event_id: event.id,
                    reason: err.to_string(),
                }),
            }
        }

        if report.events_processed > 0 || !report.failures.is_empty() {
            info!(
                processed = report.events_processed,
                units = report.units_attributed,
                cogs = %report.cogs,
                unattributed = report.unattributed_units,
                failures = report.failures.len(),
                "attribution backlog run finished"
            );
        }
        Ok(report)
    }

    pub async fn attribution_for(
        &self,
        event_id: EventId,
    ) -> LedgerResult<Option<AttributionRecord>> {
        self.store.attribution(event_id).await
    }

    /// Per-batch view of how much of each receipt has been attributed and what remains.
    pub async fn depletion_report(&self, sku: &str) -> LedgerResult<Vec<DepletionLine>> {
        let batches = self.store.batches_for_sku(sku).await?;
        let positions = self
            .store
            .positions(&PositionFilter::for_sku(sku).with_depleted())
            .await?;
        let records = self.store.attributions_for_sku(sku).await?;

        let mut attributed: HashMap<BatchId, (i64, Decimal)> = HashMap::new();
        for draw in records.iter().flat_map(|record| record.draws.iter()) {
            let totals = attributed.entry(draw.batch_id).or_insert((0, Decimal::ZERO));
            totals.0 += draw.quantity;
            totals.1 = totals.1.saturating_add(draw.cogs);
        }

        Ok(batches
            .into_iter()
            .map(|batch| {
                let (drawn, cogs) = attributed
                    .get(&batch.id)
                    .copied()
                    .unwrap_or((0, Decimal::ZERO));
                DepletionLine {
                    batch_id: batch.id,
                    received_at: batch.received_at,
                    received: batch.original_quantity,
                    unit_cost: batch.unit_cost,
                    attributed: drawn,
                    cogs,
                    remaining: positions
                        .iter()
                        .filter(|position| position.batch_id == batch.id)
                        .map(|position| position.on_hand)
                        .sum(),
                }
            })
            .collect())
    }

    async fn existing_record(&self, event_id: EventId) -> LedgerResult<AttributionRecord> {
        self.store.attribution(event_id).await?.ok_or_else(|| {
            LedgerError::Storage(format!("event {event_id} is processed but has no attribution"))
        })
    }
}

/// Walks positions oldest receipt first, drawing until the event is covered or supply ends.
pub fn plan_draws(
    event: &ConsumptionEvent,
    positions: &[StockPosition],
) -> LedgerResult<(AttributionRecord, Vec<NewEntry>)> {
    let mut remaining = event.quantity;
    let mut cogs = Decimal::ZERO;
    let mut draws = Vec::new();
    let mut entries = Vec::new();
    let reason = format!("{} {}", event.kind.as_str(), event.external_ref);

    for position in positions
        .iter()
        .filter(|position| position.sku == event.sku && position.on_hand > 0)
    {
        if remaining == 0 {
            break;
        }
        let quantity = remaining.min(position.on_hand);
        remaining -= quantity;
        let draw_cogs = line_cost(quantity, position.unit_cost)?;
        cogs = cogs
            .checked_add(draw_cogs)
            .ok_or_else(|| LedgerError::invalid("attributed cost is out of range"))?;

        draws.push(AttributionDraw {
            batch_id: position.batch_id,
            location_id: position.location_id,
            quantity,
            unit_cost: position.unit_cost,
            cogs: draw_cogs,
            received_at: position.first_received_at,
        });
        entries.push(NewEntry {
            batch_id: position.batch_id,
            location_id: position.location_id,
            quantity: -quantity,
            movement_type: MovementType::AdjustmentRemove,
            unit_cost: position.unit_cost,
            reason: Some(reason.clone()),
        });
    }

    let record = AttributionRecord {
        event_id: event.id,
        operation_id: Uuid::nil(),
        sku: event.sku.clone(),
        kind: event.kind,
        event_date: event.event_date,
        requested: event.quantity,
        draws,
        unattributed: remaining,
        cogs,
        attributed_at: Utc::now(),
    };
    Ok((record, entries))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn position(sku: &str, on_hand: i64, unit_cost: i64, day: i64, entry: i64) -> StockPosition {
        let received = Utc::now() - Duration::days(30 - day);
        StockPosition {
            batch_id: Uuid::new_v4(),
            sku: sku.to_string(),
            product_name: "Widget".to_string(),
            location_id: Uuid::new_v4(),
            total_in: on_hand,
            total_out: 0,
            on_hand,
            unit_cost: Decimal::new(unit_cost, 0),
            total_value: Decimal::new(unit_cost * on_hand, 0),
            first_received_at: received,
            last_movement_at: received,
            first_entry_id: entry,
        }
    }

    fn event(quantity: i64) -> ConsumptionEvent {
        ConsumptionEvent {
            id: Uuid::new_v4(),
            external_ref: "order-1".to_string(),
            sku: "SKU-1".to_string(),
            quantity,
            event_date: Utc::now().date_naive(),
            kind: ConsumptionKind::Sale,
            recorded_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn draws_oldest_first_and_prices_each_draw() {
        let positions = vec![position("SKU-1", 10, 5, 1, 1), position("SKU-1", 10, 6, 2, 2)];
        let (record, entries) = plan_draws(&event(15), &positions).unwrap();

        let drawn: Vec<i64> = record.draws.iter().map(|draw| draw.quantity).collect();
        assert_eq!(drawn, vec![10, 5]);
        assert_eq!(record.cogs, Decimal::new(80, 0));
        assert_eq!(record.unattributed, 0);
        assert_eq!(entries[1].quantity, -5);
        assert_eq!(entries[1].batch_id, positions[1].batch_id);
    }

    #[test]
    fn reports_shortfall_instead_of_failing() {
        let positions = vec![position("SKU-1", 4, 5, 1, 1)];
        let (record, entries) = plan_draws(&event(10), &positions).unwrap();

        assert_eq!(record.attributed(), 4);
        assert_eq!(record.unattributed, 6);
        assert_eq!(record.shortfall().map(|s| s.units), Some(6));
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn ignores_other_skus_and_empty_positions() {
        let positions = vec![
            position("SKU-2", 10, 1, 1, 1),
            position("SKU-1", 0, 1, 2, 2),
            position("SKU-1", 3, 7, 3, 3),
        ];
        let (record, _) = plan_draws(&event(2), &positions).unwrap();

        assert_eq!(record.draws.len(), 1);
        assert_eq!(record.draws[0].batch_id, positions[2].batch_id);
        assert_eq!(record.cogs, Decimal::new(14, 0));
    }

    #[test]
    fn no_supply_means_no_entries() {
        let (record, entries) = plan_draws(&event(5), &[]).unwrap();
        assert!(entries.is_empty());
        assert_eq!(record.unattributed, 5);
        assert_eq!(record.cogs, Decimal::ZERO);
    }
}
