use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;

use crate::costing::round_cost;
use crate::models::{Batch, BatchId, LedgerEntry, LocationId, PositionFilter, StockPosition};

/// Folds ledger entries into per (batch, location) positions.
///
/// Entries must arrive in commit order. Positions whose batch is missing from `batches` are
/// skipped. Output is sorted oldest receipt first, ties broken by commit order.
pub fn project<'a, I>(
    batches: &HashMap<BatchId, Batch>,
    entries: I,
    filter: &PositionFilter,
) -> Vec<StockPosition>
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    let mut folded: BTreeMap<(BatchId, LocationId), StockPosition> = BTreeMap::new();
    let mut inbound_value: HashMap<(BatchId, LocationId), Decimal> = HashMap::new();

    for entry in entries {
        if filter.batch_id.is_some_and(|id| id != entry.batch_id)
            || filter.location_id.is_some_and(|id| id != entry.location_id)
        {
            continue;
        }
        let Some(batch) = batches.get(&entry.batch_id) else {
            continue;
        };
        if filter.sku.as_deref().is_some_and(|sku| sku != batch.sku) {
            continue;
        }

        let key = (entry.batch_id, entry.location_id);
        let position = folded.entry(key).or_insert_with(|| StockPosition {
            batch_id: batch.id,
            sku: batch.sku.clone(),
            product_name: batch.product_name.clone(),
            location_id: entry.location_id,
            total_in: 0,
            total_out: 0,
            on_hand: 0,
            unit_cost: batch.unit_cost,
            total_value: Decimal::ZERO,
            first_received_at: batch.received_at,
            last_movement_at: entry.created_at,
            first_entry_id: entry.id,
        });

        if entry.quantity > 0 {
            position.total_in = position.total_in.saturating_add(entry.quantity);
            let value = inbound_value.entry(key).or_insert(Decimal::ZERO);
            *value = value.saturating_add(entry.total_cost);
        } else {
            position.total_out = position.total_out.saturating_sub(entry.quantity);
        }
        position.on_hand = position.on_hand.saturating_add(entry.quantity);
        position.last_movement_at = position.last_movement_at.max(entry.created_at);
        position.first_entry_id = position.first_entry_id.min(entry.id);
    }

    let mut positions: Vec<StockPosition> = folded
        .into_iter()
        .map(|(key, mut position)| {
            if position.total_in > 0 {
                let value = inbound_value.get(&key).copied().unwrap_or(Decimal::ZERO);
                position.unit_cost = round_cost(value / Decimal::from(position.total_in));
            }
            position.total_value = round_cost(
                Decimal::from(position.on_hand.max(0)).saturating_mul(position.unit_cost),
            );
            position
        })
        .filter(|position| filter.matches(position))
        .collect();

    sort_fifo(&mut positions);
    positions
}

/// Oldest receipt first; commit order breaks ties.
pub fn sort_fifo(positions: &mut [StockPosition]) {
    positions.sort_by(|a, b| {
        a.first_received_at
            .cmp(&b.first_received_at)
            .then(a.first_entry_id.cmp(&b.first_entry_id))
            .then(a.location_id.cmp(&b.location_id))
    });
}

/// Net quantity a batch holds across all locations.
pub fn batch_net<'a, I>(batch_id: BatchId, entries: I) -> i64
where
    I: IntoIterator<Item = &'a LedgerEntry>,
{
    entries
        .into_iter()
        .filter(|entry| entry.batch_id == batch_id)
        .map(|entry| entry.quantity)
        .sum()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::costing::line_cost;
    use crate::models::{LifecycleStage, MovementType};

    fn batch(sku: &str, unit_cost: Decimal, days_ago: i64) -> Batch {
        let now = Utc::now();
        Batch {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            product_name: format!("{sku} product"),
            original_quantity: 100,
            unit_cost,
            received_at: now - Duration::days(days_ago),
            stage: LifecycleStage::Warehouse,
            source_reference: None,
            parents: Vec::new(),
            note: None,
            created_at: now,
        }
    }

    fn entry(
        id: i64,
        batch: &Batch,
        location_id: LocationId,
        quantity: i64,
        movement_type: MovementType,
    ) -> LedgerEntry {
        LedgerEntry {
            id,
            operation_id: Uuid::new_v4(),
            batch_id: batch.id,
            location_id,
            quantity,
            movement_type,
            unit_cost: batch.unit_cost,
            total_cost: line_cost(quantity, batch.unit_cost).unwrap(),
            reason: None,
            actor: "tester".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn sums_in_and_out_per_location() {
        let b = batch("SKU-A", Decimal::new(2, 0), 1);
        let (warehouse, amazon) = (Uuid::new_v4(), Uuid::new_v4());
        let entries = vec![
            entry(1, &b, warehouse, 100, MovementType::InitialReceipt),
            entry(2, &b, warehouse, -30, MovementType::TransferOut),
            entry(3, &b, amazon, 30, MovementType::TransferIn),
            entry(4, &b, amazon, -5, MovementType::AdjustmentRemove),
        ];
        let batches = HashMap::from([(b.id, b.clone())]);

        let positions = project(&batches, &entries, &PositionFilter::default());
        assert_eq!(positions.len(), 2);

        let at_warehouse = positions
            .iter()
            .find(|p| p.location_id == warehouse)
            .unwrap();
        assert_eq!(
            (at_warehouse.total_in, at_warehouse.total_out, at_warehouse.on_hand),
            (100, 30, 70)
        );
        assert_eq!(at_warehouse.total_value, Decimal::new(140, 0));

        let at_amazon = positions.iter().find(|p| p.location_id == amazon).unwrap();
        assert_eq!(at_amazon.on_hand, 25);
        assert_eq!(at_amazon.unit_cost, Decimal::new(2, 0));
    }

    #[test]
    fn depleted_positions_only_show_on_request() {
        let b = batch("SKU-A", Decimal::ONE, 1);
        let location = Uuid::new_v4();
        let entries = vec![
            entry(1, &b, location, 10, MovementType::InitialReceipt),
            entry(2, &b, location, -10, MovementType::AdjustmentRemove),
        ];
        let batches = HashMap::from([(b.id, b.clone())]);

        assert!(project(&batches, &entries, &PositionFilter::default()).is_empty());

        let audit = project(&batches, &entries, &PositionFilter::default().with_depleted());
        assert_eq!(audit.len(), 1);
        assert!(audit[0].is_depleted());
    }

    #[test]
    fn orders_by_receipt_date_not_insertion() {
        let newer = batch("SKU-A", Decimal::new(6, 0), 1);
        let older = batch("SKU-A", Decimal::new(5, 0), 2);
        let other = batch("SKU-B", Decimal::ONE, 10);
        let location = Uuid::new_v4();
        let entries = vec![
            entry(1, &newer, location, 10, MovementType::InitialReceipt),
            entry(2, &older, location, 10, MovementType::InitialReceipt),
            entry(3, &other, location, 10, MovementType::InitialReceipt),
        ];
        let batches = HashMap::from([
            (newer.id, newer.clone()),
            (older.id, older.clone()),
            (other.id, other.clone()),
        ]);

        let positions = project(&batches, &entries, &PositionFilter::for_sku("SKU-A"));
        let order: Vec<BatchId> = positions.iter().map(|p| p.batch_id).collect();
        assert_eq!(order, vec![older.id, newer.id]);
    }

    #[test]
    fn batch_net_spans_locations() {
        let b = batch("SKU-A", Decimal::ONE, 1);
        let entries = vec![
            entry(1, &b, Uuid::new_v4(), 40, MovementType::InitialReceipt),
            entry(2, &b, Uuid::new_v4(), 60, MovementType::InitialReceipt),
        ];
        assert_eq!(batch_net(b.id, &entries), 100);
    }
}
