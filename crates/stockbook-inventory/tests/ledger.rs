mod common;

use common::{ACTOR, day, dollars, harness};
use rust_decimal::Decimal;
use stockbook_core::{
    LedgerError, LedgerStore, LifecycleStage, MovementType, NewEntry, PositionFilter,
};
use stockbook_inventory::Receipt;
use uuid::Uuid;

#[tokio::test]
async fn receipt_creates_batch_and_initial_entry() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 100, dollars(2), 1).await;

    let batch = h.inventory.ledger.batch(batch_id).await.unwrap();
    assert_eq!(batch.original_quantity, 100);
    assert_eq!(batch.unit_cost, dollars(2));
    assert_eq!(batch.received_at, day(1));
    assert_eq!(batch.source_reference.as_deref(), Some("PO-1"));

    let entries = h.inventory.ledger.ledger_for(batch_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].movement_type, MovementType::InitialReceipt);
    assert_eq!(entries[0].quantity, 100);
    assert_eq!(entries[0].total_cost, dollars(200));
    assert_eq!(entries[0].actor, ACTOR);
}

#[tokio::test]
async fn receipt_rejects_non_positive_quantity() {
    let h = harness().await;
    let err = h
        .inventory
        .ledger
        .record_receipt(
            Receipt {
                sku: "SKU-A".to_string(),
                product_name: "Widget".to_string(),
                location_id: h.warehouse,
                quantity: 0,
                unit_cost: dollars(1),
                source_reference: None,
                received_at: None,
                stage: None,
            },
            ACTOR,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidMovement(_)));
    assert_eq!(h.entry_count().await, 0);
}

#[tokio::test]
async fn receipt_at_unknown_location_is_invalid() {
    let h = harness().await;
    let err = h
        .inventory
        .ledger
        .record_receipt(
            Receipt {
                sku: "SKU-A".to_string(),
                product_name: "Widget".to_string(),
                location_id: Uuid::new_v4(),
                quantity: 5,
                unit_cost: dollars(1),
                source_reference: None,
                received_at: None,
                stage: None,
            },
            ACTOR,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidMovement(_)));
    assert!(h.store.batches_for_sku("SKU-A").await.unwrap().is_empty());
}

fn receipt(quantity: i64, unit_cost: Decimal, location_id: Uuid) -> Receipt {
    Receipt {
        sku: "SKU-Z".to_string(),
        product_name: "Gadget".to_string(),
        location_id,
        quantity,
        unit_cost,
        source_reference: None,
        received_at: None,
        stage: None,
    }
}

#[tokio::test]
async fn receipt_cost_is_held_at_four_places() {
    let h = harness().await;
    let batch_id = h
        .inventory
        .ledger
        .record_receipt(receipt(3, Decimal::new(123_456, 5), h.warehouse), ACTOR)
        .await
        .unwrap();

    let batch = h.inventory.ledger.batch(batch_id).await.unwrap();
    assert_eq!(batch.unit_cost, Decimal::new(12_346, 4));
    let entries = h.inventory.ledger.ledger_for(batch_id).await.unwrap();
    assert_eq!(entries[0].unit_cost, batch.unit_cost);
    assert_eq!(entries[0].total_cost, Decimal::new(37_038, 4));
}

#[tokio::test]
async fn overflowing_receipt_is_invalid_and_leaves_nothing() {
    let h = harness().await;
    let err = h
        .inventory
        .ledger
        .record_receipt(
            receipt(i64::MAX, Decimal::new(100_000_000_000, 0), h.warehouse),
            ACTOR,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidMovement(_)));
    assert!(h.store.batches_for_sku("SKU-Z").await.unwrap().is_empty());
    assert_eq!(h.entry_count().await, 0);
}

#[tokio::test]
async fn adjustment_at_the_quantity_limit_is_invalid() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 10, dollars(2), 1).await;

    let err = h
        .inventory
        .ledger
        .record_adjustment(batch_id, h.warehouse, i64::MIN, "count", ACTOR)
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::InvalidMovement(_)));
    assert_eq!(
        h.inventory.ledger.on_hand(batch_id, h.warehouse).await.unwrap(),
        10
    );
}

#[tokio::test]
async fn append_rejects_overdraw_and_unknown_batch() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 10, dollars(1), 1).await;

    let overdraw = h
        .inventory
        .ledger
        .append(
            NewEntry {
                batch_id,
                location_id: h.warehouse,
                quantity: -11,
                movement_type: MovementType::AdjustmentRemove,
                unit_cost: dollars(1),
                reason: Some("damage".to_string()),
            },
            ACTOR,
        )
        .await
        .unwrap_err();
    assert_eq!(
        overdraw,
        LedgerError::InsufficientStock {
            batch_id,
            location_id: h.warehouse,
            requested: 11,
            available: 10,
        }
    );
    assert_eq!(overdraw.to_string().split(" units").next(), Some("only 10"));

    let unknown = h
        .inventory
        .ledger
        .record_adjustment(Uuid::new_v4(), h.warehouse, -1, "damage", ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(unknown, LedgerError::InvalidMovement(_)));
    assert_eq!(h.net(batch_id).await, 10);
}

#[tokio::test]
async fn transfers_move_stock_without_changing_batch_net() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 100, dollars(2), 1).await;

    let receipt = h
        .inventory
        .ledger
        .transfer(batch_id, h.warehouse, h.amazon, 40, ACTOR)
        .await
        .unwrap();
    assert_eq!(receipt.entries.len(), 2);
    assert!(
        receipt
            .entries
            .iter()
            .all(|entry| entry.operation_id == receipt.operation_id)
    );

    assert_eq!(h.inventory.ledger.on_hand(batch_id, h.warehouse).await.unwrap(), 60);
    assert_eq!(h.inventory.ledger.on_hand(batch_id, h.amazon).await.unwrap(), 40);
    assert_eq!(h.net(batch_id).await, 100);
}

#[tokio::test]
async fn separate_transfer_halves_cannot_inflate_a_batch() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 10, dollars(2), 1).await;

    let err = h
        .inventory
        .ledger
        .record_transfer_in(batch_id, h.amazon, 5, ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidMovement(_)));

    h.inventory
        .ledger
        .record_transfer_out(batch_id, h.warehouse, 5, ACTOR)
        .await
        .unwrap();
    h.inventory
        .ledger
        .record_transfer_in(batch_id, h.amazon, 5, ACTOR)
        .await
        .unwrap();
    assert_eq!(h.net(batch_id).await, 10);
}

#[tokio::test]
async fn conservation_holds_across_mixed_movements() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 50, dollars(3), 1).await;
    let ledger = &h.inventory.ledger;

    ledger
        .transfer(batch_id, h.warehouse, h.amazon, 20, ACTOR)
        .await
        .unwrap();
    ledger
        .record_adjustment(batch_id, h.amazon, -3, "damaged in transit", ACTOR)
        .await
        .unwrap();
    ledger
        .record_adjustment(batch_id, h.amazon, 1, "found in recount", ACTOR)
        .await
        .unwrap();

    let entries = ledger.ledger_for(batch_id).await.unwrap();
    let inbound: i64 = entries.iter().filter(|e| e.quantity > 0).map(|e| e.quantity).sum();
    let outbound: i64 = entries.iter().filter(|e| e.quantity < 0).map(|e| -e.quantity).sum();
    let net = h.net(batch_id).await;

    assert_eq!(net, inbound - outbound);
    assert_eq!(net, 48);
    for position in ledger
        .positions_for(&PositionFilter::for_batch(batch_id).with_depleted())
        .await
        .unwrap()
    {
        assert!(position.on_hand >= 0);
    }
}

#[tokio::test]
async fn adjustments_need_a_reason_and_a_quantity() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 10, dollars(1), 1).await;

    let no_reason = h
        .inventory
        .ledger
        .record_adjustment(batch_id, h.warehouse, -1, "  ", ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(no_reason, LedgerError::InvalidMovement(_)));

    let zero = h
        .inventory
        .ledger
        .record_adjustment(batch_id, h.warehouse, 0, "count", ACTOR)
        .await
        .unwrap_err();
    assert!(matches!(zero, LedgerError::InvalidMovement(_)));
}

#[tokio::test]
async fn reconcile_writes_only_the_difference() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 30, dollars(1), 1).await;
    let ledger = &h.inventory.ledger;

    assert_eq!(
        ledger
            .reconcile(batch_id, h.warehouse, 30, "cycle count", ACTOR)
            .await
            .unwrap(),
        None
    );

    let entry_id = ledger
        .reconcile(batch_id, h.warehouse, 27, "cycle count", ACTOR)
        .await
        .unwrap()
        .expect("difference recorded");
    let entries = ledger.ledger_for(batch_id).await.unwrap();
    let entry = entries.iter().find(|e| e.id == entry_id).unwrap();
    assert_eq!(entry.movement_type, MovementType::Reconciliation);
    assert_eq!(entry.quantity, -3);
    assert_eq!(h.net(batch_id).await, 27);
}

#[tokio::test]
async fn depleted_positions_drop_out_of_default_listing() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 5, dollars(1), 1).await;
    h.inventory
        .ledger
        .record_adjustment(batch_id, h.warehouse, -5, "written off", ACTOR)
        .await
        .unwrap();

    let listed = h
        .inventory
        .ledger
        .positions_for(&PositionFilter::for_sku("SKU-A"))
        .await
        .unwrap();
    assert!(listed.is_empty());

    let audit = h
        .inventory
        .ledger
        .positions_for(&PositionFilter::for_sku("SKU-A").with_depleted())
        .await
        .unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!((audit[0].total_in, audit[0].total_out), (5, 5));
    assert_eq!(audit[0].total_value, Decimal::ZERO);
}

#[tokio::test]
async fn stage_changes_are_history_not_gates() {
    let h = harness().await;
    let batch_id = h.receive("SKU-A", 10, dollars(1), 1).await;
    let ledger = &h.inventory.ledger;

    let first = ledger
        .advance_stage(batch_id, LifecycleStage::Amazon, ACTOR)
        .await
        .unwrap()
        .expect("stage changes");
    assert_eq!(first.from, LifecycleStage::Warehouse);
    assert!(
        ledger
            .advance_stage(batch_id, LifecycleStage::Amazon, ACTOR)
            .await
            .unwrap()
            .is_none()
    );
    ledger
        .advance_stage(batch_id, LifecycleStage::InTransit, ACTOR)
        .await
        .unwrap();

    let history = ledger.stage_history(batch_id).await.unwrap();
    let stages: Vec<LifecycleStage> = history.iter().map(|t| t.to).collect();
    assert_eq!(stages, vec![LifecycleStage::Amazon, LifecycleStage::InTransit]);
    assert_eq!(
        ledger.batch(batch_id).await.unwrap().stage,
        LifecycleStage::InTransit
    );

    ledger
        .record_adjustment(batch_id, h.warehouse, -2, "sample", ACTOR)
        .await
        .unwrap();
    assert_eq!(h.net(batch_id).await, 8);
}

#[tokio::test]
async fn reads_of_unknown_batches_are_not_found() {
    let h = harness().await;
    let err = h
        .inventory
        .ledger
        .ledger_for(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { kind: "batch", .. }));
}
