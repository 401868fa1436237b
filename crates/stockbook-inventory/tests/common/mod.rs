#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use stockbook_core::{BatchId, LedgerStore, LocationId, LocationKind};
use stockbook_inventory::{AttributionSettings, Inventory, Receipt};
use stockbook_store::InMemoryLedgerStore;

pub const ACTOR: &str = "warehouse-agent";

pub struct Harness {
    pub store: Arc<InMemoryLedgerStore>,
    pub inventory: Inventory,
    pub warehouse: LocationId,
    pub amazon: LocationId,
}

pub async fn harness() -> Harness {
    let store = Arc::new(InMemoryLedgerStore::new());
    let shared: Arc<dyn LedgerStore> = store.clone();
    let inventory = Inventory::new(shared, AttributionSettings::default());

    let warehouse = inventory
        .ledger
        .register_location("WH-1", "Main warehouse", LocationKind::Warehouse)
        .await
        .expect("warehouse registers");
    let amazon = inventory
        .ledger
        .register_location("FBA-1", "Amazon fulfillment", LocationKind::FulfillmentCenter)
        .await
        .expect("fulfillment center registers");

    Harness {
        store,
        inventory,
        warehouse: warehouse.id,
        amazon: amazon.id,
    }
}

pub fn day(n: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0)
        .single()
        .expect("valid date")
        + Duration::days(n.into())
}

pub fn dollars(amount: i64) -> Decimal {
    Decimal::new(amount, 0)
}

impl Harness {
    pub async fn receive(
        &self,
        sku: &str,
        quantity: i64,
        unit_cost: Decimal,
        received_day: u32,
    ) -> BatchId {
        self.receive_at(self.warehouse, sku, quantity, unit_cost, received_day)
            .await
    }

    pub async fn receive_at(
        &self,
        location_id: LocationId,
        sku: &str,
        quantity: i64,
        unit_cost: Decimal,
        received_day: u32,
    ) -> BatchId {
        self.inventory
            .ledger
            .record_receipt(
                Receipt {
                    sku: sku.to_string(),
                    product_name: format!("{sku} product"),
                    location_id,
                    quantity,
                    unit_cost,
                    source_reference: Some(format!("PO-{received_day}")),
                    received_at: Some(day(received_day)),
                    stage: None,
                },
                ACTOR,
            )
            .await
            .expect("receipt records")
    }

    pub async fn net(&self, batch_id: BatchId) -> i64 {
        self.inventory
            .ledger
            .net_position(batch_id)
            .await
            .expect("net position reads")
    }

    pub async fn entry_count(&self) -> usize {
        self.store
            .entries(&Default::default())
            .await
            .expect("entries read")
            .len()
    }
}
