use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use redis::Msg;
use stockbook_core::AttributionRecord;
use stockbook_inventory::{ConsumptionInput, Inventory};
use stockbook_platform::{
    LEDGER_COMMITTED_CHANNEL, LedgerCommittedEvent, PgLedgerStore, RedisBus,
    SALES_RECORDED_CHANNEL, SalesRecordedEvent, ServiceConfig, apply_migrations,
    connect_database,
};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

const WORKER_ACTOR: &str = "ops-attribution-worker";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stockbook_ops=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url).await?;
    apply_migrations(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;
    let inventory = Inventory::new(Arc::new(PgLedgerStore::new(pool)), config.attribution);

    let mut pubsub = redis.client().get_async_pubsub().await?;
    pubsub.subscribe(SALES_RECORDED_CHANNEL).await?;
    let mut messages = pubsub.on_message();

    info!(
        sweep_secs = config.sweep_interval.as_secs(),
        "ops worker subscribed to {SALES_RECORDED_CHANNEL}"
    );

    let mut sweep = interval(config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = messages.next() => {
                let msg = msg.with_context(|| {
                    format!("{SALES_RECORDED_CHANNEL} stream ended unexpectedly")
                })?;
                if let Err(err) = handle_message(&inventory, &redis, msg).await {
                    error!("failed to process sale: {err:#}");
                }
            }
            _ = sweep.tick() => {
                if let Err(err) = sweep_backlog(&inventory).await {
                    error!("attribution sweep failed: {err:#}");
                }
            }
        }
    }
}

async fn handle_message(inventory: &Inventory, redis: &RedisBus, msg: Msg) -> Result<()> {
    let payload: String = msg.get_payload()?;
    let record = attribute_sale(inventory, &payload).await?;

    let mut event = LedgerCommittedEvent::new(
        "attribution",
        record.draws.iter().map(|draw| draw.batch_id).collect(),
    );
    event.operation_id = Some(record.operation_id);
    event.committed_at = record.attributed_at;
    redis.publish_json(LEDGER_COMMITTED_CHANNEL, &event).await?;
    Ok(())
}

/// Records the sale and attributes it. Redelivered messages return the original record.
async fn attribute_sale(inventory: &Inventory, payload: &str) -> Result<AttributionRecord> {
    let sale: SalesRecordedEvent =
        serde_json::from_str(payload).context("malformed sales.recorded payload")?;
    let external_ref = sale.external_ref.clone();

    let event = inventory
        .fifo
        .record_consumption(ConsumptionInput {
            external_ref: sale.external_ref,
            sku: sale.sku,
            quantity: sale.quantity,
            event_date: sale.event_date,
            kind: sale.kind,
        })
        .await
        .with_context(|| format!("failed to record sale {external_ref}"))?;
    let record = inventory
        .fifo
        .attribute_event(event.id, WORKER_ACTOR)
        .await
        .with_context(|| format!("failed to attribute sale {external_ref}"))?;

    info!(
        external_ref = %external_ref,
        sku = %record.sku,
        units = record.attributed(),
        cogs = %record.cogs,
        "sale attributed"
    );
    Ok(record)
}

/// Picks up events whose message was lost or whose attribution failed earlier.
async fn sweep_backlog(inventory: &Inventory) -> Result<()> {
    let report = inventory.fifo.run_backlog(None, WORKER_ACTOR).await?;
    for failure in &report.failures {
        warn!(event_id = %failure.event_id, "backlog event not attributed: {}", failure.reason);
    }
    Ok(())
}
