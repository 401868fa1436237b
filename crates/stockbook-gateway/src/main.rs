use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use stockbook_core::{
    AttributionRecord, Batch, BatchId, CommitReceipt, ConsumptionEvent, EventId, LedgerEntry,
    LedgerError, Location, LocationId, PlanId, PositionFilter, StageTransition, StockPosition,
    TransferPlan,
};
use stockbook_inventory::{
    AssemblyOutcome, AssemblyRequest, Availability, BacklogReport, ConsumptionInput,
    DepletionLine, Inventory, MergeOutcome, MergeRequest, Receipt, SplitRequest,
};
use stockbook_platform::{
    AddPlanLineRequest, AdjustmentRequest, AdvanceStageRequest, AssembleRequest,
    CreatePlanRequest, EntryResponse, LEDGER_COMMITTED_CHANNEL, LedgerCommittedEvent,
    MergeBatchesRequest, PgLedgerStore, PlanActionRequest, ReceiptResponse, ReconcileRequest,
    RecordConsumptionRequest, RecordReceiptRequest, RedisBus, RegisterLocationRequest,
    RunBacklogRequest, ServiceConfig, SplitBatchRequest, TransferRequest, apply_migrations,
    connect_database,
};
use tracing::{error, info, warn};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

#[derive(Clone)]
struct AppState {
    inventory: Inventory,
    redis: RedisBus,
}

impl AppState {
    /// Ledger writes are durable before this runs, so a failed publish is logged, not returned.
    async fn announce(&self, event: LedgerCommittedEvent) {
        if let Err(err) = self
            .redis
            .publish_json(LEDGER_COMMITTED_CHANNEL, &event)
            .await
        {
            warn!(operation = %event.operation, "failed to publish ledger event: {err:#}");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AvailabilityQuery {
    batch_id: BatchId,
    location_id: LocationId,
}

#[derive(Debug, Clone, Serialize)]
struct ConsumptionResponse {
    event: ConsumptionEvent,
    attribution: Option<AttributionRecord>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stockbook_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url).await?;
    apply_migrations(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let inventory = Inventory::new(Arc::new(PgLedgerStore::new(pool)), config.attribution);
    let state = AppState { inventory, redis };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/locations", get(list_locations).post(register_location))
        .route("/receipts", post(record_receipt))
        .route("/transfers", post(transfer))
        .route("/adjustments", post(record_adjustment))
        .route("/reconciliations", post(reconcile))
        .route("/positions", get(list_positions))
        .route("/availability", get(availability))
        .route("/batches/merge", post(merge_batches))
        .route("/batches/{batch_id}", get(get_batch))
        .route("/batches/{batch_id}/ledger", get(batch_ledger))
        .route("/batches/{batch_id}/lineage", get(batch_lineage))
        .route("/batches/{batch_id}/split", post(split_batch))
        .route(
            "/batches/{batch_id}/stages",
            get(stage_history).post(advance_stage),
        )
        .route("/assemblies", post(assemble))
        .route("/plans", post(create_plan))
        .route("/plans/{plan_id}", get(get_plan))
        .route("/plans/{plan_id}/lines", post(add_plan_line))
        .route("/plans/{plan_id}/book", post(book_plan))
        .route("/plans/{plan_id}/discard", post(discard_plan))
        .route("/consumption", post(record_consumption))
        .route("/attribution/backlog", post(run_backlog))
        .route("/attribution/{event_id}", get(get_attribution))
        .route("/skus/{sku}/depletion", get(depletion_report))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn register_location(
    State(state): State<AppState>,
    Json(payload): Json<RegisterLocationRequest>,
) -> ApiResult<Location> {
    let location = state
        .inventory
        .ledger
        .register_location(&payload.code, &payload.name, payload.kind)
        .await
        .map_err(ledger_error)?;
    info!(location_id = %location.id, code = %location.code, "location registered");
    Ok(Json(location))
}

async fn list_locations(State(state): State<AppState>) -> ApiResult<Vec<Location>> {
    let locations = state
        .inventory
        .ledger
        .store()
        .locations()
        .await
        .map_err(ledger_error)?;
    Ok(Json(locations))
}

async fn record_receipt(
    State(state): State<AppState>,
    Json(payload): Json<RecordReceiptRequest>,
) -> ApiResult<ReceiptResponse> {
    let batch_id = state
        .inventory
        .ledger
        .record_receipt(
            Receipt {
                sku: payload.sku,
                product_name: payload.product_name,
                location_id: payload.location_id,
                quantity: payload.quantity,
                unit_cost: payload.unit_cost,
                source_reference: payload.source_reference,
                received_at: payload.received_at,
                stage: payload.stage,
            },
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    state
        .announce(LedgerCommittedEvent::new("receipt", vec![batch_id]))
        .await;
    Ok(Json(ReceiptResponse { batch_id }))
}

async fn transfer(
    State(state): State<AppState>,
    Json(payload): Json<TransferRequest>,
) -> ApiResult<CommitReceipt> {
    let receipt = state
        .inventory
        .ledger
        .transfer(
            payload.batch_id,
            payload.from_location,
            payload.to_location,
            payload.quantity,
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    state
        .announce(LedgerCommittedEvent::from_receipt(&receipt))
        .await;
    Ok(Json(receipt))
}

async fn record_adjustment(
    State(state): State<AppState>,
    Json(payload): Json<AdjustmentRequest>,
) -> ApiResult<EntryResponse> {
    let entry_id = state
        .inventory
        .ledger
        .record_adjustment(
            payload.batch_id,
            payload.location_id,
            payload.quantity,
            &payload.reason,
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    let mut event = LedgerCommittedEvent::new("adjustment", vec![payload.batch_id]);
    event.entry_ids.push(entry_id);
    state.announce(event).await;
    Ok(Json(EntryResponse {
        entry_id: Some(entry_id),
    }))
}

async fn reconcile(
    State(state): State<AppState>,
    Json(payload): Json<ReconcileRequest>,
) -> ApiResult<EntryResponse> {
    let entry_id = state
        .inventory
        .ledger
        .reconcile(
            payload.batch_id,
            payload.location_id,
            payload.counted,
            &payload.reason,
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    if let Some(entry_id) = entry_id {
        let mut event = LedgerCommittedEvent::new("reconciliation", vec![payload.batch_id]);
        event.entry_ids.push(entry_id);
        state.announce(event).await;
    }
    Ok(Json(EntryResponse { entry_id }))
}

async fn list_positions(
    State(state): State<AppState>,
    Query(filter): Query<PositionFilter>,
) -> ApiResult<Vec<StockPosition>> {
    let positions = state
        .inventory
        .ledger
        .positions_for(&filter)
        .await
        .map_err(ledger_error)?;
    Ok(Json(positions))
}

async fn availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<Availability> {
    let availability = state
        .inventory
        .reservations
        .availability(query.batch_id, query.location_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(availability))
}

async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> ApiResult<Batch> {
    let batch = state
        .inventory
        .ledger
        .batch(batch_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(batch))
}

async fn batch_ledger(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> ApiResult<Vec<LedgerEntry>> {
    let entries = state
        .inventory
        .ledger
        .ledger_for(batch_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(entries))
}

async fn batch_lineage(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> ApiResult<Vec<Batch>> {
    let lineage = state
        .inventory
        .ledger
        .lineage(batch_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(lineage))
}

async fn split_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
    Json(payload): Json<SplitBatchRequest>,
) -> ApiResult<ReceiptResponse> {
    let derived = state
        .inventory
        .lifecycle
        .split(
            SplitRequest {
                batch_id,
                quantity: payload.quantity,
                from_location: payload.from_location,
                destination: payload.destination,
                note: payload.note,
            },
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    state
        .announce(LedgerCommittedEvent::new("split", vec![batch_id, derived]))
        .await;
    Ok(Json(ReceiptResponse { batch_id: derived }))
}

async fn merge_batches(
    State(state): State<AppState>,
    Json(payload): Json<MergeBatchesRequest>,
) -> ApiResult<MergeOutcome> {
    let mut touched = payload.batch_ids.clone();
    let outcome = state
        .inventory
        .lifecycle
        .merge(
            MergeRequest {
                batch_ids: payload.batch_ids,
                note: payload.note,
                destination: payload.destination,
            },
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    touched.push(outcome.batch_id);
    state
        .announce(LedgerCommittedEvent::new("merge", touched))
        .await;
    Ok(Json(outcome))
}

async fn assemble(
    State(state): State<AppState>,
    Json(payload): Json<AssembleRequest>,
) -> ApiResult<AssemblyOutcome> {
    let mut touched: Vec<BatchId> = payload
        .components
        .iter()
        .map(|component| component.batch_id)
        .collect();
    let outcome = state
        .inventory
        .lifecycle
        .assemble(
            AssemblyRequest {
                components: payload.components,
                sku: payload.sku,
                product_name: payload.product_name,
                quantity: payload.quantity,
                location_id: payload.location_id,
                note: payload.note,
            },
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;

    touched.push(outcome.batch_id);
    state
        .announce(LedgerCommittedEvent::new("assembly", touched))
        .await;
    Ok(Json(outcome))
}

async fn advance_stage(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
    Json(payload): Json<AdvanceStageRequest>,
) -> ApiResult<Option<StageTransition>> {
    let transition = state
        .inventory
        .ledger
        .advance_stage(batch_id, payload.stage, &payload.actor)
        .await
        .map_err(ledger_error)?;
    Ok(Json(transition))
}

async fn stage_history(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> ApiResult<Vec<StageTransition>> {
    let history = state
        .inventory
        .ledger
        .stage_history(batch_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(history))
}

async fn create_plan(
    State(state): State<AppState>,
    Json(payload): Json<CreatePlanRequest>,
) -> ApiResult<TransferPlan> {
    let plan = state
        .inventory
        .reservations
        .create_plan(
            payload.from_location,
            payload.to_location,
            payload.note,
            &payload.actor,
        )
        .await
        .map_err(ledger_error)?;
    Ok(Json(plan))
}

async fn get_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<PlanId>,
) -> ApiResult<TransferPlan> {
    let plan = state
        .inventory
        .reservations
        .plan(plan_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(plan))
}

async fn add_plan_line(
    State(state): State<AppState>,
    Path(plan_id): Path<PlanId>,
    Json(payload): Json<AddPlanLineRequest>,
) -> ApiResult<TransferPlan> {
    let plan = state
        .inventory
        .reservations
        .add_line(plan_id, payload.batch_id, payload.quantity)
        .await
        .map_err(ledger_error)?;
    Ok(Json(plan))
}

async fn book_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<PlanId>,
    Json(payload): Json<PlanActionRequest>,
) -> ApiResult<CommitReceipt> {
    let receipt = state
        .inventory
        .reservations
        .book_plan(plan_id, &payload.actor)
        .await
        .map_err(ledger_error)?;

    state
        .announce(LedgerCommittedEvent::from_receipt(&receipt))
        .await;
    Ok(Json(receipt))
}

async fn discard_plan(
    State(state): State<AppState>,
    Path(plan_id): Path<PlanId>,
    Json(payload): Json<PlanActionRequest>,
) -> ApiResult<TransferPlan> {
    let reservations = &state.inventory.reservations;
    reservations
        .discard_plan(plan_id, &payload.actor)
        .await
        .map_err(ledger_error)?;
    let plan = reservations.plan(plan_id).await.map_err(ledger_error)?;
    Ok(Json(plan))
}

async fn record_consumption(
    State(state): State<AppState>,
    Json(payload): Json<RecordConsumptionRequest>,
) -> ApiResult<ConsumptionResponse> {
    let fifo = &state.inventory.fifo;
    let event = fifo
        .record_consumption(ConsumptionInput {
            external_ref: payload.external_ref,
            sku: payload.sku,
            quantity: payload.quantity,
            event_date: payload.event_date,
            kind: payload.kind,
        })
        .await
        .map_err(ledger_error)?;

    let attribution = if payload.attribute_now {
        let record = fifo
            .attribute_event(event.id, &payload.actor)
            .await
            .map_err(ledger_error)?;
        let mut committed = LedgerCommittedEvent::new(
            "attribution",
            record.draws.iter().map(|draw| draw.batch_id).collect(),
        );
        committed.operation_id = Some(record.operation_id);
        state.announce(committed).await;
        Some(record)
    } else {
        None
    };

    Ok(Json(ConsumptionResponse { event, attribution }))
}

async fn run_backlog(
    State(state): State<AppState>,
    Json(payload): Json<RunBacklogRequest>,
) -> ApiResult<BacklogReport> {
    let report = state
        .inventory
        .fifo
        .run_backlog(payload.limit, &payload.actor)
        .await
        .map_err(ledger_error)?;
    Ok(Json(report))
}

async fn get_attribution(
    State(state): State<AppState>,
    Path(event_id): Path<EventId>,
) -> ApiResult<AttributionRecord> {
    let record = state
        .inventory
        .fifo
        .attribution_for(event_id)
        .await
        .map_err(ledger_error)?
        .ok_or_else(|| ledger_error(LedgerError::event_not_found(event_id)))?;
    Ok(Json(record))
}

async fn depletion_report(
    State(state): State<AppState>,
    Path(sku): Path<String>,
) -> ApiResult<Vec<DepletionLine>> {
    let report = state
        .inventory
        .fifo
        .depletion_report(&sku)
        .await
        .map_err(ledger_error)?;
    Ok(Json(report))
}

fn ledger_error(err: LedgerError) -> (StatusCode, String) {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("ledger storage failure: {err}");
    }
    (status, err.to_string())
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::InvalidMovement(_)
        | LedgerError::EmptyMergeSet
        | LedgerError::MixedProduct { .. } => StatusCode::BAD_REQUEST,
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::InsufficientStock { .. }
        | LedgerError::Conflict { .. }
        | LedgerError::PlanNotDraft { .. }
        | LedgerError::AlreadyAttributed { .. } => StatusCode::CONFLICT,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use stockbook_core::PlanStatus;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn business_refusals_are_client_errors() {
        let id = Uuid::new_v4();
        assert_eq!(
            status_for(&LedgerError::InsufficientStock {
                batch_id: id,
                location_id: id,
                requested: 5,
                available: 2,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&LedgerError::PlanNotDraft {
                plan_id: id,
                status: PlanStatus::Booked,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_for(&LedgerError::EmptyMergeSet), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&LedgerError::batch_not_found(id)),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn storage_faults_surface_as_server_errors() {
        let (status, body) = ledger_error(LedgerError::Storage("connection reset".to_string()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.contains("connection reset"));
    }
}
