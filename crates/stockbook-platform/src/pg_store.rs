use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use stockbook_core::{
    AttributionDraw, AttributionRecord, BalanceSheet, Batch, BatchBalance, BatchId, Commit,
    CommitReceipt, ConsumptionEvent, ConsumptionKind, EntryFilter, EventId, LedgerEntry,
    LedgerError, LedgerResult, LedgerStore, LifecycleStage, Location, LocationId, LocationKind,
    MovementType, PlanId, PlanStatus, PositionFilter, Reservation, StageTransition,
    StockPosition, TransferLine, TransferPlan, line_cost, project, validate,
};
use tracing::warn;
use uuid::Uuid;

/// Attempts at a commit that keeps losing serialization races before it is reported.
const CONTENTION_ATTEMPTS: u32 = 5;

/// Ledger store backed by Postgres.
///
/// Each commit runs in a serializable transaction that locks the touched batch rows in id
/// order, rebuilds the balance sheet from committed entries and runs the shared validator
/// before inserting anything.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn try_commit(
        &self,
        commit: &Commit,
    ) -> Result<LedgerResult<CommitReceipt>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;

        let sheet = load_sheet(&mut tx, commit).await?;
        if let Err(err) = validate(commit, &sheet) {
            return Ok(Err(err));
        }
        let total_costs = match commit
            .entries
            .iter()
            .map(|entry| line_cost(entry.quantity, entry.unit_cost))
            .collect::<LedgerResult<Vec<Decimal>>>()
        {
            Ok(total_costs) => total_costs,
            Err(err) => return Ok(Err(err)),
        };

        let committed_at = Utc::now();
        for batch in &commit.new_batches {
            insert_batch(&mut tx, batch).await?;
        }

        let mut entries = Vec::with_capacity(commit.entries.len());
        for (entry, total_cost) in commit.entries.iter().zip(total_costs) {
            let row = sqlx::query(
                "INSERT INTO ledger_entries (operation_id, batch_id, location_id, quantity, movement_type, unit_cost, total_cost, reason, actor, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            )
            .bind(commit.operation_id)
            .bind(entry.batch_id)
            .bind(entry.location_id)
            .bind(entry.quantity)
            .bind(entry.movement_type.as_str())
            .bind(entry.unit_cost)
            .bind(total_cost)
            .bind(entry.reason.as_deref())
            .bind(&commit.actor)
            .bind(committed_at)
            .fetch_one(&mut *tx)
            .await?;

            entries.push(LedgerEntry {
                id: row.try_get("id")?,
                operation_id: commit.operation_id,
                batch_id: entry.batch_id,
                location_id: entry.location_id,
                quantity: entry.quantity,
                movement_type: entry.movement_type,
                unit_cost: entry.unit_cost,
                total_cost,
                reason: entry.reason.clone(),
                actor: commit.actor.clone(),
                created_at: committed_at,
            });
        }

        if let Some(update) = commit.plan_update {
            sqlx::query("UPDATE transfer_plans SET status = $2, closed_at = $3 WHERE id = $1")
                .bind(update.plan_id)
                .bind(update.status.as_str())
                .bind(committed_at)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(record) = &commit.attribution {
            sqlx::query("UPDATE consumption_events SET processed_at = $2 WHERE id = $1")
                .bind(record.event_id)
                .bind(committed_at)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO attributions (event_id, operation_id, sku, kind, event_date, requested, unattributed, cogs, draws, attributed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(record.event_id)
            .bind(commit.operation_id)
            .bind(&record.sku)
            .bind(record.kind.as_str())
            .bind(record.event_date)
            .bind(record.requested)
            .bind(record.unattributed)
            .bind(record.cogs)
            .bind(Json(&record.draws))
            .bind(committed_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Ok(CommitReceipt {
            operation_id: commit.operation_id,
            kind: commit.kind,
            created_batches: commit.new_batches.iter().map(|batch| batch.id).collect(),
            entries,
            committed_at,
        }))
    }

    async fn batches_by_id(&self, ids: &[BatchId]) -> LedgerResult<HashMap<BatchId, Batch>> {
        let rows = sqlx::query(&format!("{BATCH_SELECT} WHERE id = ANY($1)"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        rows.iter()
            .map(batch_from_row)
            .map(|batch| batch.map(|batch| (batch.id, batch)))
            .collect()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn commit(&self, commit: Commit) -> LedgerResult<CommitReceipt> {
        let mut attempt = 1;
        loop {
            match self.try_commit(&commit).await {
                Ok(outcome) => return outcome,
                Err(err) if is_contention(&err) && attempt < CONTENTION_ATTEMPTS => {
                    warn!(
                        operation_id = %commit.operation_id,
                        kind = commit.kind.as_str(),
                        attempt,
                        "retrying commit after serialization failure"
                    );
                    attempt += 1;
                }
                Err(err) => return Err(storage(err)),
            }
        }
    }

    async fn register_location(&self, location: Location) -> LedgerResult<Location> {
        let inserted = sqlx::query(
            "INSERT INTO locations (id, code, name, kind, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(location.id)
        .bind(&location.code)
        .bind(&location.name)
        .bind(location.kind.as_str())
        .bind(location.created_at)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(location),
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                Err(LedgerError::invalid(format!(
                    "location code {} already registered",
                    location.code
                )))
            }
            Err(err) => Err(storage(err)),
        }
    }

    async fn location(&self, id: LocationId) -> LedgerResult<Option<Location>> {
        let row =
            sqlx::query("SELECT id, code, name, kind, created_at FROM locations WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        row.as_ref().map(location_from_row).transpose()
    }

    async fn locations(&self) -> LedgerResult<Vec<Location>> {
        let rows =
            sqlx::query("SELECT id, code, name, kind, created_at FROM locations ORDER BY code")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
        rows.iter().map(location_from_row).collect()
    }

    async fn batch(&self, id: BatchId) -> LedgerResult<Option<Batch>> {
        let row = sqlx::query(&format!("{BATCH_SELECT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(batch_from_row).transpose()
    }

    async fn batches_for_sku(&self, sku: &str) -> LedgerResult<Vec<Batch>> {
        let rows = sqlx::query(&format!(
            "{BATCH_SELECT} WHERE sku = $1 ORDER BY received_at, created_at, id"
        ))
        .bind(sku)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn record_stage(&self, transition: StageTransition) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let updated = sqlx::query("UPDATE batches SET stage = $2 WHERE id = $1")
            .bind(transition.batch_id)
            .bind(transition.to.as_str())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        if updated.rows_affected() == 0 {
            return Err(LedgerError::batch_not_found(transition.batch_id));
        }

        sqlx::query(
            "INSERT INTO stage_transitions (batch_id, from_stage, to_stage, actor, recorded_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(transition.batch_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(&transition.actor)
        .bind(transition.recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)
    }

    async fn stage_history(&self, batch_id: BatchId) -> LedgerResult<Vec<StageTransition>> {
        let rows = sqlx::query(
            "SELECT batch_id, from_stage, to_stage, actor, recorded_at FROM stage_transitions WHERE batch_id = $1 ORDER BY id",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                Ok(StageTransition {
                    batch_id: row.try_get("batch_id").map_err(storage)?,
                    from: decode(row, "from_stage", LifecycleStage::parse)?,
                    to: decode(row, "to_stage", LifecycleStage::parse)?,
                    actor: row.try_get("actor").map_err(storage)?,
                    recorded_at: row.try_get("recorded_at").map_err(storage)?,
                })
            })
            .collect()
    }

    async fn entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT id, operation_id, batch_id, location_id, quantity, movement_type, unit_cost, total_cost, reason, actor, created_at FROM ledger_entries WHERE ($1::uuid IS NULL OR batch_id = $1) AND ($2::uuid IS NULL OR location_id = $2) AND ($3::uuid IS NULL OR operation_id = $3) ORDER BY id",
        )
        .bind(filter.batch_id)
        .bind(filter.location_id)
        .bind(filter.operation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn positions(&self, filter: &PositionFilter) -> LedgerResult<Vec<StockPosition>> {
        let rows = sqlx::query(
            "SELECT e.id, e.operation_id, e.batch_id, e.location_id, e.quantity, e.movement_type, e.unit_cost, e.total_cost, e.reason, e.actor, e.created_at FROM ledger_entries e JOIN batches b ON b.id = e.batch_id WHERE ($1::uuid IS NULL OR e.batch_id = $1) AND ($2::uuid IS NULL OR e.location_id = $2) AND ($3::text IS NULL OR b.sku = $3) ORDER BY e.id",
        )
        .bind(filter.batch_id)
        .bind(filter.location_id)
        .bind(filter.sku.as_deref())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        let entries = rows
            .iter()
            .map(entry_from_row)
            .collect::<LedgerResult<Vec<LedgerEntry>>>()?;

        let mut ids: Vec<BatchId> = entries.iter().map(|entry| entry.batch_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let batches = self.batches_by_id(&ids).await?;

        Ok(project(&batches, &entries, filter))
    }

    async fn create_plan(&self, plan: TransferPlan) -> LedgerResult<TransferPlan> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query(
            "INSERT INTO transfer_plans (id, from_location, to_location, status, note, created_by, created_at, closed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(plan.id)
        .bind(plan.from_location)
        .bind(plan.to_location)
        .bind(plan.status.as_str())
        .bind(plan.note.as_deref())
        .bind(&plan.created_by)
        .bind(plan.created_at)
        .bind(plan.closed_at)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        for (index, line) in plan.lines.iter().enumerate() {
            insert_plan_line(&mut tx, plan.id, index as i32 + 1, line).await?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(plan)
    }

    async fn add_plan_line(
        &self,
        plan_id: PlanId,
        line: TransferLine,
    ) -> LedgerResult<TransferPlan> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let row = sqlx::query("SELECT status FROM transfer_plans WHERE id = $1 FOR UPDATE")
            .bind(plan_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or_else(|| LedgerError::plan_not_found(plan_id))?;
        let status = decode(&row, "status", PlanStatus::parse)?;
        if status != PlanStatus::Draft {
            return Err(LedgerError::PlanNotDraft { plan_id, status });
        }

        let next: i32 = sqlx::query(
            "SELECT COALESCE(MAX(line_no), 0) + 1 AS next FROM transfer_plan_lines WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_one(&mut *tx)
        .await
        .and_then(|row| row.try_get("next"))
        .map_err(storage)?;
        insert_plan_line(&mut tx, plan_id, next, &line).await?;
        tx.commit().await.map_err(storage)?;

        self.plan(plan_id)
            .await?
            .ok_or_else(|| LedgerError::plan_not_found(plan_id))
    }

    async fn plan(&self, id: PlanId) -> LedgerResult<Option<TransferPlan>> {
        let Some(row) = sqlx::query(
            "SELECT id, from_location, to_location, status, note, created_by, created_at, closed_at FROM transfer_plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        else {
            return Ok(None);
        };

        let lines = sqlx::query(
            "SELECT batch_id, quantity FROM transfer_plan_lines WHERE plan_id = $1 ORDER BY line_no",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .iter()
        .map(|line| {
            Ok(TransferLine {
                batch_id: line.try_get("batch_id").map_err(storage)?,
                quantity: line.try_get("quantity").map_err(storage)?,
            })
        })
        .collect::<LedgerResult<Vec<TransferLine>>>()?;

        Ok(Some(TransferPlan {
            id: row.try_get("id").map_err(storage)?,
            from_location: row.try_get("from_location").map_err(storage)?,
            to_location: row.try_get("to_location").map_err(storage)?,
            status: decode(&row, "status", PlanStatus::parse)?,
            lines,
            note: row.try_get("note").map_err(storage)?,
            created_by: row.try_get("created_by").map_err(storage)?,
            created_at: row.try_get("created_at").map_err(storage)?,
            closed_at: row.try_get("closed_at").map_err(storage)?,
        }))
    }

    async fn draft_reservations(
        &self,
        batch_id: Option<BatchId>,
        location_id: Option<LocationId>,
    ) -> LedgerResult<Vec<Reservation>> {
        let rows = sqlx::query(&format!(
            "{RESERVATION_SELECT} AND ($1::uuid IS NULL OR l.batch_id = $1) AND ($2::uuid IS NULL OR p.from_location = $2) ORDER BY p.created_at, p.id, l.line_no"
        ))
        .bind(batch_id)
        .bind(location_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn record_consumption(&self, event: ConsumptionEvent) -> LedgerResult<ConsumptionEvent> {
        sqlx::query(
            "INSERT INTO consumption_events (id, external_ref, sku, quantity, event_date, kind, recorded_at, processed_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) ON CONFLICT (external_ref) DO NOTHING",
        )
        .bind(event.id)
        .bind(&event.external_ref)
        .bind(&event.sku)
        .bind(event.quantity)
        .bind(event.event_date)
        .bind(event.kind.as_str())
        .bind(event.recorded_at)
        .bind(event.processed_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        let row = sqlx::query(&format!("{EVENT_SELECT} WHERE external_ref = $1"))
            .bind(&event.external_ref)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        event_from_row(&row)
    }

    async fn consumption(&self, id: EventId) -> LedgerResult<Option<ConsumptionEvent>> {
        let row = sqlx::query(&format!("{EVENT_SELECT} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn pending_consumption(&self, limit: usize) -> LedgerResult<Vec<ConsumptionEvent>> {
        let rows = sqlx::query(&format!(
            "{EVENT_SELECT} WHERE processed_at IS NULL ORDER BY event_date, recorded_at, id LIMIT $1"
        ))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(event_from_row).collect()
    }

    async fn attribution(&self, event_id: EventId) -> LedgerResult<Option<AttributionRecord>> {
        let row = sqlx::query(&format!("{ATTRIBUTION_SELECT} WHERE event_id = $1"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(attribution_from_row).transpose()
    }

    async fn attributions_for_sku(&self, sku: &str) -> LedgerResult<Vec<AttributionRecord>> {
        let rows = sqlx::query(&format!(
            "{ATTRIBUTION_SELECT} WHERE sku = $1 ORDER BY attributed_at, event_id"
        ))
        .bind(sku)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(attribution_from_row).collect()
    }
}

const BATCH_SELECT: &str = "SELECT id, sku, product_name, original_quantity, unit_cost, received_at, stage, source_reference, parents, note, created_at FROM batches";
const EVENT_SELECT: &str = "SELECT id, external_ref, sku, quantity, event_date, kind, recorded_at, processed_at FROM consumption_events";
const ATTRIBUTION_SELECT: &str = "SELECT event_id, operation_id, sku, kind, event_date, requested, unattributed, cogs, draws, attributed_at FROM attributions";
const RESERVATION_SELECT: &str = "SELECT p.id AS plan_id, p.created_at AS plan_created_at, p.from_location, l.batch_id, l.quantity FROM transfer_plan_lines l JOIN transfer_plans p ON p.id = l.plan_id WHERE p.status = 'draft'";

async fn load_sheet(
    tx: &mut Transaction<'_, Postgres>,
    commit: &Commit,
) -> Result<BalanceSheet, sqlx::Error> {
    let touched: Vec<BatchId> = commit.touched_batches().into_iter().collect();
    let mut sheet = BalanceSheet::default();

    let locked = sqlx::query(
        "SELECT id, original_quantity FROM batches WHERE id = ANY($1) ORDER BY id FOR UPDATE",
    )
    .bind(&touched)
    .fetch_all(&mut **tx)
    .await?;
    for row in &locked {
        sheet.batches.insert(
            row.try_get("id")?,
            BatchBalance {
                original_quantity: row.try_get("original_quantity")?,
                net: 0,
            },
        );
    }

    let balances = sqlx::query(
        "SELECT batch_id, location_id, SUM(quantity)::BIGINT AS on_hand FROM ledger_entries WHERE batch_id = ANY($1) GROUP BY batch_id, location_id",
    )
    .bind(&touched)
    .fetch_all(&mut **tx)
    .await?;
    for row in &balances {
        let batch_id: BatchId = row.try_get("batch_id")?;
        let on_hand: i64 = row.try_get("on_hand")?;
        sheet
            .positions
            .insert((batch_id, row.try_get("location_id")?), on_hand);
        if let Some(balance) = sheet.batches.get_mut(&batch_id) {
            balance.net += on_hand;
        }
    }

    let locations: Vec<LocationId> = commit.touched_locations().into_iter().collect();
    let known = sqlx::query("SELECT id FROM locations WHERE id = ANY($1)")
        .bind(&locations)
        .fetch_all(&mut **tx)
        .await?;
    for row in &known {
        sheet.locations.insert(row.try_get("id")?);
    }

    let drafts = sqlx::query(&format!("{RESERVATION_SELECT} AND l.batch_id = ANY($1)"))
        .bind(&touched)
        .fetch_all(&mut **tx)
        .await?;
    for row in &drafts {
        sheet.reservations.push(Reservation {
            plan_id: row.try_get("plan_id")?,
            plan_created_at: row.try_get("plan_created_at")?,
            batch_id: row.try_get("batch_id")?,
            location_id: row.try_get("from_location")?,
            quantity: row.try_get("quantity")?,
        });
    }

    if let Some(update) = commit.plan_update {
        let row = sqlx::query("SELECT status FROM transfer_plans WHERE id = $1 FOR UPDATE")
            .bind(update.plan_id)
            .fetch_optional(&mut **tx)
            .await?;
        if let Some(row) = row {
            let raw: String = row.try_get("status")?;
            let status = PlanStatus::parse(&raw)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown plan status {raw}").into()))?;
            sheet.plan_status = Some((update.plan_id, status));
        }
    }

    if let Some(event_id) = commit.event_id() {
        let row =
            sqlx::query("SELECT processed_at FROM consumption_events WHERE id = $1 FOR UPDATE")
                .bind(event_id)
                .fetch_optional(&mut **tx)
                .await?;
        if let Some(row) = row {
            let processed_at: Option<DateTime<Utc>> = row.try_get("processed_at")?;
            sheet.event_processed = Some((event_id, processed_at.is_some()));
        }
    }

    Ok(sheet)
}

async fn insert_batch(
    tx: &mut Transaction<'_, Postgres>,
    batch: &Batch,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO batches (id, sku, product_name, original_quantity, unit_cost, received_at, stage, source_reference, parents, note, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(batch.id)
    .bind(&batch.sku)
    .bind(&batch.product_name)
    .bind(batch.original_quantity)
    .bind(batch.unit_cost)
    .bind(batch.received_at)
    .bind(batch.stage.as_str())
    .bind(batch.source_reference.as_deref())
    .bind(&batch.parents)
    .bind(batch.note.as_deref())
    .bind(batch.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_plan_line(
    tx: &mut Transaction<'_, Postgres>,
    plan_id: PlanId,
    line_no: i32,
    line: &TransferLine,
) -> LedgerResult<()> {
    sqlx::query(
        "INSERT INTO transfer_plan_lines (plan_id, line_no, batch_id, quantity) VALUES ($1, $2, $3, $4)",
    )
    .bind(plan_id)
    .bind(line_no)
    .bind(line.batch_id)
    .bind(line.quantity)
    .execute(&mut **tx)
    .await
    .map_err(|err| {
        if err
            .as_database_error()
            .is_some_and(|db| db.is_foreign_key_violation())
        {
            LedgerError::invalid(format!("unknown batch {}", line.batch_id))
        } else {
            storage(err)
        }
    })?;
    Ok(())
}

fn storage(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

fn is_contention(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "40001" || code == "40P01")
}

fn decode<T>(row: &PgRow, column: &str, parse: fn(&str) -> Option<T>) -> LedgerResult<T> {
    let raw: String = row.try_get(column).map_err(storage)?;
    parse(&raw).ok_or_else(|| LedgerError::Storage(format!("unrecognised {column} value '{raw}'")))
}

fn location_from_row(row: &PgRow) -> LedgerResult<Location> {
    Ok(Location {
        id: row.try_get("id").map_err(storage)?,
        code: row.try_get("code").map_err(storage)?,
        name: row.try_get("name").map_err(storage)?,
        kind: decode(row, "kind", LocationKind::parse)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn batch_from_row(row: &PgRow) -> LedgerResult<Batch> {
    Ok(Batch {
        id: row.try_get("id").map_err(storage)?,
        sku: row.try_get("sku").map_err(storage)?,
        product_name: row.try_get("product_name").map_err(storage)?,
        original_quantity: row.try_get("original_quantity").map_err(storage)?,
        unit_cost: row.try_get::<Decimal, _>("unit_cost").map_err(storage)?,
        received_at: row.try_get("received_at").map_err(storage)?,
        stage: decode(row, "stage", LifecycleStage::parse)?,
        source_reference: row.try_get("source_reference").map_err(storage)?,
        parents: row.try_get::<Vec<Uuid>, _>("parents").map_err(storage)?,
        note: row.try_get("note").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn entry_from_row(row: &PgRow) -> LedgerResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.try_get("id").map_err(storage)?,
        operation_id: row.try_get("operation_id").map_err(storage)?,
        batch_id: row.try_get("batch_id").map_err(storage)?,
        location_id: row.try_get("location_id").map_err(storage)?,
        quantity: row.try_get("quantity").map_err(storage)?,
        movement_type: decode(row, "movement_type", MovementType::parse)?,
        unit_cost: row.try_get("unit_cost").map_err(storage)?,
        total_cost: row.try_get("total_cost").map_err(storage)?,
        reason: row.try_get("reason").map_err(storage)?,
        actor: row.try_get("actor").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
    })
}

fn reservation_from_row(row: &PgRow) -> LedgerResult<Reservation> {
    Ok(Reservation {
        plan_id: row.try_get("plan_id").map_err(storage)?,
        plan_created_at: row.try_get("plan_created_at").map_err(storage)?,
        batch_id: row.try_get("batch_id").map_err(storage)?,
        location_id: row.try_get("from_location").map_err(storage)?,
        quantity: row.try_get("quantity").map_err(storage)?,
    })
}

fn event_from_row(row: &PgRow) -> LedgerResult<ConsumptionEvent> {
    Ok(ConsumptionEvent {
        id: row.try_get("id").map_err(storage)?,
        external_ref: row.try_get("external_ref").map_err(storage)?,
        sku: row.try_get("sku").map_err(storage)?,
        quantity: row.try_get("quantity").map_err(storage)?,
        event_date: row.try_get("event_date").map_err(storage)?,
        kind: decode(row, "kind", ConsumptionKind::parse)?,
        recorded_at: row.try_get("recorded_at").map_err(storage)?,
        processed_at: row.try_get("processed_at").map_err(storage)?,
    })
}

fn attribution_from_row(row: &PgRow) -> LedgerResult<AttributionRecord> {
    let draws: Json<Vec<AttributionDraw>> = row.try_get("draws").map_err(storage)?;
    Ok(AttributionRecord {
        event_id: row.try_get("event_id").map_err(storage)?,
        operation_id: row.try_get("operation_id").map_err(storage)?,
        sku: row.try_get("sku").map_err(storage)?,
        kind: decode(row, "kind", ConsumptionKind::parse)?,
        event_date: row.try_get("event_date").map_err(storage)?,
        requested: row.try_get("requested").map_err(storage)?,
        draws: draws.0,
        unattributed: row.try_get("unattributed").map_err(storage)?,
        cogs: row.try_get("cogs").map_err(storage)?,
        attributed_at: row.try_get("attributed_at").map_err(storage)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_database_contention_is_retried() {
        assert!(!is_contention(&sqlx::Error::RowNotFound));
        assert!(!is_contention(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn driver_failures_surface_as_storage_errors() {
        let err = storage(sqlx::Error::RowNotFound);
        assert!(matches!(err, LedgerError::Storage(ref message) if message.contains("no rows")));
        assert!(!err.is_retryable());
    }
}
