use async_trait::async_trait;
use uuid::Uuid;

use crate::commit::Commit;
use crate::error::LedgerResult;
use crate::events::CommitReceipt;
use crate::models::{
    AttributionRecord, Batch, BatchId, ConsumptionEvent, EntryFilter, EventId, LedgerEntry,
    Location, LocationId, PlanId, PositionFilter, Reservation, StageTransition, StockPosition,
    TransferLine, TransferPlan,
};

/// Persistence seam for the ledger.
///
/// `commit` is the only path that writes ledger entries. Implementations must run
/// [`crate::commit::validate`] against state read under the same lock or transaction that
/// persists the commit, so concurrent commits on overlapping batches serialize.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn commit(&self, commit: Commit) -> LedgerResult<CommitReceipt>;

    async fn register_location(&self, location: Location) -> LedgerResult<Location>;
    async fn location(&self, id: LocationId) -> LedgerResult<Option<Location>>;
    async fn locations(&self) -> LedgerResult<Vec<Location>>;

    async fn batch(&self, id: BatchId) -> LedgerResult<Option<Batch>>;
    async fn batches_for_sku(&self, sku: &str) -> LedgerResult<Vec<Batch>>;
    async fn record_stage(&self, transition: StageTransition) -> LedgerResult<()>;
    async fn stage_history(&self, batch_id: BatchId) -> LedgerResult<Vec<StageTransition>>;

    /// Entries in commit order.
    async fn entries(&self, filter: &EntryFilter) -> LedgerResult<Vec<LedgerEntry>>;
    /// Point-in-time projection over committed entries.
    async fn positions(&self, filter: &PositionFilter) -> LedgerResult<Vec<StockPosition>>;

    async fn create_plan(&self, plan: TransferPlan) -> LedgerResult<TransferPlan>;
    /// Appends a line to a plan that is still in draft.
    async fn add_plan_line(&self, plan_id: PlanId, line: TransferLine)
    -> LedgerResult<TransferPlan>;
    async fn plan(&self, id: PlanId) -> LedgerResult<Option<TransferPlan>>;
    async fn draft_reservations(
        &self,
        batch_id: Option<BatchId>,
        location_id: Option<LocationId>,
    ) -> LedgerResult<Vec<Reservation>>;

    /// Stores a consumption event, or returns the one already stored under its external ref.
    async fn record_consumption(&self, event: ConsumptionEvent) -> LedgerResult<ConsumptionEvent>;
    async fn consumption(&self, id: EventId) -> LedgerResult<Option<ConsumptionEvent>>;
    /// Unprocessed events, oldest event date first.
    async fn pending_consumption(&self, limit: usize) -> LedgerResult<Vec<ConsumptionEvent>>;
    async fn attribution(&self, event_id: EventId) -> LedgerResult<Option<AttributionRecord>>;
    async fn attributions_for_sku(&self, sku: &str) -> LedgerResult<Vec<AttributionRecord>>;

    async fn operation_entries(&self, operation_id: Uuid) -> LedgerResult<Vec<LedgerEntry>> {
        self.entries(&EntryFilter {
            operation_id: Some(operation_id),
            ..EntryFilter::default()
        })
        .await
    }
}
