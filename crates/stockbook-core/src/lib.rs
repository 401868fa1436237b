pub mod commit;
pub mod costing;
pub mod error;
pub mod events;
pub mod models;
pub mod projection;
pub mod storage;

pub use commit::{
    AvailabilityCheck, BalanceSheet, BatchBalance, Commit, ExpectedPosition, PlanUpdate,
    ReservationScope, validate,
};
pub use costing::{BlendedCost, COST_SCALE, add_value, blend, line_cost, round_cost, spread};
pub use error::{LedgerError, LedgerResult};
pub use events::{CommitReceipt, OperationKind};
pub use models::{
    AttributionDraw, AttributionRecord, Batch, BatchId, ConsumptionEvent, ConsumptionKind,
    Direction, EntryFilter, EntryId, EventId, LedgerEntry, LifecycleStage, Location, LocationId,
    LocationKind, MovementType, NewEntry, PlanId, PlanStatus, PositionFilter, Reservation,
    StageTransition, StockPosition, TransferLine, TransferPlan, UnattributedShortfall,
};
pub use projection::{batch_net, project, sort_fifo};
pub use storage::LedgerStore;
