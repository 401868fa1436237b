pub mod config;
pub mod contracts;
pub mod db;
pub mod pg_store;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    AddPlanLineRequest, AdjustmentRequest, AdvanceStageRequest, AssembleRequest,
    CreatePlanRequest, EntryResponse, LEDGER_COMMITTED_CHANNEL, LedgerCommittedEvent,
    MergeBatchesRequest, PlanActionRequest, ReceiptResponse, ReconcileRequest,
    RecordConsumptionRequest, RecordReceiptRequest, RegisterLocationRequest, RunBacklogRequest,
    SALES_RECORDED_CHANNEL, SalesRecordedEvent, SplitBatchRequest, TransferRequest,
};
pub use db::{apply_migrations, connect_database};
pub use pg_store::PgLedgerStore;
pub use redis_bus::RedisBus;
