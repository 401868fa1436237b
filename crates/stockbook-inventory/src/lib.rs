pub mod fifo;
pub mod ledger;
pub mod lifecycle;
pub mod reservations;

use std::sync::Arc;

use stockbook_core::LedgerStore;

pub use fifo::{
    AttributionSettings, BacklogFailure, BacklogReport, ConsumptionInput, DepletionLine,
    FifoAttributor, plan_draws,
};
pub use ledger::{LedgerService, Receipt};
pub use lifecycle::{
    AssemblyOutcome, AssemblyRequest, BatchLifecycle, Component, MergeOutcome, MergeRequest,
    SplitRequest,
};
pub use reservations::{Availability, ReservationService};

/// The inventory services sharing one store.
#[derive(Clone)]
pub struct Inventory {
    pub ledger: LedgerService,
    pub reservations: ReservationService,
    pub lifecycle: BatchLifecycle,
    pub fifo: FifoAttributor,
}

impl Inventory {
    pub fn new(store: Arc<dyn LedgerStore>, settings: AttributionSettings) -> Self {
        Self {
            ledger: LedgerService::new(store.clone()),
            reservations: ReservationService::new(store.clone()),
            lifecycle: BatchLifecycle::new(store.clone()),
            fifo: FifoAttributor::new(store, settings),
        }
    }
}
