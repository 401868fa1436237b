use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stockbook_core::{
    AvailabilityCheck, BatchId, Commit, CommitReceipt, LedgerError, LedgerResult, LedgerStore,
    LocationId, MovementType, OperationKind, PlanId, PlanStatus, PositionFilter,
    ReservationScope, TransferLine, TransferPlan,
};
use tracing::info;
use uuid::Uuid;

use crate::ledger::{movement, positive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub on_hand: i64,
    pub reserved: i64,
    pub available: i64,
}

/// Draft transfer plans and the advisory reservations they hold.
///
/// Reading availability never writes. Booking re-validates inside the commit, yielding only
/// to drafts created before the plan being booked.
#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn LedgerStore>,
}

impl ReservationService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn reserved_quantity(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
    ) -> LedgerResult<i64> {
        Ok(self
            .store
            .draft_reservations(Some(batch_id), Some(location_id))
            .await?
            .iter()
            .map(|reservation| reservation.quantity)
            .sum())
    }

    pub async fn availability(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
    ) -> LedgerResult<Availability> {
        let on_hand: i64 = self
            .store
            .positions(&PositionFilter::at(batch_id, location_id))
            .await?
            .iter()
            .map(|position| position.on_hand)
            .sum();
        let reserved = self.reserved_quantity(batch_id, location_id).await?;

        Ok(Availability {
            batch_id,
            location_id,
            on_hand,
            reserved,
            available: (on_hand - reserved).max(0),
        })
    }

    pub async fn available_quantity(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
    ) -> LedgerResult<i64> {
        Ok(self.availability(batch_id, location_id).await?.available)
    }

    pub async fn create_plan(
        &self,
        from_location: LocationId,
        to_location: LocationId,
        note: Option<String>,
        actor: &str,
    ) -> LedgerResult<TransferPlan> {
        if from_location == to_location {
            return Err(LedgerError::invalid("transfer source and destination match"));
        }
        for location_id in [from_location, to_location] {
            if self.store.location(location_id).await?.is_none() {
                return Err(LedgerError::location_not_found(location_id));
            }
        }

        self.store
            .create_plan(TransferPlan {
                id: Uuid::new_v4(),
                from_location,
                to_location,
                status: PlanStatus::Draft,
                lines: Vec::new(),
                note,
                created_by: actor.to_string(),
                created_at: Utc::now(),
                closed_at: None,
            })
            .await
    }

    /// Adds a line to a draft. Overcommitting is allowed; booking settles it.
    pub async fn add_line(
        &self,
        plan_id: PlanId,
        batch_id: BatchId,
        quantity: i64,
    ) -> LedgerResult<TransferPlan> {
        let quantity = positive(quantity)?;
        if self.store.batch(batch_id).await?.is_none() {
            return Err(LedgerError::batch_not_found(batch_id));
        }

        let plan = self
            .store
            .add_plan_line(plan_id, TransferLine { batch_id, quantity })
            .await?;

        let availability = self.availability(batch_id, plan.from_location).await?;
        if availability.reserved > availability.on_hand {
            info!(
                %plan_id,
                %batch_id,
                on_hand = availability.on_hand,
                reserved = availability.reserved,
                "draft plans overcommit batch"
            );
        }

        Ok(plan)
    }

    pub async fn plan(&self, plan_id: PlanId) -> LedgerResult<TransferPlan> {
        self.store
            .plan(plan_id)
            .await?
            .ok_or_else(|| LedgerError::plan_not_found(plan_id))
    }

    pub async fn discard_plan(&self, plan_id: PlanId, actor: &str) -> LedgerResult<()> {
        self.store
            .commit(
                Commit::new(OperationKind::PlanDiscarded, actor)
                    .closing_plan(plan_id, PlanStatus::Discarded),
            )
            .await?;
        info!(%plan_id, "transfer plan discarded");
        Ok(())
    }

    /// Converts a draft into transfer entries, releasing its reservation in the same commit.
    pub async fn book_plan(&self, plan_id: PlanId, actor: &str) -> LedgerResult<CommitReceipt> {
        let plan = self.plan(plan_id).await?;
        if plan.status != PlanStatus::Draft {
            return Err(LedgerError::PlanNotDraft {
                plan_id,
                status: plan.status,
            });
        }
        if plan.lines.is_empty() {
            return Err(LedgerError::invalid("transfer plan has no lines"));
        }

        let mut commit = Commit::new(OperationKind::PlanBooked, actor)
            .closing_plan(plan_id, PlanStatus::Booked);
        let reason = Some(format!("transfer plan {plan_id}"));
        for line in &plan.lines {
            let batch = self
                .store
                .batch(line.batch_id)
                .await?
                .ok_or_else(|| LedgerError::invalid(format!("unknown batch {}", line.batch_id)))?;
            commit = commit
                .with_check(AvailabilityCheck {
                    batch_id: line.batch_id,
                    location_id: plan.from_location,
                    quantity: line.quantity,
                    scope: ReservationScope::DraftedBefore {
                        plan_id,
                        drafted_at: plan.created_at,
                    },
                })
                .with_entry(movement(
                    &batch,
                    plan.from_location,
                    -line.quantity,
                    MovementType::TransferOut,
                    reason.clone(),
                ))
                .with_entry(movement(
                    &batch,
                    plan.to_location,
                    line.quantity,
                    MovementType::TransferIn,
                    reason.clone(),
                ));
        }

        match self.store.commit(commit).await {
            Ok(receipt) => {
                info!(%plan_id, lines = plan.lines.len(), "transfer plan booked");
                Ok(receipt)
            }
            Err(err @ LedgerError::InsufficientStock { .. }) => {
                info!(%plan_id, "transfer plan booking refused: {err}");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
