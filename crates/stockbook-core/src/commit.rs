//! The unit of work every ledger mutation goes through.
//!
//! A [`Commit`] bundles the batches, entries and side effects of one operation. Stores load a
//! [`BalanceSheet`] for the rows the commit touches while holding their write locks, run
//! [`validate`], and only then persist. Either everything in a commit lands or nothing does.

use std::collections::{BTreeSet, HashMap, HashSet};

use rust_decimal::Decimal;
use uuid::Uuid;

use crate::costing::line_cost;
use crate::error::{LedgerError, LedgerResult};
use crate::events::OperationKind;
use crate::models::{
    AttributionRecord, Batch, BatchId, EventId, LocationId, NewEntry, PlanId, PlanStatus,
    Reservation,
};

#[derive(Debug, Clone)]
pub struct Commit {
    pub operation_id: Uuid,
    pub kind: OperationKind,
    pub actor: String,
    pub new_batches: Vec<Batch>,
    pub entries: Vec<NewEntry>,
    pub checks: Vec<AvailabilityCheck>,
    pub expectations: Vec<ExpectedPosition>,
    pub plan_update: Option<PlanUpdate>,
    pub attribution: Option<AttributionRecord>,
}

/// Which draft reservations an availability check must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationScope {
    AllDrafts,
    /// Only drafts created before the given plan; the plan's own lines are excluded.
    DraftedBefore {
        plan_id: PlanId,
        drafted_at: chrono::DateTime<chrono::Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityCheck {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub quantity: i64,
    pub scope: ReservationScope,
}

/// Optimistic guard: the committed on-hand quantity the operation was planned against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpectedPosition {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub on_hand: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanUpdate {
    pub plan_id: PlanId,
    pub status: PlanStatus,
}

impl Commit {
    pub fn new(kind: OperationKind, actor: impl Into<String>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            kind,
            actor: actor.into(),
            new_batches: Vec::new(),
            entries: Vec::new(),
            checks: Vec::new(),
            expectations: Vec::new(),
            plan_update: None,
            attribution: None,
        }
    }

    pub fn with_batch(mut self, batch: Batch) -> Self {
        self.new_batches.push(batch);
        self
    }

    pub fn with_entry(mut self, entry: NewEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_check(mut self, check: AvailabilityCheck) -> Self {
        self.checks.push(check);
        self
    }

    pub fn expecting(mut self, batch_id: BatchId, location_id: LocationId, on_hand: i64) -> Self {
        self.expectations.push(ExpectedPosition {
            batch_id,
            location_id,
            on_hand,
        });
        self
    }

    pub fn closing_plan(mut self, plan_id: PlanId, status: PlanStatus) -> Self {
        self.plan_update = Some(PlanUpdate { plan_id, status });
        self
    }

    pub fn attributing(mut self, record: AttributionRecord) -> Self {
        self.attribution = Some(record);
        self
    }

    /// Existing batches whose rows must be locked, in lock order.
    pub fn touched_batches(&self) -> BTreeSet<BatchId> {
        let created: HashSet<BatchId> = self.new_batches.iter().map(|batch| batch.id).collect();
        self.entries
            .iter()
            .map(|entry| entry.batch_id)
            .chain(self.checks.iter().map(|check| check.batch_id))
            .chain(self.expectations.iter().map(|expected| expected.batch_id))
            .filter(|id| !created.contains(id))
            .collect()
    }

    pub fn touched_locations(&self) -> BTreeSet<LocationId> {
        self.entries
            .iter()
            .map(|entry| entry.location_id)
            .chain(self.checks.iter().map(|check| check.location_id))
            .collect()
    }

    pub fn event_id(&self) -> Option<EventId> {
        self.attribution.as_ref().map(|record| record.event_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchBalance {
    pub original_quantity: i64,
    pub net: i64,
}

/// Committed state of the rows a commit touches, read under lock.
#[derive(Debug, Clone, Default)]
pub struct BalanceSheet {
    pub batches: HashMap<BatchId, BatchBalance>,
    pub positions: HashMap<(BatchId, LocationId), i64>,
    pub locations: HashSet<LocationId>,
    pub reservations: Vec<Reservation>,
    pub plan_status: Option<(PlanId, PlanStatus)>,
    pub event_processed: Option<(EventId, bool)>,
}

impl BalanceSheet {
    pub fn position(&self, batch_id: BatchId, location_id: LocationId) -> i64 {
        self.positions
            .get(&(batch_id, location_id))
            .copied()
            .unwrap_or(0)
    }

    pub fn reserved(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
        scope: ReservationScope,
    ) -> i64 {
        self.reservations
            .iter()
            .filter(|r| r.batch_id == batch_id && r.location_id == location_id)
            .filter(|r| match scope {
                ReservationScope::AllDrafts => true,
                ReservationScope::DraftedBefore {
                    plan_id,
                    drafted_at,
                } => r.plan_id != plan_id && r.drafted_before(plan_id, drafted_at),
            })
            .fold(0_i64, |total, r| total.saturating_add(r.quantity))
    }

    pub fn available(
        &self,
        batch_id: BatchId,
        location_id: LocationId,
        scope: ReservationScope,
    ) -> i64 {
        self.position(batch_id, location_id)
            .saturating_sub(self.reserved(batch_id, location_id, scope))
            .max(0)
    }
}

pub fn validate(commit: &Commit, sheet: &BalanceSheet) -> LedgerResult<()> {
    if commit.entries.is_empty() && commit.plan_update.is_none() && commit.attribution.is_none() {
        return Err(LedgerError::invalid("operation writes nothing"));
    }

    validate_plan_update(commit, sheet)?;
    validate_attribution(commit, sheet)?;

    let mut batches = sheet.batches.clone();
    for batch in &commit.new_batches {
        if batches.contains_key(&batch.id) {
            return Err(LedgerError::invalid(format!("batch {} already exists", batch.id)));
        }
        if batch.original_quantity <= 0 {
            return Err(LedgerError::invalid("batch quantity must be positive"));
        }
        if batch.unit_cost < Decimal::ZERO {
            return Err(LedgerError::invalid("unit cost cannot be negative"));
        }
        if batch.sku.trim().is_empty() {
            return Err(LedgerError::invalid("batch sku is required"));
        }
        line_cost(batch.original_quantity, batch.unit_cost)?;
        batches.insert(
            batch.id,
            BatchBalance {
                original_quantity: batch.original_quantity,
                net: 0,
            },
        );
    }

    for expected in &commit.expectations {
        let actual = sheet.position(expected.batch_id, expected.location_id);
        if actual != expected.on_hand {
            return Err(LedgerError::Conflict {
                batch_id: expected.batch_id,
                location_id: expected.location_id,
                expected: expected.on_hand,
                actual,
            });
        }
    }

    validate_checks(commit, sheet)?;

    let mut positions = sheet.positions.clone();
    for entry in &commit.entries {
        if entry.quantity == 0 {
            return Err(LedgerError::invalid("quantity must be non-zero"));
        }
        if entry.quantity == i64::MIN {
            return Err(out_of_range(entry.quantity));
        }
        if !entry.movement_type.admits(entry.quantity) {
            return Err(LedgerError::invalid(format!(
                "{} cannot carry quantity {}",
                entry.movement_type, entry.quantity
            )));
        }
        if entry.unit_cost < Decimal::ZERO {
            return Err(LedgerError::invalid("unit cost cannot be negative"));
        }
        line_cost(entry.quantity, entry.unit_cost)?;
        if !sheet.locations.contains(&entry.location_id) {
            return Err(LedgerError::invalid(format!(
                "unknown location {}",
                entry.location_id
            )));
        }
        let Some(balance) = batches.get_mut(&entry.batch_id) else {
            return Err(LedgerError::invalid(format!("unknown batch {}", entry.batch_id)));
        };

        let position = positions
            .entry((entry.batch_id, entry.location_id))
            .or_insert(0);
        let before = *position;
        *position = before
            .checked_add(entry.quantity)
            .ok_or_else(|| out_of_range(entry.quantity))?;
        if *position < 0 {
            return Err(LedgerError::InsufficientStock {
                batch_id: entry.batch_id,
                location_id: entry.location_id,
                requested: -entry.quantity,
                available: before.max(0),
            });
        }

        balance.net = balance
            .net
            .checked_add(entry.quantity)
            .ok_or_else(|| out_of_range(entry.quantity))?;
        if balance.net > balance.original_quantity {
            return Err(LedgerError::invalid(format!(
                "batch {} would hold {} units, more than the {} received",
                entry.batch_id, balance.net, balance.original_quantity
            )));
        }
    }

    Ok(())
}

fn validate_plan_update(commit: &Commit, sheet: &BalanceSheet) -> LedgerResult<()> {
    let Some(update) = commit.plan_update else {
        return Ok(());
    };
    if update.status == PlanStatus::Draft {
        return Err(LedgerError::invalid("a plan cannot be closed into draft"));
    }
    match sheet.plan_status {
        Some((plan_id, PlanStatus::Draft)) if plan_id == update.plan_id => Ok(()),
        Some((plan_id, status)) if plan_id == update.plan_id => {
            Err(LedgerError::PlanNotDraft { plan_id, status })
        }
        _ => Err(LedgerError::plan_not_found(update.plan_id)),
    }
}

fn validate_attribution(commit: &Commit, sheet: &BalanceSheet) -> LedgerResult<()> {
    let Some(event_id) = commit.event_id() else {
        return Ok(());
    };
    match sheet.event_processed {
        Some((id, false)) if id == event_id => Ok(()),
        Some((id, true)) if id == event_id => Err(LedgerError::AlreadyAttributed { event_id }),
        _ => Err(LedgerError::event_not_found(event_id)),
    }
}

fn validate_checks(commit: &Commit, sheet: &BalanceSheet) -> LedgerResult<()> {
    let mut demand: HashMap<(BatchId, LocationId, ReservationScope), i64> = HashMap::new();
    for check in &commit.checks {
        if check.quantity <= 0 {
            return Err(LedgerError::invalid("quantity must be positive"));
        }
        let requested = demand
            .entry((check.batch_id, check.location_id, check.scope))
            .or_insert(0);
        *requested = requested
            .checked_add(check.quantity)
            .ok_or_else(|| out_of_range(check.quantity))?;
    }

    for ((batch_id, location_id, scope), requested) in demand {
        let available = sheet.available(batch_id, location_id, scope);
        if requested > available {
            return Err(LedgerError::InsufficientStock {
                batch_id,
                location_id,
                requested,
                available,
            });
        }
    }

    Ok(())
}

fn out_of_range(quantity: i64) -> LedgerError {
    LedgerError::invalid(format!("quantity {quantity} is out of range"))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::models::{LifecycleStage, MovementType};

    fn sheet_with(batch_id: BatchId, location_id: LocationId, on_hand: i64) -> BalanceSheet {
        let mut sheet = BalanceSheet::default();
        sheet.locations.insert(location_id);
        sheet.batches.insert(
            batch_id,
            BatchBalance {
                original_quantity: 100,
                net: on_hand,
            },
        );
        sheet.positions.insert((batch_id, location_id), on_hand);
        sheet
    }

    fn outbound(batch_id: BatchId, location_id: LocationId, quantity: i64) -> NewEntry {
        NewEntry {
            batch_id,
            location_id,
            quantity: -quantity,
            movement_type: MovementType::TransferOut,
            unit_cost: Decimal::new(2, 0),
            reason: None,
        }
    }

    fn reservation(
        plan_id: PlanId,
        at: chrono::DateTime<Utc>,
        batch_id: BatchId,
        location_id: LocationId,
        quantity: i64,
    ) -> Reservation {
        Reservation {
            plan_id,
            plan_created_at: at,
            batch_id,
            location_id,
            quantity,
        }
    }

    #[test]
    fn rejects_outbound_past_zero() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 5);
        let commit =
            Commit::new(OperationKind::Transfer, "tester").with_entry(outbound(batch, location, 6));

        assert_eq!(
            validate(&commit, &sheet),
            Err(LedgerError::InsufficientStock {
                batch_id: batch,
                location_id: location,
                requested: 6,
                available: 5,
            })
        );
    }

    #[test]
    fn rejects_zero_quantity_and_wrong_sign() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 5);

        let zero = Commit::new(OperationKind::Adjustment, "tester")
            .with_entry(outbound(batch, location, 0));
        assert!(matches!(
            validate(&zero, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));

        let mut wrong_sign = outbound(batch, location, 1);
        wrong_sign.movement_type = MovementType::AdjustmentAdd;
        let commit = Commit::new(OperationKind::Adjustment, "tester").with_entry(wrong_sign);
        assert!(matches!(
            validate(&commit, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));
    }

    #[test]
    fn rejects_unknown_batch_and_location() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 5);

        let commit = Commit::new(OperationKind::Transfer, "tester")
            .with_entry(outbound(Uuid::new_v4(), location, 1));
        assert!(matches!(
            validate(&commit, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));

        let commit = Commit::new(OperationKind::Transfer, "tester")
            .with_entry(outbound(batch, Uuid::new_v4(), 1));
        assert!(matches!(
            validate(&commit, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));
    }

    #[test]
    fn inbound_cannot_exceed_received_quantity() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 100);
        let commit = Commit::new(OperationKind::Adjustment, "tester").with_entry(NewEntry {
            batch_id: batch,
            location_id: location,
            quantity: 1,
            movement_type: MovementType::AdjustmentAdd,
            unit_cost: Decimal::ONE,
            reason: None,
        });

        assert!(matches!(
            validate(&commit, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));
    }

    #[test]
    fn entries_in_one_commit_apply_in_order() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 5);
        let mut adjustment = outbound(batch, location, -5);
        adjustment.movement_type = MovementType::Reconciliation;
        // Drains the position to zero, then restores it.
        let commit = Commit::new(OperationKind::Transfer, "tester")
            .with_entry(outbound(batch, location, 5))
            .with_entry(adjustment);
        assert_eq!(validate(&commit, &sheet), Ok(()));
    }

    #[test]
    fn new_batches_are_known_within_their_commit() {
        let location = Uuid::new_v4();
        let mut sheet = BalanceSheet::default();
        sheet.locations.insert(location);
        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4(),
            sku: "SKU-1".to_string(),
            product_name: "Widget".to_string(),
            original_quantity: 10,
            unit_cost: Decimal::ONE,
            received_at: now,
            stage: LifecycleStage::Warehouse,
            source_reference: None,
            parents: Vec::new(),
            note: None,
            created_at: now,
        };
        let commit = Commit::new(OperationKind::Receipt, "tester")
            .with_entry(NewEntry {
                batch_id: batch.id,
                location_id: location,
                quantity: 10,
                movement_type: MovementType::InitialReceipt,
                unit_cost: Decimal::ONE,
                reason: None,
            })
            .with_batch(batch);

        assert_eq!(validate(&commit, &sheet), Ok(()));
        assert!(commit.touched_batches().is_empty());
    }

    #[test]
    fn booking_check_only_yields_to_earlier_drafts() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let mut sheet = sheet_with(batch, location, 5);
        let now = Utc::now();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        sheet
            .reservations
            .push(reservation(first, now, batch, location, 5));
        sheet.reservations.push(reservation(
            second,
            now + Duration::seconds(1),
            batch,
            location,
            5,
        ));

        let book = |plan_id, drafted_at| {
            Commit::new(OperationKind::PlanBooked, "tester").with_check(AvailabilityCheck {
                batch_id: batch,
                location_id: location,
                quantity: 5,
                scope: ReservationScope::DraftedBefore {
                    plan_id,
                    drafted_at,
                },
            })
        };

        assert_eq!(validate(&book(first, now), &sheet), Ok(()));
        assert_eq!(
            validate(&book(second, now + Duration::seconds(1)), &sheet),
            Err(LedgerError::InsufficientStock {
                batch_id: batch,
                location_id: location,
                requested: 5,
                available: 0,
            })
        );
    }

    #[test]
    fn closed_plans_cannot_be_closed_again() {
        let plan_id = Uuid::new_v4();
        let sheet = BalanceSheet {
            plan_status: Some((plan_id, PlanStatus::Booked)),
            ..BalanceSheet::default()
        };
        let commit = Commit::new(OperationKind::PlanDiscarded, "tester")
            .closing_plan(plan_id, PlanStatus::Discarded);

        assert_eq!(
            validate(&commit, &sheet),
            Err(LedgerError::PlanNotDraft {
                plan_id,
                status: PlanStatus::Booked,
            })
        );
    }

    #[test]
    fn stale_expectation_is_a_conflict() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 7);
        let commit = Commit::new(OperationKind::Split, "tester")
            .with_entry(outbound(batch, location, 2))
            .expecting(batch, location, 9);

        assert_eq!(
            validate(&commit, &sheet),
            Err(LedgerError::Conflict {
                batch_id: batch,
                location_id: location,
                expected: 9,
                actual: 7,
            })
        );
    }

    #[test]
    fn extreme_quantities_are_invalid_not_panics() {
        let (batch, location) = (Uuid::new_v4(), Uuid::new_v4());
        let sheet = sheet_with(batch, location, 5);

        let mut drain = outbound(batch, location, 0);
        drain.quantity = i64::MIN;
        drain.movement_type = MovementType::AdjustmentRemove;
        let commit = Commit::new(OperationKind::Adjustment, "tester").with_entry(drain);
        assert!(matches!(
            validate(&commit, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));

        let mut pricey = outbound(batch, location, 1);
        pricey.unit_cost = Decimal::MAX;
        pricey.quantity = -2;
        let commit = Commit::new(OperationKind::Adjustment, "tester").with_entry(pricey);
        assert!(matches!(
            validate(&commit, &sheet),
            Err(LedgerError::InvalidMovement(_))
        ));
    }

    #[test]
    fn empty_commit_is_rejected() {
        let commit = Commit::new(OperationKind::Adjustment, "tester");
        assert!(matches!(
            validate(&commit, &BalanceSheet::default()),
            Err(LedgerError::InvalidMovement(_))
        ));
    }
}
