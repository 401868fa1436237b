use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use stockbook_core::{
    AvailabilityCheck, Batch, BatchId, Commit, LedgerError, LedgerResult, LedgerStore,
    LifecycleStage, LocationId, MovementType, OperationKind, PositionFilter, ReservationScope,
    StockPosition, add_value, blend, spread,
};
use tracing::info;
use uuid::Uuid;

use crate::ledger::{movement, positive};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRequest {
    pub batch_id: BatchId,
    pub quantity: i64,
    /// Required only when the batch is held at more than one location.
    pub from_location: Option<LocationId>,
    /// Defaults to the source location.
    pub destination: Option<LocationId>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub batch_ids: Vec<BatchId>,
    pub note: Option<String>,
    /// Required only when the inputs are held at more than one location.
    pub destination: Option<LocationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MergeOutcome {
    pub batch_id: BatchId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    /// Input value not carried by the rounded unit cost.
    pub rounding_residue: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub batch_id: BatchId,
    pub location_id: LocationId,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyRequest {
    pub components: Vec<Component>,
    pub sku: String,
    pub product_name: String,
    pub quantity: i64,
    pub location_id: LocationId,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssemblyOutcome {
    pub batch_id: BatchId,
    pub quantity: i64,
    pub unit_cost: Decimal,
    pub consumed_value: Decimal,
    pub rounding_residue: Decimal,
}

/// Split, merge and assembly: operations that derive new batches from existing stock.
#[derive(Clone)]
pub struct BatchLifecycle {
    store: Arc<dyn LedgerStore>,
}

impl BatchLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Moves `quantity` units into a new batch that keeps the source's cost and receipt date.
    pub async fn split(&self, request: SplitRequest, actor: &str) -> LedgerResult<BatchId> {
        let source = self.batch(request.batch_id).await?;
        let quantity = positive(request.quantity)?;
        let positions = self.live_positions(source.id).await?;
        let net: i64 = positions.iter().map(|position| position.on_hand).sum();

        let from = match request.from_location {
            Some(location_id) => location_id,
            None => single_location(&positions)?,
        };
        let at_source = positions
            .iter()
            .find(|position| position.location_id == from)
            .map(|position| position.on_hand)
            .unwrap_or(0);

        if quantity > net || quantity > at_source {
            return Err(LedgerError::InsufficientStock {
                batch_id: source.id,
                location_id: from,
                requested: quantity,
                available: at_source,
            });
        }
        if quantity == net {
            return Err(LedgerError::invalid(
                "split must leave stock on the source batch",
            ));
        }

        let now = Utc::now();
        let derived = Batch {
            id: Uuid::new_v4(),
            sku: source.sku.clone(),
            product_name: source.product_name.clone(),
            original_quantity: quantity,
            unit_cost: source.unit_cost,
            received_at: source.received_at,
            stage: source.stage,
            source_reference: source.source_reference.clone(),
            parents: vec![source.id],
            note: request.note,
            created_at: now,
        };
        let derived_id = derived.id;
        let reason = Some(format!("split {} -> {}", source.id, derived_id));

        let commit = Commit::new(OperationKind::Split, actor)
            .expecting(source.id, from, at_source)
            .with_entry(movement(
                &source,
                from,
                -quantity,
                MovementType::BatchSplitOut,
                reason.clone(),
            ))
            .with_entry(movement(
                &derived,
                request.destination.unwrap_or(from),
                quantity,
                MovementType::BatchSplitIn,
                reason,
            ))
            .with_batch(derived);
        self.store.commit(commit).await?;

        info!(source = %source.id, batch_id = %derived_id, quantity, "batch split");
        Ok(derived_id)
    }

    /// Folds every unit of the inputs into one batch at their quantity-weighted cost.
    pub async fn merge(&self, request: MergeRequest, actor: &str) -> LedgerResult<MergeOutcome> {
        let mut seen = BTreeSet::new();
        let ids: Vec<BatchId> = request
            .batch_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        if ids.len() < 2 {
            return Err(LedgerError::EmptyMergeSet);
        }

        let mut inputs: Vec<(Batch, Vec<StockPosition>)> = Vec::with_capacity(ids.len());
        for id in ids {
            let batch = self.batch(id).await?;
            if let Some((first, _)) = inputs.first() {
                if first.sku != batch.sku {
                    return Err(LedgerError::MixedProduct {
                        expected: first.sku.clone(),
                        found: batch.sku,
                    });
                }
            }
            let positions = self.live_positions(id).await?;
            if positions.is_empty() {
                return Err(LedgerError::invalid(format!(
                    "batch {id} has no stock to merge"
                )));
            }
            inputs.push((batch, positions));
        }

        let destination = match request.destination {
            Some(location_id) => location_id,
            None => {
                let all: Vec<StockPosition> = inputs
                    .iter()
                    .flat_map(|(_, positions)| positions.iter().cloned())
                    .collect();
                single_location(&all)?
            }
        };

        let blended = blend(inputs.iter().flat_map(|(batch, positions)| {
            positions
                .iter()
                .map(|position| (position.on_hand, batch.unit_cost))
        }))?;

        let (earliest, _) = inputs
            .iter()
            .min_by_key(|(batch, _)| (batch.received_at, batch.created_at))
            .ok_or(LedgerError::EmptyMergeSet)?;
        let now = Utc::now();
        let merged = Batch {
            id: Uuid::new_v4(),
            sku: earliest.sku.clone(),
            product_name: earliest.product_name.clone(),
            original_quantity: blended.quantity,
            unit_cost: blended.unit_cost,
            received_at: earliest.received_at,
            stage: earliest.stage,
            source_reference: None,
            parents: inputs.iter().map(|(batch, _)| batch.id).collect(),
            note: request.note,
            created_at: now,
        };
        let merged_id = merged.id;
        let reason = Some(format!("merge -> {merged_id}"));

        let mut commit = Commit::new(OperationKind::Merge, actor);
        for (batch, positions) in &inputs {
            for position in positions {
                commit = commit
                    .expecting(batch.id, position.location_id, position.on_hand)
                    .with_entry(movement(
                        batch,
                        position.location_id,
                        -position.on_hand,
                        MovementType::BatchSplitOut,
                        reason.clone(),
                    ));
            }
        }
        commit = commit
            .with_entry(movement(
                &merged,
                destination,
                blended.quantity,
                MovementType::BatchSplitIn,
                reason,
            ))
            .with_batch(merged);
        self.store.commit(commit).await?;

        info!(
            batch_id = %merged_id,
            inputs = inputs.len(),
            quantity = blended.quantity,
            unit_cost = %blended.unit_cost,
            "batches merged"
        );
        Ok(MergeOutcome {
            batch_id: merged_id,
            quantity: blended.quantity,
            unit_cost: blended.unit_cost,
            rounding_residue: blended.residue,
        })
    }

    /// Consumes component stock and outputs a new batch carrying the consumed cost.
    pub async fn assemble(
        &self,
        request: AssemblyRequest,
        actor: &str,
    ) -> LedgerResult<AssemblyOutcome> {
        let quantity = positive(request.quantity)?;
        let sku = request.sku.trim();
        if sku.is_empty() {
            return Err(LedgerError::invalid("assembly output sku is required"));
        }
        if request.components.is_empty() {
            return Err(LedgerError::invalid("assembly needs at least one component"));
        }

        let mut commit = Commit::new(OperationKind::Assembly, actor);
        let mut consumed_value = Decimal::ZERO;
        let mut parents = Vec::with_capacity(request.components.len());
        for component in &request.components {
            let batch = self.batch(component.batch_id).await?;
            let used = positive(component.quantity)?;
            consumed_value = add_value(consumed_value, used, batch.unit_cost)?;
            if !parents.contains(&batch.id) {
                parents.push(batch.id);
            }
            commit = commit
                .with_check(AvailabilityCheck {
                    batch_id: batch.id,
                    location_id: component.location_id,
                    quantity: used,
                    scope: ReservationScope::AllDrafts,
                })
                .with_entry(movement(
                    &batch,
                    component.location_id,
                    -used,
                    MovementType::AssemblyConsumption,
                    Some(format!("assembly of {sku}")),
                ));
        }

        let cost = spread(consumed_value, quantity)?;
        let now = Utc::now();
        let output = Batch {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            product_name: request.product_name.trim().to_string(),
            original_quantity: quantity,
            unit_cost: cost.unit_cost,
            received_at: now,
            stage: LifecycleStage::Warehouse,
            source_reference: None,
            parents,
            note: request.note,
            created_at: now,
        };
        let output_id = output.id;
        commit = commit
            .with_entry(movement(
                &output,
                request.location_id,
                quantity,
                MovementType::AssemblyOutput,
                None,
            ))
            .with_batch(output);
        self.store.commit(commit).await?;

        info!(batch_id = %output_id, sku, quantity, "assembly recorded");
        Ok(AssemblyOutcome {
            batch_id: output_id,
            quantity,
            unit_cost: cost.unit_cost,
            consumed_value,
            rounding_residue: cost.residue,
        })
    }

    async fn batch(&self, batch_id: BatchId) -> LedgerResult<Batch> {
        self.store
            .batch(batch_id)
            .await?
            .ok_or_else(|| LedgerError::invalid(format!("unknown batch {batch_id}")))
    }

    async fn live_positions(&self, batch_id: BatchId) -> LedgerResult<Vec<StockPosition>> {
        self.store
            .positions(&PositionFilter::for_batch(batch_id))
            .await
    }
}

fn single_location(positions: &[StockPosition]) -> LedgerResult<LocationId> {
    let mut locations = positions
        .iter()
        .map(|position| position.location_id)
        .collect::<BTreeSet<LocationId>>()
        .into_iter();
    match (locations.next(), locations.next()) {
        (Some(location_id), None) => Ok(location_id),
        (None, _) => Err(LedgerError::invalid("batch holds no stock")),
        _ => Err(LedgerError::invalid(
            "stock is held at several locations; name one explicitly",
        )),
    }
}
