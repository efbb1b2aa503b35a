//! Shipment Status Aggregator.
//!
//! Folds the sibling snapshots carried by every `step.state.changed` event
//! into the shipment and recomputes its derived status. A status change is
//! published once; recomputing from an unchanged set of snapshots decides
//! nothing.

use crate::environment::Environment;
use async_trait::async_trait;
use courier_core::decision::Decision;
use courier_core::error::CoordinationError;
use courier_core::ids::CorrelationId;
use courier_core::messages::{
    GetShipmentStatus, ShipmentStatusChanged, ShipmentStatusReply, StepStateChanged,
};
use courier_core::model::Shipment;
use courier_core::routing::EntityType;
use courier_core::store::Record;
use courier_runtime::consumer::{Handles, MessageContext};
use courier_runtime::metrics::DomainMetrics;
use courier_runtime::rpc::RpcHandler;
use courier_runtime::runner::Runner;

/// Decide the shipment's reaction to a step change.
///
/// # Errors
///
/// Returns [`CoordinationError::NotFound`] if the shipment does not exist.
pub fn decide_status(
    record: Option<&Record<Shipment>>,
    event: &StepStateChanged,
    correlation: &CorrelationId,
) -> Result<Decision<Shipment>, CoordinationError> {
    let record =
        record.ok_or_else(|| CoordinationError::not_found(EntityType::Shipment, &event.shipment_id))?;
    let mut shipment = record.entity.clone();

    if !shipment.merge_steps(&event.steps) {
        return Ok(Decision::unchanged());
    }
    let Some((previous, current)) = shipment.recompute_status() else {
        return Ok(Decision::update(shipment));
    };

    let changed = ShipmentStatusChanged {
        shipment_id: shipment.id.clone(),
        journey_id: shipment.journey_id.clone(),
        mission_id: shipment.mission_id.clone(),
        previous,
        current,
    };
    Ok(Decision::update(shipment).with_event(&changed, correlation)?)
}

/// Owns the shipment store.
#[derive(Clone)]
pub struct ShipmentAggregator {
    shipments: Runner<Shipment>,
}

impl ShipmentAggregator {
    /// Aggregator over the environment's shipment store.
    #[must_use]
    pub fn new(env: &Environment) -> Self {
        Self {
            shipments: env.runner(&env.stores.shipments),
        }
    }

    /// Apply a step change to its shipment. Returns the shipment afterwards.
    ///
    /// # Errors
    ///
    /// See [`decide_status`]; store and broker failures are
    /// [`CoordinationError::Transient`].
    pub async fn on_step_changed(
        &self,
        event: &StepStateChanged,
        correlation: &CorrelationId,
    ) -> Result<Shipment, CoordinationError> {
        let applied = self
            .shipments
            .apply(event.shipment_id.as_str(), |record| decide_status(record, event, correlation))
            .await?;

        let (Some(before), Some(after)) = (applied.previous.as_ref(), applied.current.as_ref()) else {
            return Err(CoordinationError::not_found(EntityType::Shipment, &event.shipment_id));
        };
        if before.entity.status != after.entity.status {
            DomainMetrics::record_shipment_status(after.entity.status.as_str());
            tracing::info!(
                shipment_id = %event.shipment_id,
                from = %before.entity.status,
                to = %after.entity.status,
                "Shipment status changed"
            );
        }
        Ok(after.entity.clone())
    }

    /// Load a shipment.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store is unavailable.
    pub async fn get(&self, shipment_id: &str) -> Result<Option<Shipment>, CoordinationError> {
        Ok(self.shipments.load(shipment_id).await?.map(|record| record.entity))
    }
}

#[async_trait]
impl Handles<StepStateChanged> for ShipmentAggregator {
    async fn handle(
        &self,
        event: StepStateChanged,
        context: &MessageContext,
    ) -> Result<(), CoordinationError> {
        self.on_step_changed(&event, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl RpcHandler<GetShipmentStatus> for ShipmentAggregator {
    async fn respond(&self, call: GetShipmentStatus) -> Result<ShipmentStatusReply, CoordinationError> {
        let shipment = self.shipments.require(call.shipment_id.as_str()).await?.entity;
        Ok(ShipmentStatusReply {
            success: true,
            status: Some(shipment.status),
            error: None,
        })
    }
}
