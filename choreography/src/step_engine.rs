//! Step Lifecycle Engine.
//!
//! Applies transition requests to steps through the fixed transition table
//! of [`StepState`]. Every applied transition stores the step and publishes
//! one `step.state.changed` event listing the states of every step of the
//! shipment, so the shipment can be re-aggregated from the event alone.
//! A request whose idempotency key was already applied is a no-op success.

use crate::environment::Environment;
use async_trait::async_trait;
use courier_core::decision::Decision;
use courier_core::environment::Clock;
use courier_core::error::{CoordinationError, ValidationError};
use courier_core::ids::{CorrelationId, ShipmentId};
use courier_core::messages::{StepCreated, StepStateChanged, ValidateStepTransition, Validity};
use courier_core::model::{Rating, Step, StepRef, TransitionOutcome, TransitionRequest};
use courier_core::routing::EntityType;
use courier_core::store::Record;
use courier_core::{DateTime, Utc};
use courier_runtime::consumer::{Handles, MessageContext};
use courier_runtime::metrics::DomainMetrics;
use courier_runtime::rpc::RpcHandler;
use courier_runtime::runner::Runner;
use std::sync::Arc;

/// Decide the outcome of `request` against the stored step.
///
/// `siblings` are the shipment's other steps as currently stored; the
/// changed step's own snapshot is replaced by its new state.
///
/// # Errors
///
/// - [`CoordinationError::NotFound`] if the step does not exist
/// - [`CoordinationError::Validation`] for an illegal transition or a
///   reused idempotency key
pub fn decide_transition(
    record: Option<&Record<Step>>,
    request: &TransitionRequest,
    siblings: &[StepRef],
    at: DateTime<Utc>,
    correlation: &CorrelationId,
) -> Result<Decision<Step>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Step, &request.step_id))?;
    let mut step = record.entity.clone();

    let (previous, current) = match step.apply_transition(request, at)? {
        TransitionOutcome::Duplicate => return Ok(Decision::unchanged()),
        TransitionOutcome::Applied { previous, current } => (previous, current),
    };

    let snapshot = StepRef {
        step_id: step.id.clone(),
        index: step.index,
        state: current,
        version: record.version + 1,
    };
    let mut steps: Vec<StepRef> = siblings
        .iter()
        .filter(|sibling| sibling.step_id != step.id)
        .cloned()
        .chain(std::iter::once(snapshot))
        .collect();
    steps.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.step_id.cmp(&b.step_id)));

    let event = StepStateChanged {
        step_id: step.id.clone(),
        shipment_id: step.shipment_id.clone(),
        previous,
        current,
        performer_id: request.performer_id.clone(),
        reason: request.reason.clone(),
        idempotency_key: request.idempotency_key.clone(),
        steps,
    };
    Ok(Decision::update(step).with_event(&event, correlation)?)
}

/// Decide the creation of `step`. An existing step is left untouched.
///
/// # Errors
///
/// Returns [`CoordinationError::Validation`] if the event cannot be encoded.
pub fn decide_seed(
    record: Option<&Record<Step>>,
    step: &Step,
    correlation: &CorrelationId,
) -> Result<Decision<Step>, CoordinationError> {
    if record.is_some() {
        return Ok(Decision::unchanged());
    }
    let event = StepCreated {
        step_id: step.id.clone(),
        shipment_id: step.shipment_id.clone(),
        journey_id: step.journey_id.clone(),
        offer_id: step.offer_id.clone(),
        index: step.index,
        state: step.state,
    };
    Ok(Decision::update(step.clone()).with_event(&event, correlation)?)
}

/// Owns the step store.
#[derive(Clone)]
pub struct StepEngine {
    steps: Runner<Step>,
    clock: Arc<dyn Clock>,
}

impl StepEngine {
    /// Engine over the environment's step store.
    #[must_use]
    pub fn new(env: &Environment) -> Self {
        Self {
            steps: env.runner(&env.stores.steps),
            clock: Arc::clone(&env.clock),
        }
    }

    /// Apply a transition request.
    ///
    /// Returns [`TransitionOutcome::Duplicate`] when the request was
    /// already applied.
    ///
    /// # Errors
    ///
    /// See [`decide_transition`]; store and broker failures are
    /// [`CoordinationError::Transient`].
    pub async fn transition(
        &self,
        request: &TransitionRequest,
        correlation: &CorrelationId,
    ) -> Result<TransitionOutcome, CoordinationError> {
        let step = self.steps.require(request.step_id.as_str()).await?;
        let siblings = self.snapshots(&step.entity.shipment_id).await?;
        let at = self.clock.now();

        let applied = self
            .steps
            .apply(request.step_id.as_str(), |record| {
                decide_transition(record, request, &siblings, at, correlation)
            })
            .await?;

        let (Some(previous), Some(current), true) =
            (applied.previous.as_ref(), applied.entity(), applied.changed)
        else {
            tracing::debug!(
                step_id = %request.step_id,
                key = %request.idempotency_key,
                "Duplicate transition request ignored"
            );
            return Ok(TransitionOutcome::Duplicate);
        };

        DomainMetrics::record_step_transition(current.state.as_str());
        tracing::info!(
            step_id = %request.step_id,
            from = %previous.entity.state,
            to = %current.state,
            performer = %request.performer_id,
            "Step transitioned"
        );
        Ok(TransitionOutcome::Applied {
            previous: previous.entity.state,
            current: current.state,
        })
    }

    /// Create `step` unless it exists, publishing `step.created`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store or broker
    /// failed.
    pub async fn seed(
        &self,
        step: &Step,
        correlation: &CorrelationId,
    ) -> Result<Record<Step>, CoordinationError> {
        let applied = self
            .steps
            .apply(step.id.as_str(), |record| decide_seed(record, step, correlation))
            .await?;
        if applied.changed {
            tracing::info!(step_id = %step.id, shipment_id = %step.shipment_id, state = %step.state, "Step created");
        }
        applied
            .current
            .ok_or_else(|| CoordinationError::not_found(EntityType::Step, &step.id))
    }

    /// Attach a rating to a completed step.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::NotFound`] for an unknown step and
    /// [`CoordinationError::Validation`] if the step is not completed or
    /// the score is out of range.
    pub async fn rate(&self, step_id: &str, rating: Rating) -> Result<Step, CoordinationError> {
        let applied = self
            .steps
            .apply(step_id, |record| {
                let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Step, step_id))?;
                if record.entity.rating.as_ref() == Some(&rating) {
                    return Ok(Decision::unchanged());
                }
                let mut step = record.entity.clone();
                step.rate(rating.clone())?;
                Ok(Decision::update(step))
            })
            .await?;
        applied
            .current
            .map(|record| record.entity)
            .ok_or_else(|| CoordinationError::not_found(EntityType::Step, step_id))
    }

    /// Load a step.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store is unavailable.
    pub async fn get(&self, step_id: &str) -> Result<Option<Step>, CoordinationError> {
        Ok(self.steps.load(step_id).await?.map(|record| record.entity))
    }

    /// Current snapshots of every step of `shipment`, in leg order.
    async fn snapshots(&self, shipment: &ShipmentId) -> Result<Vec<StepRef>, CoordinationError> {
        let mut refs: Vec<StepRef> = self
            .steps
            .store()
            .all()
            .await?
            .into_iter()
            .filter(|record| &record.entity.shipment_id == shipment)
            .map(|record| StepRef {
                step_id: record.entity.id.clone(),
                index: record.entity.index,
                state: record.entity.state,
                version: record.version,
            })
            .collect();
        refs.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.step_id.cmp(&b.step_id)));
        Ok(refs)
    }
}

#[async_trait]
impl Handles<TransitionRequest> for StepEngine {
    async fn handle(
        &self,
        mut request: TransitionRequest,
        context: &MessageContext,
    ) -> Result<(), CoordinationError> {
        if request.idempotency_key.is_empty() {
            match &context.idempotency_key {
                Some(key) => request.idempotency_key.clone_from(key),
                None => return Err(ValidationError::EmptyField("idempotency key").into()),
            }
        }
        self.transition(&request, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl RpcHandler<ValidateStepTransition> for StepEngine {
    async fn respond(&self, call: ValidateStepTransition) -> Result<Validity, CoordinationError> {
        let step = self.steps.require(call.step_id.as_str()).await?.entity;
        if step.state.can_transition_to(call.target) {
            return Ok(Validity::valid());
        }
        let refused = ValidationError::InvalidTransition {
            step_id: step.id,
            from: step.state,
            to: call.target,
        };
        Ok(Validity {
            valid: false,
            reason: Some(refused.to_string()),
        })
    }
}
