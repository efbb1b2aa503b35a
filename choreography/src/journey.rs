//! Journey choreographer.
//!
//! Books journeys for shipments, reacts to agents becoming unavailable and
//! settles bookings once the booking shipment is delivered or aborted.

use crate::environment::Environment;
use async_trait::async_trait;
use courier_core::decision::Decision;
use courier_core::error::CoordinationError;
use courier_core::ids::{CorrelationId, JourneyId, ShipmentId};
use courier_core::messages::{
    AgentUnavailable, BookJourney, JourneyAgentUnavailable, JourneyBooked, JourneyCancelled,
    JourneyCompleted, JourneyReleased, ShipmentStatusChanged, StepCreated,
    ValidateJourneyBooking, Validity,
};
use courier_core::model::{Journey, JourneyStatus, ShipmentStatus};
use courier_core::routing::EntityType;
use courier_core::store::Record;
use courier_runtime::consumer::{Handles, MessageContext};
use courier_runtime::rpc::RpcHandler;
use courier_runtime::runner::Runner;

/// Decide a booking of `journey_id` by `shipment_id`.
///
/// Re-booking by the shipment already holding the journey decides nothing.
///
/// # Errors
///
/// - [`CoordinationError::NotFound`] if the journey does not exist
/// - [`CoordinationError::Validation`] if it cannot be booked
pub fn decide_booking(
    record: Option<&Record<Journey>>,
    journey_id: &JourneyId,
    shipment_id: &ShipmentId,
    correlation: &CorrelationId,
) -> Result<Decision<Journey>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Journey, journey_id))?;
    let mut journey = record.entity.clone();
    if !journey.book(shipment_id)? {
        return Ok(Decision::unchanged());
    }
    let booked = JourneyBooked {
        journey_id: journey.id.clone(),
        shipment_id: shipment_id.clone(),
        agent_id: journey.agent_id.clone(),
    };
    Ok(Decision::update(journey).with_event(&booked, correlation)?)
}

/// Decide the reaction of one of the agent's journeys to an unavailability
/// notice.
///
/// Available journeys are cancelled; booked journeys only relay the notice.
/// A notice already seen by the journey decides nothing.
///
/// # Errors
///
/// Returns [`CoordinationError::NotFound`] if the journey does not exist.
pub fn decide_agent_unavailable(
    record: Option<&Record<Journey>>,
    journey_id: &JourneyId,
    notice: &AgentUnavailable,
    correlation: &CorrelationId,
) -> Result<Decision<Journey>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Journey, journey_id))?;
    let mut journey = record.entity.clone();
    if journey.agent_id != notice.agent_id || !journey.record_notice(&notice.notice_id) {
        return Ok(Decision::unchanged());
    }

    match journey.status {
        JourneyStatus::Available => {
            journey.cancel_if_available();
            let cancelled = JourneyCancelled {
                journey_id: journey.id.clone(),
                agent_id: journey.agent_id.clone(),
                reason: notice.reason.clone(),
            };
            Ok(Decision::update(journey).with_event(&cancelled, correlation)?)
        }
        JourneyStatus::Booked => {
            let relayed = JourneyAgentUnavailable {
                journey_id: journey.id.clone(),
                agent_id: journey.agent_id.clone(),
                shipment_id: journey.booked_by.clone(),
                notice_id: notice.notice_id.clone(),
                reason: notice.reason.clone(),
            };
            Ok(Decision::update(journey).with_event(&relayed, correlation)?)
        }
        JourneyStatus::Completed | JourneyStatus::Cancelled => Ok(Decision::update(journey)),
    }
}

/// Decide how a shipment's new status settles its booked journey.
///
/// `DELIVERED` completes the booking and `ABORTED` releases it; other
/// statuses and journeys not booked by the shipment decide nothing.
///
/// # Errors
///
/// Returns [`CoordinationError::NotFound`] if the journey does not exist.
pub fn decide_settlement(
    record: Option<&Record<Journey>>,
    journey_id: &JourneyId,
    event: &ShipmentStatusChanged,
    correlation: &CorrelationId,
) -> Result<Decision<Journey>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Journey, journey_id))?;
    let mut journey = record.entity.clone();
    match event.current {
        ShipmentStatus::Delivered if journey.complete(&event.shipment_id) => {
            let completed = JourneyCompleted {
                journey_id: journey.id.clone(),
                shipment_id: event.shipment_id.clone(),
            };
            Ok(Decision::update(journey).with_event(&completed, correlation)?)
        }
        ShipmentStatus::Aborted if journey.release(&event.shipment_id) => {
            let released = JourneyReleased {
                journey_id: journey.id.clone(),
                shipment_id: event.shipment_id.clone(),
            };
            Ok(Decision::update(journey).with_event(&released, correlation)?)
        }
        _ => Ok(Decision::unchanged()),
    }
}

/// Owns the journey store.
#[derive(Clone)]
pub struct JourneyChoreographer {
    journeys: Runner<Journey>,
}

impl JourneyChoreographer {
    /// Choreographer over the environment's journey store.
    #[must_use]
    pub fn new(env: &Environment) -> Self {
        Self {
            journeys: env.runner(&env.stores.journeys),
        }
    }

    /// Book `journey_id` for `shipment_id`.
    ///
    /// # Errors
    ///
    /// See [`decide_booking`].
    pub async fn book(
        &self,
        journey_id: &JourneyId,
        shipment_id: &ShipmentId,
        correlation: &CorrelationId,
    ) -> Result<Journey, CoordinationError> {
        let applied = self
            .journeys
            .apply(journey_id.as_str(), |record| {
                decide_booking(record, journey_id, shipment_id, correlation)
            })
            .await?;
        if applied.changed {
            tracing::info!(journey_id = %journey_id, shipment_id = %shipment_id, "Journey booked");
        }
        applied
            .current
            .map(|record| record.entity)
            .ok_or_else(|| CoordinationError::not_found(EntityType::Journey, journey_id))
    }

    /// Apply an agent-unavailable notice to every journey of the agent.
    ///
    /// Returns the number of journeys that changed. Every journey is
    /// attempted; the first failure is returned afterwards so the notice
    /// can be redelivered.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the agent's journeys.
    pub async fn agent_unavailable(
        &self,
        notice: &AgentUnavailable,
        correlation: &CorrelationId,
    ) -> Result<usize, CoordinationError> {
        let journey_ids: Vec<JourneyId> = self
            .journeys
            .store()
            .all()
            .await?
            .into_iter()
            .filter(|record| record.entity.agent_id == notice.agent_id)
            .map(|record| record.entity.id)
            .collect();

        let mut changed = 0;
        let mut first_error = None;
        for journey_id in &journey_ids {
            let applied = self
                .journeys
                .apply(journey_id.as_str(), |record| {
                    decide_agent_unavailable(record, journey_id, notice, correlation)
                })
                .await;
            match applied {
                Ok(applied) if applied.changed => changed += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(journey_id = %journey_id, error = %e, "Failed to apply agent notice");
                    first_error.get_or_insert(e);
                }
            }
        }

        tracing::info!(
            agent_id = %notice.agent_id,
            notice_id = %notice.notice_id,
            journeys = journey_ids.len(),
            changed,
            "Agent unavailable notice processed"
        );
        first_error.map_or(Ok(changed), Err)
    }

    /// Settle the journey booked by a shipment whose status changed.
    ///
    /// # Errors
    ///
    /// See [`decide_settlement`].
    pub async fn settle(
        &self,
        event: &ShipmentStatusChanged,
        correlation: &CorrelationId,
    ) -> Result<(), CoordinationError> {
        let Some(journey_id) = &event.journey_id else {
            return Ok(());
        };
        if !matches!(event.current, ShipmentStatus::Delivered | ShipmentStatus::Aborted) {
            return Ok(());
        }
        let applied = self
            .journeys
            .apply(journey_id.as_str(), |record| {
                decide_settlement(record, journey_id, event, correlation)
            })
            .await?;
        if let Some(journey) = applied.entity().filter(|_| applied.changed) {
            tracing::info!(
                journey_id = %journey_id,
                shipment_id = %event.shipment_id,
                status = %journey.status,
                "Journey settled"
            );
        }
        Ok(())
    }

    /// Load a journey.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store is unavailable.
    pub async fn get(&self, journey_id: &str) -> Result<Option<Journey>, CoordinationError> {
        Ok(self.journeys.load(journey_id).await?.map(|record| record.entity))
    }
}

#[async_trait]
impl Handles<StepCreated> for JourneyChoreographer {
    async fn handle(&self, event: StepCreated, context: &MessageContext) -> Result<(), CoordinationError> {
        let Some(journey_id) = &event.journey_id else {
            tracing::debug!(step_id = %event.step_id, "Step has no journey, nothing to book");
            return Ok(());
        };
        self.book(journey_id, &event.shipment_id, &context.correlation_id)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<BookJourney> for JourneyChoreographer {
    async fn handle(&self, command: BookJourney, context: &MessageContext) -> Result<(), CoordinationError> {
        self.book(&command.journey_id, &command.shipment_id, &context.correlation_id)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<AgentUnavailable> for JourneyChoreographer {
    async fn handle(
        &self,
        notice: AgentUnavailable,
        context: &MessageContext,
    ) -> Result<(), CoordinationError> {
        self.agent_unavailable(&notice, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<ShipmentStatusChanged> for JourneyChoreographer {
    async fn handle(
        &self,
        event: ShipmentStatusChanged,
        context: &MessageContext,
    ) -> Result<(), CoordinationError> {
        self.settle(&event, &context.correlation_id).await
    }
}

#[async_trait]
impl RpcHandler<ValidateJourneyBooking> for JourneyChoreographer {
    async fn respond(&self, call: ValidateJourneyBooking) -> Result<Validity, CoordinationError> {
        let journey = self.journeys.require(call.journey_id.as_str()).await?.entity;
        Ok(match journey.check_booking(&call.shipment_id) {
            Ok(()) => Validity::valid(),
            Err(refused) => Validity {
                valid: false,
                reason: Some(refused.to_string()),
            },
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::ids::UserId;
    use courier_testing::DecisionTest;
    use courier_testing::decision_test::assertions::{assert_nothing_emitted, assert_single_event};
    use courier_testing::fixtures::journey;

    fn corr() -> CorrelationId {
        CorrelationId::new("c-1")
    }

    fn booked(id: &str, shipment: &str) -> Journey {
        let mut j = journey(id, "agent-1");
        j.book(&ShipmentId::new(shipment)).unwrap();
        j
    }

    fn notice(id: &str) -> AgentUnavailable {
        AgentUnavailable {
            agent_id: UserId::new("agent-1"),
            notice_id: id.to_string(),
            reason: Some("sick".to_string()),
        }
    }

    fn status_changed(shipment: &str, current: ShipmentStatus) -> ShipmentStatusChanged {
        ShipmentStatusChanged {
            shipment_id: ShipmentId::new(shipment),
            journey_id: Some(JourneyId::new("j-1")),
            mission_id: None,
            previous: ShipmentStatus::InTransit,
            current,
        }
    }

    #[test]
    fn available_journey_is_booked() {
        DecisionTest::given(Some(journey("j-1", "agent-1")))
            .when(|record| decide_booking(record, &JourneyId::new("j-1"), &ShipmentId::new("s-1"), &corr()))
            .then_next(|next| {
                let next = next.unwrap();
                assert_eq!(next.status, JourneyStatus::Booked);
                assert_eq!(next.booked_by, Some(ShipmentId::new("s-1")));
            })
            .then_emitted(|emit| assert_single_event(emit, "journey.booked"))
            .run();
    }

    #[test]
    fn rebooking_by_holder_is_noop() {
        DecisionTest::given(Some(booked("j-1", "s-1")))
            .when(|record| decide_booking(record, &JourneyId::new("j-1"), &ShipmentId::new("s-1"), &corr()))
            .then_next(|next| assert!(next.is_none()))
            .then_emitted(assert_nothing_emitted)
            .run();
    }

    #[test]
    fn booking_by_another_shipment_is_refused() {
        DecisionTest::given(Some(booked("j-1", "s-1")))
            .when(|record| decide_booking(record, &JourneyId::new("j-1"), &ShipmentId::new("s-2"), &corr()))
            .then_rejected(|error| assert!(matches!(error, CoordinationError::Validation(_))))
            .run();
    }

    #[test]
    fn zero_capacity_journey_is_refused() {
        let mut full = journey("j-1", "agent-1");
        full.capacity = 0;
        DecisionTest::given(Some(full))
            .when(|record| decide_booking(record, &JourneyId::new("j-1"), &ShipmentId::new("s-1"), &corr()))
            .then_rejected(|error| assert!(matches!(error, CoordinationError::Validation(_))))
            .run();
    }

    #[test]
    fn unavailable_agent_cancels_available_journey() {
        DecisionTest::given(Some(journey("j-1", "agent-1")))
            .when(|record| decide_agent_unavailable(record, &JourneyId::new("j-1"), &notice("n-1"), &corr()))
            .then_next(|next| assert_eq!(next.unwrap().status, JourneyStatus::Cancelled))
            .then_emitted(|emit| assert_single_event(emit, "journey.cancelled"))
            .run();
    }

    #[test]
    fn unavailable_agent_only_notifies_booked_journey() {
        DecisionTest::given(Some(booked("j-1", "s-1")))
            .when(|record| decide_agent_unavailable(record, &JourneyId::new("j-1"), &notice("n-1"), &corr()))
            .then_next(|next| {
                let next = next.unwrap();
                assert_eq!(next.status, JourneyStatus::Booked);
                assert_eq!(next.notices, vec!["n-1".to_string()]);
            })
            .then_emitted(|emit| assert_single_event(emit, "journey.agent.unavailable"))
            .run();
    }

    #[test]
    fn repeated_notice_is_ignored() {
        let mut seen = booked("j-1", "s-1");
        seen.record_notice("n-1");
        DecisionTest::given(Some(seen))
            .when(|record| decide_agent_unavailable(record, &JourneyId::new("j-1"), &notice("n-1"), &corr()))
            .then_next(|next| assert!(next.is_none()))
            .then_emitted(assert_nothing_emitted)
            .run();
    }

    #[test]
    fn delivery_completes_booking() {
        DecisionTest::given(Some(booked("j-1", "s-1")))
            .when(|record| {
                decide_settlement(record, &JourneyId::new("j-1"), &status_changed("s-1", ShipmentStatus::Delivered), &corr())
            })
            .then_next(|next| assert_eq!(next.unwrap().status, JourneyStatus::Completed))
            .then_emitted(|emit| assert_single_event(emit, "journey.completed"))
            .run();
    }

    #[test]
    fn abort_releases_booking() {
        DecisionTest::given(Some(booked("j-1", "s-1")))
            .when(|record| {
                decide_settlement(record, &JourneyId::new("j-1"), &status_changed("s-1", ShipmentStatus::Aborted), &corr())
            })
            .then_next(|next| {
                let next = next.unwrap();
                assert_eq!(next.status, JourneyStatus::Available);
                assert!(next.booked_by.is_none());
            })
            .then_emitted(|emit| assert_single_event(emit, "journey.released"))
            .run();
    }

    #[test]
    fn other_shipment_cannot_settle_booking() {
        DecisionTest::given(Some(booked("j-1", "s-1")))
            .when(|record| {
                decide_settlement(record, &JourneyId::new("j-1"), &status_changed("s-2", ShipmentStatus::Delivered), &corr())
            })
            .then_next(|next| assert!(next.is_none()))
            .then_emitted(assert_nothing_emitted)
            .run();
    }
}
