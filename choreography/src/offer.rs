//! Offer service and choreographer.
//!
//! [`OfferService`] creates and updates offers, surfacing validation errors
//! to its caller. [`OfferChoreographer`] reacts to `offer.created`: it
//! resolves the shipment and the bid target, derives the legs through the
//! [`StepFactory`], seeds them at `ACCEPTED` and attaches the shipment.
//!
//! Seeding is safe to re-run. Step ids are derived from the offer id and
//! leg index, steps are only inserted when absent, and the offer is marked
//! seeded last.

use crate::environment::Environment;
use crate::step_engine::StepEngine;
use async_trait::async_trait;
use courier_core::decision::Decision;
use courier_core::environment::StepFactory;
use courier_core::error::{CoordinationError, ValidationError};
use courier_core::ids::{CorrelationId, OfferId, StepId, UserId};
use courier_core::messages::{
    CreateOffer, OfferCreated, OfferStepsSeeded, OfferUpdated, PreviewOfferSteps,
    ShipmentOfferAttached, ShipmentStatusChanged, StepPreview, UpdateOffer,
};
use courier_core::model::{Bid, Journey, Mission, Offer, Shipment, Step, StepRef, StepState};
use courier_core::routing::EntityType;
use courier_core::store::{EntityStore, Record};
use courier_runtime::consumer::{Handles, MessageContext};
use courier_runtime::metrics::DomainMetrics;
use courier_runtime::rpc::RpcHandler;
use courier_runtime::runner::Runner;
use std::sync::Arc;

/// Decide the creation of `offer`.
///
/// Re-creating an identical offer decides nothing.
///
/// # Errors
///
/// Returns [`CoordinationError::Validation`] if the offer is invalid or a
/// different offer already uses its id.
pub fn decide_create(
    record: Option<&Record<Offer>>,
    offer: &Offer,
    correlation: &CorrelationId,
) -> Result<Decision<Offer>, CoordinationError> {
    offer.validate()?;
    if let Some(existing) = record {
        if existing.entity.shipment_id == offer.shipment_id && existing.entity.bid == offer.bid {
            return Ok(Decision::unchanged());
        }
        return Err(ValidationError::InvalidStatusChange {
            entity: EntityType::Offer,
            id: offer.id.to_string(),
            reason: "an offer with this id already exists".to_string(),
        }
        .into());
    }

    let fresh = Offer::new(offer.id.clone(), offer.shipment_id.clone(), offer.bid.clone());
    let created = OfferCreated {
        offer_id: fresh.id.clone(),
        shipment_id: fresh.shipment_id.clone(),
        bid: fresh.bid.clone(),
    };
    Ok(Decision::update(fresh).with_event(&created, correlation)?)
}

/// Decide replacing the offer's bid.
///
/// # Errors
///
/// - [`CoordinationError::NotFound`] if the offer does not exist
/// - [`CoordinationError::Validation`] for an empty bid or a seeded offer
pub fn decide_update(
    record: Option<&Record<Offer>>,
    offer_id: &OfferId,
    bid: &Bid,
    correlation: &CorrelationId,
) -> Result<Decision<Offer>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Offer, offer_id))?;
    let mut offer = record.entity.clone();
    if !offer.update_bid(bid.clone())? {
        return Ok(Decision::unchanged());
    }
    let updated = OfferUpdated {
        offer_id: offer.id.clone(),
        shipment_id: offer.shipment_id.clone(),
        bid: offer.bid.clone(),
    };
    Ok(Decision::update(offer).with_event(&updated, correlation)?)
}

/// Check that attaching `bid` to `shipment` does not replace another
/// mission or journey.
///
/// # Errors
///
/// Returns [`ValidationError::AlreadyAttached`] on a conflicting attachment.
pub fn check_attachment(shipment: &Shipment, bid: &Bid) -> Result<(), ValidationError> {
    let conflict = |existing: String| ValidationError::AlreadyAttached {
        shipment_id: shipment.id.clone(),
        existing,
    };
    if let (Some(current), Some(wanted)) = (&shipment.journey_id, &bid.journey_id) {
        if current != wanted {
            return Err(conflict(format!("journey {current}")));
        }
    }
    if let (Some(current), Some(wanted)) = (&shipment.mission_id, &bid.mission_id) {
        if current != wanted {
            return Err(conflict(format!("mission {current}")));
        }
    }
    Ok(())
}

/// Decide attaching the offer's target and seeded steps to the shipment.
///
/// # Errors
///
/// - [`CoordinationError::NotFound`] if the shipment does not exist
/// - [`CoordinationError::Validation`] on a conflicting attachment
pub fn decide_attach(
    record: Option<&Record<Shipment>>,
    offer: &Offer,
    steps: &[StepRef],
    correlation: &CorrelationId,
) -> Result<Decision<Shipment>, CoordinationError> {
    let record =
        record.ok_or_else(|| CoordinationError::not_found(EntityType::Shipment, &offer.shipment_id))?;
    let mut shipment = record.entity.clone();
    check_attachment(&shipment, &offer.bid)?;

    let attached = (shipment.journey_id.is_none() && offer.bid.journey_id.is_some())
        || (shipment.mission_id.is_none() && offer.bid.mission_id.is_some());
    if shipment.journey_id.is_none() {
        shipment.journey_id.clone_from(&offer.bid.journey_id);
    }
    if shipment.mission_id.is_none() {
        shipment.mission_id.clone_from(&offer.bid.mission_id);
    }
    let merged = shipment.merge_steps(steps);
    let status = shipment.recompute_status();
    if !attached && !merged {
        return Ok(Decision::unchanged());
    }

    let mut decision = Decision::update(shipment.clone());
    if attached {
        decision = decision.with_event(
            &ShipmentOfferAttached {
                shipment_id: shipment.id.clone(),
                offer_id: offer.id.clone(),
                mission_id: shipment.mission_id.clone(),
                journey_id: shipment.journey_id.clone(),
            },
            correlation,
        )?;
    }
    if let Some((previous, current)) = status {
        decision = decision.with_event(
            &ShipmentStatusChanged {
                shipment_id: shipment.id.clone(),
                journey_id: shipment.journey_id.clone(),
                mission_id: shipment.mission_id.clone(),
                previous,
                current,
            },
            correlation,
        )?;
    }
    Ok(decision)
}

/// Decide marking the offer seeded with `step_ids`.
///
/// # Errors
///
/// Returns [`CoordinationError::NotFound`] if the offer does not exist.
pub fn decide_seeded(
    record: Option<&Record<Offer>>,
    offer_id: &OfferId,
    step_ids: &[StepId],
    correlation: &CorrelationId,
) -> Result<Decision<Offer>, CoordinationError> {
    let record = record.ok_or_else(|| CoordinationError::not_found(EntityType::Offer, offer_id))?;
    if record.entity.seeded {
        return Ok(Decision::unchanged());
    }
    let mut offer = record.entity.clone();
    offer.seeded = true;
    offer.step_count = u32::try_from(step_ids.len()).unwrap_or(u32::MAX);
    let seeded = OfferStepsSeeded {
        offer_id: offer.id.clone(),
        shipment_id: offer.shipment_id.clone(),
        step_ids: step_ids.to_vec(),
    };
    Ok(Decision::update(offer).with_event(&seeded, correlation)?)
}

/// Prepare a factory leg for seeding under `offer`.
fn seeded_leg(mut leg: Step, offer: &Offer, agent: Option<&UserId>) -> Step {
    leg.id = StepId::for_offer(&offer.id, leg.index);
    leg.state = StepState::Accepted;
    leg.offer_id = Some(offer.id.clone());
    leg.journey_id.clone_from(&offer.bid.journey_id);
    if let Some(agent) = agent {
        leg.agent_id = Some(agent.clone());
        leg.parameters.performer = Some(agent.clone());
    }
    leg
}

/// Creates and updates offers.
#[derive(Clone)]
pub struct OfferService {
    offers: Runner<Offer>,
}

impl OfferService {
    /// Service over the environment's offer store.
    #[must_use]
    pub fn new(env: &Environment) -> Self {
        Self {
            offers: env.runner(&env.stores.offers),
        }
    }

    /// Create an offer and publish `offer.created`.
    ///
    /// # Errors
    ///
    /// See [`decide_create`].
    pub async fn create(&self, offer: &Offer, correlation: &CorrelationId) -> Result<Offer, CoordinationError> {
        offer.validate()?;
        let applied = self
            .offers
            .apply(offer.id.as_str(), |record| decide_create(record, offer, correlation))
            .await?;
        if applied.changed {
            tracing::info!(offer_id = %offer.id, shipment_id = %offer.shipment_id, "Offer created");
        }
        applied
            .current
            .map(|record| record.entity)
            .ok_or_else(|| CoordinationError::not_found(EntityType::Offer, &offer.id))
    }

    /// Replace an offer's bid and publish `offer.updated`.
    ///
    /// # Errors
    ///
    /// See [`decide_update`].
    pub async fn update(
        &self,
        offer_id: &OfferId,
        bid: &Bid,
        correlation: &CorrelationId,
    ) -> Result<Offer, CoordinationError> {
        let applied = self
            .offers
            .apply(offer_id.as_str(), |record| decide_update(record, offer_id, bid, correlation))
            .await?;
        if applied.changed {
            tracing::info!(offer_id = %offer_id, "Offer updated");
        }
        applied
            .current
            .map(|record| record.entity)
            .ok_or_else(|| CoordinationError::not_found(EntityType::Offer, offer_id))
    }

    /// Load an offer.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store is unavailable.
    pub async fn get(&self, offer_id: &str) -> Result<Option<Offer>, CoordinationError> {
        Ok(self.offers.load(offer_id).await?.map(|record| record.entity))
    }
}

#[async_trait]
impl Handles<CreateOffer> for OfferService {
    async fn handle(&self, command: CreateOffer, context: &MessageContext) -> Result<(), CoordinationError> {
        self.create(&command.offer, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl Handles<UpdateOffer> for OfferService {
    async fn handle(&self, command: UpdateOffer, context: &MessageContext) -> Result<(), CoordinationError> {
        self.update(&command.offer_id, &command.bid, &context.correlation_id)
            .await?;
        Ok(())
    }
}

/// Seeds steps for new offers.
#[derive(Clone)]
pub struct OfferChoreographer {
    offers: Runner<Offer>,
    shipments: Runner<Shipment>,
    journeys: Arc<dyn EntityStore<Journey>>,
    missions: Arc<dyn EntityStore<Mission>>,
    steps: StepEngine,
    factory: Arc<dyn StepFactory>,
}

impl OfferChoreographer {
    /// Choreographer over the environment's stores, deriving legs with
    /// `factory`.
    #[must_use]
    pub fn new(env: &Environment, factory: Arc<dyn StepFactory>) -> Self {
        Self {
            offers: env.runner(&env.stores.offers),
            shipments: env.runner(&env.stores.shipments),
            journeys: Arc::clone(&env.stores.journeys),
            missions: Arc::clone(&env.stores.missions),
            steps: StepEngine::new(env),
            factory,
        }
    }

    /// Seed the steps of a created offer. Returns the seeded step ids, or
    /// an empty list if the offer was already seeded.
    ///
    /// # Errors
    ///
    /// - [`CoordinationError::NotFound`] if the offer, shipment or bid
    ///   target does not exist
    /// - [`CoordinationError::Validation`] if the shipment is attached
    ///   elsewhere
    /// - [`CoordinationError::Transient`] if a store, the broker or the
    ///   step factory failed
    pub async fn seed(&self, event: &OfferCreated, correlation: &CorrelationId) -> Result<Vec<StepId>, CoordinationError> {
        let offer = self.offers.require(event.offer_id.as_str()).await?.entity;
        if offer.seeded {
            tracing::debug!(offer_id = %offer.id, "Offer already seeded");
            return Ok(Vec::new());
        }
        let shipment = self.shipments.require(offer.shipment_id.as_str()).await?.entity;
        check_attachment(&shipment, &offer.bid)?;
        let agent = self.resolve_target(&offer.bid).await?;

        let legs = self.factory.steps_for(&shipment).await?;
        let mut refs = Vec::with_capacity(legs.len());
        for leg in legs {
            let step = seeded_leg(leg, &offer, agent.as_ref());
            let record = self.steps.seed(&step, correlation).await?;
            refs.push(StepRef {
                step_id: record.entity.id.clone(),
                index: record.entity.index,
                state: record.entity.state,
                version: record.version,
            });
        }

        let attached = self
            .shipments
            .apply(shipment.id.as_str(), |record| decide_attach(record, &offer, &refs, correlation))
            .await?;
        if let (Some(before), Some(after)) = (attached.previous.as_ref(), attached.current.as_ref()) {
            if before.entity.status != after.entity.status {
                DomainMetrics::record_shipment_status(after.entity.status.as_str());
            }
        }

        let step_ids: Vec<StepId> = refs.into_iter().map(|r| r.step_id).collect();
        self.offers
            .apply(offer.id.as_str(), |record| decide_seeded(record, &offer.id, &step_ids, correlation))
            .await?;

        tracing::info!(
            offer_id = %offer.id,
            shipment_id = %offer.shipment_id,
            steps = step_ids.len(),
            "Offer steps seeded"
        );
        Ok(step_ids)
    }

    /// Check that the bid's mission and journey exist. Returns the agent
    /// of the journey, if one is bid on.
    async fn resolve_target(&self, bid: &Bid) -> Result<Option<UserId>, CoordinationError> {
        if let Some(mission_id) = &bid.mission_id {
            if self.missions.get(mission_id.as_str()).await?.is_none() {
                return Err(CoordinationError::not_found(EntityType::Mission, mission_id));
            }
        }
        let Some(journey_id) = &bid.journey_id else {
            return Ok(None);
        };
        let journey = self
            .journeys
            .get(journey_id.as_str())
            .await?
            .ok_or_else(|| CoordinationError::not_found(EntityType::Journey, journey_id))?;
        Ok(Some(journey.entity.agent_id))
    }
}

#[async_trait]
impl Handles<OfferCreated> for OfferChoreographer {
    async fn handle(&self, event: OfferCreated, context: &MessageContext) -> Result<(), CoordinationError> {
        self.seed(&event, &context.correlation_id).await?;
        Ok(())
    }
}

#[async_trait]
impl RpcHandler<PreviewOfferSteps> for OfferChoreographer {
    async fn respond(&self, call: PreviewOfferSteps) -> Result<StepPreview, CoordinationError> {
        let shipment = self.shipments.require(call.shipment_id.as_str()).await?.entity;
        let legs = self.factory.steps_for(&shipment).await?;
        Ok(StepPreview {
            success: true,
            step_count: Some(u32::try_from(legs.len()).unwrap_or(u32::MAX)),
            error: None,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_core::ids::{JourneyId, MissionId, ShipmentId};
    use courier_core::model::ShipmentStatus;
    use courier_testing::DecisionTest;
    use courier_testing::decision_test::assertions::{
        assert_nothing_emitted, assert_single_event, assert_topics,
    };
    use courier_testing::fixtures::{journey_offer, mission_offer, shipment, step};

    fn corr() -> CorrelationId {
        CorrelationId::new("c-1")
    }

    fn accepted_refs(offer: &str, legs: u32) -> Vec<StepRef> {
        (0..legs)
            .map(|index| StepRef {
                step_id: StepId::for_offer(&OfferId::new(offer), index),
                index,
                state: StepState::Accepted,
                version: 2,
            })
            .collect()
    }

    #[test]
    fn empty_bid_is_rejected_on_create() {
        let mut offer = journey_offer("o-1", "s-1", "j-1");
        offer.bid = Bid::default();
        DecisionTest::<Offer>::given(None)
            .when(move |record| decide_create(record, &offer, &corr()))
            .then_rejected(|error| {
                assert!(matches!(
                    error,
                    CoordinationError::Validation(ValidationError::MissingBid { .. })
                ));
            })
            .run();
    }

    #[test]
    fn empty_bid_is_rejected_on_update() {
        DecisionTest::given(Some(journey_offer("o-1", "s-1", "j-1")))
            .when(|record| decide_update(record, &OfferId::new("o-1"), &Bid::default(), &corr()))
            .then_rejected(|error| {
                assert!(matches!(
                    error,
                    CoordinationError::Validation(ValidationError::MissingBid { .. })
                ));
            })
            .run();
    }

    #[test]
    fn create_announces_offer() {
        let offer = mission_offer("o-1", "s-1", "m-1");
        DecisionTest::<Offer>::given(None)
            .when(move |record| decide_create(record, &offer, &corr()))
            .then_next(|next| assert!(!next.unwrap().seeded))
            .then_emitted(|emit| assert_single_event(emit, "offer.created"))
            .run();
    }

    #[test]
    fn repeated_create_is_noop() {
        let offer = journey_offer("o-1", "s-1", "j-1");
        DecisionTest::given(Some(offer.clone()))
            .when(move |record| decide_create(record, &offer, &corr()))
            .then_next(|next| assert!(next.is_none()))
            .then_emitted(assert_nothing_emitted)
            .run();
    }

    #[test]
    fn conflicting_create_is_rejected() {
        let other = journey_offer("o-1", "s-2", "j-1");
        DecisionTest::given(Some(journey_offer("o-1", "s-1", "j-1")))
            .when(move |record| decide_create(record, &other, &corr()))
            .then_rejected(|error| assert!(matches!(error, CoordinationError::Validation(_))))
            .run();
    }

    #[test]
    fn update_replaces_bid() {
        let bid = Bid::mission(MissionId::new("m-2"));
        DecisionTest::given(Some(journey_offer("o-1", "s-1", "j-1")))
            .when(move |record| decide_update(record, &OfferId::new("o-1"), &bid, &corr()))
            .then_next(|next| assert_eq!(next.unwrap().bid.mission_id, Some(MissionId::new("m-2"))))
            .then_emitted(|emit| assert_single_event(emit, "offer.updated"))
            .run();
    }

    #[test]
    fn attach_sets_target_and_initializes_shipment() {
        let offer = journey_offer("o-1", "s-1", "j-1");
        let refs = accepted_refs("o-1", 2);
        DecisionTest::given(Some(shipment("s-1")))
            .when(move |record| decide_attach(record, &offer, &refs, &corr()))
            .then_next(|next| {
                let next = next.unwrap();
                assert_eq!(next.journey_id, Some(JourneyId::new("j-1")));
                assert_eq!(next.status, ShipmentStatus::Initialized);
                assert_eq!(next.steps.len(), 2);
            })
            .then_emitted(|emit| {
                assert_topics(emit, &["shipment.offer.attached", "shipment.status.changed"]);
            })
            .run();
    }

    #[test]
    fn attach_twice_is_noop() {
        let offer = journey_offer("o-1", "s-1", "j-1");
        let refs = accepted_refs("o-1", 2);
        let mut already = shipment("s-1");
        already.journey_id = Some(JourneyId::new("j-1"));
        already.merge_steps(&refs);
        already.recompute_status();

        DecisionTest::given(Some(already))
            .when(move |record| decide_attach(record, &offer, &refs, &corr()))
            .then_next(|next| assert!(next.is_none()))
            .then_emitted(assert_nothing_emitted)
            .run();
    }

    #[test]
    fn attach_to_other_journey_is_rejected() {
        let offer = journey_offer("o-1", "s-1", "j-2");
        let mut attached = shipment("s-1");
        attached.journey_id = Some(JourneyId::new("j-1"));
        DecisionTest::given(Some(attached))
            .when(move |record| decide_attach(record, &offer, &[], &corr()))
            .then_rejected(|error| {
                assert!(matches!(
                    error,
                    CoordinationError::Validation(ValidationError::AlreadyAttached { .. })
                ));
            })
            .run();
    }

    #[test]
    fn seeded_offer_records_count_once() {
        let ids = vec![StepId::new("o-1:0"), StepId::new("o-1:1")];
        let again = ids.clone();
        DecisionTest::given(Some(journey_offer("o-1", "s-1", "j-1")))
            .when(move |record| decide_seeded(record, &OfferId::new("o-1"), &ids, &corr()))
            .then_next(|next| {
                let next = next.unwrap();
                assert!(next.seeded);
                assert_eq!(next.step_count, 2);
            })
            .then_emitted(|emit| assert_single_event(emit, "offer.steps.seeded"))
            .run();

        let mut seeded = journey_offer("o-1", "s-1", "j-1");
        seeded.seeded = true;
        DecisionTest::given(Some(seeded))
            .when(move |record| decide_seeded(record, &OfferId::new("o-1"), &again, &corr()))
            .then_emitted(assert_nothing_emitted)
            .run();
    }

    #[test]
    fn leg_is_tagged_with_offer_and_journey() {
        let offer = journey_offer("o-7", "s-1", "j-1");
        let leg = step("", "s-1", 1, StepState::Initialized);
        let seeded = seeded_leg(leg, &offer, Some(&UserId::new("agent-9")));

        assert_eq!(seeded.id, StepId::new("o-7:1"));
        assert_eq!(seeded.state, StepState::Accepted);
        assert_eq!(seeded.offer_id, Some(OfferId::new("o-7")));
        assert_eq!(seeded.journey_id, Some(JourneyId::new("j-1")));
        assert_eq!(seeded.agent_id, Some(UserId::new("agent-9")));
        assert_eq!(seeded.shipment_id, ShipmentId::new("s-1"));
    }
}
