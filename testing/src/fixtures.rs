//! Entity builders and a deterministic step factory.

use crate::mocks::test_clock;
use courier_core::bus::BoxFuture;
use courier_core::environment::{Clock, StepFactory};
use courier_core::error::CoordinationError;
use courier_core::ids::{
    JourneyId, LocationId, MissionId, OfferId, ParcelId, ShipmentId, StepId, UserId,
};
use courier_core::model::{
    AvailabilityWindow, Bid, Itinerary, Journey, JourneyStatus, Mission, MissionStatus, Offer,
    Shipment, ShipmentStatus, Step, StepParameters, StepState,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// A route from `depot-a` to `depot-b`.
#[must_use]
pub fn itinerary() -> Itinerary {
    Itinerary {
        origin: LocationId::new("depot-a"),
        destination: LocationId::new("depot-b"),
        waypoints: Vec::new(),
    }
}

/// A pending shipment with no steps, sent by `sender-of-{id}`.
#[must_use]
pub fn shipment(id: &str) -> Shipment {
    Shipment {
        id: ShipmentId::new(id),
        sender_id: UserId::new(format!("sender-of-{id}")),
        parcel_id: ParcelId::new(format!("parcel-of-{id}")),
        from_location: LocationId::new("depot-a"),
        to_location: LocationId::new("depot-b"),
        journey_id: None,
        mission_id: None,
        status: ShipmentStatus::Pending,
        steps: Vec::new(),
    }
}

/// An available journey of `agent` with capacity 1, open for a day from
/// the test clock.
#[must_use]
pub fn journey(id: &str, agent: &str) -> Journey {
    let starts_at = test_clock().now();
    Journey {
        id: JourneyId::new(id),
        agent_id: UserId::new(agent),
        route: itinerary(),
        window: AvailabilityWindow {
            starts_at,
            ends_at: starts_at + chrono::Duration::days(1),
        },
        capacity: 1,
        price: 2_500,
        status: JourneyStatus::Available,
        booked_by: None,
        notices: Vec::new(),
    }
}

/// An active mission curated by `curator` with no journeys.
#[must_use]
pub fn mission(id: &str, curator: &str) -> Mission {
    Mission {
        id: MissionId::new(id),
        curator_id: UserId::new(curator),
        route: itinerary(),
        journey_ids: Vec::new(),
        status: MissionStatus::Active,
    }
}

/// An unseeded offer of `shipment` on `journey`.
#[must_use]
pub fn journey_offer(id: &str, shipment: &str, journey: &str) -> Offer {
    Offer::new(
        OfferId::new(id),
        ShipmentId::new(shipment),
        Bid::journey(JourneyId::new(journey)),
    )
}

/// An unseeded offer of `shipment` on `mission`.
#[must_use]
pub fn mission_offer(id: &str, shipment: &str, mission: &str) -> Offer {
    Offer::new(
        OfferId::new(id),
        ShipmentId::new(shipment),
        Bid::mission(MissionId::new(mission)),
    )
}

/// A step of `shipment` at `index` in `state`, carried by `agent-1`.
#[must_use]
pub fn step(id: &str, shipment: &str, index: u32, state: StepState) -> Step {
    Step {
        id: StepId::new(id),
        shipment_id: ShipmentId::new(shipment),
        journey_id: None,
        index,
        operator_id: None,
        agent_id: Some(UserId::new("agent-1")),
        sender_id: UserId::new(format!("sender-of-{shipment}")),
        recipient_id: UserId::new(format!("recipient-of-{shipment}")),
        holder_id: None,
        state,
        parameters: StepParameters::default(),
        offer_id: None,
        rating: None,
        transitions: Vec::new(),
    }
}

/// Step factory that splits every shipment into a fixed number of legs.
///
/// Leg `i` runs from `relay-{i}` to `relay-{i + 1}`; the first leg starts at
/// the shipment's sender and the last ends at `recipient-of-{shipment}`.
#[derive(Debug)]
pub struct LegStepFactory {
    legs: u32,
    cost_per_leg: u64,
    available: AtomicBool,
}

impl LegStepFactory {
    /// Factory producing `legs` legs per shipment.
    #[must_use]
    pub const fn new(legs: u32) -> Self {
        Self {
            legs,
            cost_per_leg: 1_000,
            available: AtomicBool::new(true),
        }
    }

    /// Make [`StepFactory::steps_for`] fail transiently until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn party(&self, shipment: &Shipment, position: u32) -> UserId {
        if position == 0 {
            shipment.sender_id.clone()
        } else if position == self.legs {
            UserId::new(format!("recipient-of-{}", shipment.id))
        } else {
            UserId::new(format!("relay-{position}"))
        }
    }
}

impl Default for LegStepFactory {
    fn default() -> Self {
        Self::new(2)
    }
}

impl StepFactory for LegStepFactory {
    fn steps_for<'a>(
        &'a self,
        shipment: &'a Shipment,
    ) -> BoxFuture<'a, Result<Vec<Step>, CoordinationError>> {
        let result = if self.available.load(Ordering::SeqCst) {
            Ok((0..self.legs)
                .map(|index| Step {
                    id: StepId::new(""),
                    shipment_id: shipment.id.clone(),
                    journey_id: None,
                    index,
                    operator_id: None,
                    agent_id: None,
                    sender_id: self.party(shipment, index),
                    recipient_id: self.party(shipment, index + 1),
                    holder_id: None,
                    state: StepState::Initialized,
                    parameters: StepParameters {
                        cost: self.cost_per_leg,
                        performer: None,
                        requester: Some(shipment.sender_id.clone()),
                    },
                    offer_id: None,
                    rating: None,
                    transitions: Vec::new(),
                })
                .collect())
        } else {
            Err(CoordinationError::Transient(
                "step factory unavailable".to_string(),
            ))
        };
        Box::pin(futures::future::ready(result))
    }
}
