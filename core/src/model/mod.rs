//! Domain model of the five coordinated entities.

mod journey;
mod mission;
mod offer;
mod shipment;
mod step;

pub use journey::{AvailabilityWindow, Journey, JourneyStatus};
pub use mission::{Mission, MissionStatus};
pub use offer::{Bid, Offer};
pub use shipment::{Shipment, ShipmentStatus, StepRef};
pub use step::{
    Rating, Step, StepParameters, StepState, TransitionOutcome, TransitionRecord,
    TransitionRequest,
};

use crate::ids::LocationId;
use serde::{Deserialize, Serialize};

/// A route between two locations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Itinerary {
    /// Start.
    pub origin: LocationId,
    /// End.
    pub destination: LocationId,
    /// Intermediate stops, in order.
    #[serde(default)]
    pub waypoints: Vec<LocationId>,
}
