//! Journey: an agent-offered transport slot.

use crate::error::ValidationError;
use crate::ids::{JourneyId, ShipmentId, UserId};
use crate::model::Itinerary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Journey status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JourneyStatus {
    /// Open for booking.
    Available,
    /// Booked by one shipment.
    Booked,
    /// The booked shipment was delivered.
    Completed,
    /// Withdrawn.
    Cancelled,
}

impl JourneyStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Booked => "BOOKED",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JourneyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the agent is available to travel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    /// Window start.
    pub starts_at: DateTime<Utc>,
    /// Window end.
    pub ends_at: DateTime<Utc>,
}

/// An agent-offered transport slot.
///
/// `capacity` is advisory: booking never decrements it. Exclusive booking
/// is enforced by the `AVAILABLE -> BOOKED` status change under the
/// store's compare-and-set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Journey {
    /// Journey id.
    pub id: JourneyId,
    /// Agent offering the slot.
    pub agent_id: UserId,
    /// Route travelled.
    pub route: Itinerary,
    /// Availability window.
    pub window: AvailabilityWindow,
    /// Advisory parcel capacity.
    pub capacity: u32,
    /// Price in minor currency units.
    pub price: u64,
    /// Current status.
    pub status: JourneyStatus,
    /// Shipment holding the booking.
    pub booked_by: Option<ShipmentId>,
    /// Agent-unavailable notices already relayed for this journey, newest
    /// last, at most [`Journey::MAX_NOTICES`].
    #[serde(default)]
    pub notices: Vec<String>,
}

impl Journey {
    /// Notice ids remembered for de-duplication. Older ids are forgotten.
    pub const MAX_NOTICES: usize = 32;

    /// Whether `shipment` may book this journey.
    ///
    /// Re-booking by the shipment that already holds the booking is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::JourneyUnavailable`] with the reason.
    pub fn check_booking(&self, shipment: &ShipmentId) -> Result<(), ValidationError> {
        let unavailable = |reason: String| ValidationError::JourneyUnavailable {
            journey_id: self.id.clone(),
            reason,
        };
        match self.status {
            JourneyStatus::Available if self.capacity == 0 => {
                Err(unavailable("journey has no capacity".to_string()))
            }
            JourneyStatus::Available => Ok(()),
            JourneyStatus::Booked if self.booked_by.as_ref() == Some(shipment) => Ok(()),
            JourneyStatus::Booked => Err(unavailable(match &self.booked_by {
                Some(holder) => format!("already booked by shipment {holder}"),
                None => "already booked".to_string(),
            })),
            status @ (JourneyStatus::Completed | JourneyStatus::Cancelled) => {
                Err(unavailable(format!("journey is {status}")))
            }
        }
    }

    /// Book for `shipment`. Returns `false` if it already held the booking.
    ///
    /// # Errors
    ///
    /// See [`Journey::check_booking`].
    pub fn book(&mut self, shipment: &ShipmentId) -> Result<bool, ValidationError> {
        self.check_booking(shipment)?;
        if self.status == JourneyStatus::Booked {
            return Ok(false);
        }
        self.status = JourneyStatus::Booked;
        self.booked_by = Some(shipment.clone());
        Ok(true)
    }

    /// Release a booking held by `shipment` back to availability.
    ///
    /// Returns `false` when the journey is not booked by that shipment.
    pub fn release(&mut self, shipment: &ShipmentId) -> bool {
        if self.status != JourneyStatus::Booked || self.booked_by.as_ref() != Some(shipment) {
            return false;
        }
        self.status = JourneyStatus::Available;
        self.booked_by = None;
        true
    }

    /// Complete a booking held by `shipment`.
    ///
    /// Returns `false` when the journey is not booked by that shipment.
    pub fn complete(&mut self, shipment: &ShipmentId) -> bool {
        if self.status != JourneyStatus::Booked || self.booked_by.as_ref() != Some(shipment) {
            return false;
        }
        self.status = JourneyStatus::Completed;
        true
    }

    /// Cancel an available journey. Returns `false` unless it was `AVAILABLE`.
    pub fn cancel_if_available(&mut self) -> bool {
        if self.status != JourneyStatus::Available {
            return false;
        }
        self.status = JourneyStatus::Cancelled;
        true
    }

    /// Record an agent-unavailable notice. Returns `false` if already seen
    /// among the last [`Journey::MAX_NOTICES`].
    pub fn record_notice(&mut self, notice_id: &str) -> bool {
        if self.notices.iter().any(|seen| seen == notice_id) {
            return false;
        }
        if self.notices.len() >= Self::MAX_NOTICES {
            let excess = self.notices.len() + 1 - Self::MAX_NOTICES;
            self.notices.drain(..excess);
        }
        self.notices.push(notice_id.to_string());
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ids::LocationId;

    fn journey(status: JourneyStatus) -> Journey {
        let at = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Journey {
            id: JourneyId::new("j-1"),
            agent_id: UserId::new("agent"),
            route: Itinerary {
                origin: LocationId::new("a"),
                destination: LocationId::new("b"),
                waypoints: Vec::new(),
            },
            window: AvailabilityWindow {
                starts_at: at,
                ends_at: at,
            },
            capacity: 1,
            price: 1_000,
            status,
            booked_by: None,
            notices: Vec::new(),
        }
    }

    #[test]
    fn booking_is_exclusive() {
        let mut j = journey(JourneyStatus::Available);
        let first = ShipmentId::new("s-1");
        assert_eq!(j.book(&first), Ok(true));
        assert_eq!(j.book(&first), Ok(false));
        assert!(j.book(&ShipmentId::new("s-2")).is_err());
        assert_eq!(j.booked_by, Some(first));
    }

    #[test]
    fn zero_capacity_cannot_be_booked() {
        let mut j = journey(JourneyStatus::Available);
        j.capacity = 0;
        assert!(j.check_booking(&ShipmentId::new("s-1")).is_err());
    }

    #[test]
    fn release_only_by_holder() {
        let mut j = journey(JourneyStatus::Available);
        j.book(&ShipmentId::new("s-1")).unwrap();
        assert!(!j.release(&ShipmentId::new("s-2")));
        assert!(j.release(&ShipmentId::new("s-1")));
        assert_eq!(j.status, JourneyStatus::Available);
        assert!(j.booked_by.is_none());
    }

    #[test]
    fn only_available_journeys_are_cancelled() {
        assert!(journey(JourneyStatus::Available).cancel_if_available());
        assert!(!journey(JourneyStatus::Booked).cancel_if_available());
    }

    #[test]
    fn notices_are_deduplicated() {
        let mut j = journey(JourneyStatus::Booked);
        assert!(j.record_notice("n-1"));
        assert!(!j.record_notice("n-1"));
    }

    #[test]
    fn notice_history_is_bounded() {
        let mut j = journey(JourneyStatus::Booked);
        for n in 0..=Journey::MAX_NOTICES {
            assert!(j.record_notice(&format!("n-{n}")));
        }

        assert_eq!(j.notices.len(), Journey::MAX_NOTICES);
        assert_eq!(j.notices.first().map(String::as_str), Some("n-1"));
        assert!(!j.record_notice(&format!("n-{}", Journey::MAX_NOTICES)));
        assert!(j.record_notice("n-0"));
        assert_eq!(j.notices.len(), Journey::MAX_NOTICES);
    }
}
