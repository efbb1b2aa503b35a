//! Offer: a bid attaching a shipment to a mission or a journey.

use crate::error::ValidationError;
use crate::ids::{JourneyId, MissionId, OfferId, ShipmentId};
use serde::{Deserialize, Serialize};

/// What the offer bids on. At least one side must be present.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    /// Mission bid on.
    pub mission_id: Option<MissionId>,
    /// Journey bid on.
    pub journey_id: Option<JourneyId>,
}

impl Bid {
    /// Bid on a journey.
    #[must_use]
    pub const fn journey(journey_id: JourneyId) -> Self {
        Self {
            mission_id: None,
            journey_id: Some(journey_id),
        }
    }

    /// Bid on a mission.
    #[must_use]
    pub const fn mission(mission_id: MissionId) -> Self {
        Self {
            mission_id: Some(mission_id),
            journey_id: None,
        }
    }

    /// Whether neither a mission nor a journey is referenced.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.mission_id.is_none() && self.journey_id.is_none()
    }
}

/// A bid attaching a shipment to a mission or journey.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer id.
    pub id: OfferId,
    /// Shipment being offered.
    pub shipment_id: ShipmentId,
    /// Target of the bid.
    pub bid: Bid,
    /// Number of steps seeded for this offer.
    #[serde(default)]
    pub step_count: u32,
    /// Whether steps have been seeded.
    #[serde(default)]
    pub seeded: bool,
}

impl Offer {
    /// An unseeded offer.
    #[must_use]
    pub const fn new(id: OfferId, shipment_id: ShipmentId, bid: Bid) -> Self {
        Self {
            id,
            shipment_id,
            bid,
            step_count: 0,
            seeded: false,
        }
    }

    /// Enforce the offer invariants.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::EmptyField`] for an empty offer or shipment id
    /// - [`ValidationError::MissingBid`] when the bid references neither a
    ///   mission nor a journey
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.as_str().is_empty() {
            return Err(ValidationError::EmptyField("offer id"));
        }
        if self.shipment_id.as_str().is_empty() {
            return Err(ValidationError::EmptyField("shipment id"));
        }
        if self.bid.is_empty() {
            return Err(ValidationError::MissingBid {
                offer_id: self.id.clone(),
            });
        }
        Ok(())
    }

    /// Replace the bid, re-checking the invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingBid`] for an empty bid, and
    /// [`ValidationError::InvalidStatusChange`] once steps were seeded for
    /// a different target.
    pub fn update_bid(&mut self, bid: Bid) -> Result<bool, ValidationError> {
        if bid.is_empty() {
            return Err(ValidationError::MissingBid {
                offer_id: self.id.clone(),
            });
        }
        if bid == self.bid {
            return Ok(false);
        }
        if self.seeded {
            return Err(ValidationError::InvalidStatusChange {
                entity: crate::routing::EntityType::Offer,
                id: self.id.to_string(),
                reason: "steps are already seeded for the current bid".to_string(),
            });
        }
        self.bid = bid;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bid_fails_validation() {
        let offer = Offer::new(OfferId::new("o-1"), ShipmentId::new("s-1"), Bid::default());
        assert_eq!(
            offer.validate(),
            Err(ValidationError::MissingBid {
                offer_id: OfferId::new("o-1")
            })
        );
    }

    #[test]
    fn update_to_empty_bid_fails() {
        let mut offer = Offer::new(
            OfferId::new("o-1"),
            ShipmentId::new("s-1"),
            Bid::journey(JourneyId::new("j-1")),
        );
        assert!(offer.update_bid(Bid::default()).is_err());
        assert_eq!(offer.bid, Bid::journey(JourneyId::new("j-1")));
    }

    #[test]
    fn seeded_offers_keep_their_target() {
        let mut offer = Offer::new(
            OfferId::new("o-1"),
            ShipmentId::new("s-1"),
            Bid::journey(JourneyId::new("j-1")),
        );
        offer.seeded = true;
        assert!(offer.update_bid(Bid::mission(MissionId::new("m-1"))).is_err());
        assert_eq!(offer.update_bid(Bid::journey(JourneyId::new("j-1"))), Ok(false));
    }
}
