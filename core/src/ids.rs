//! Identifier newtypes.
//!
//! Every entity is addressed by an opaque string id. Wrapping them in
//! distinct types keeps a `JourneyId` from being passed where a `ShipmentId`
//! is expected while still serializing as a bare string on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a [`Step`](crate::model::Step).
    StepId
);
string_id!(
    /// Identifier of a [`Shipment`](crate::model::Shipment).
    ShipmentId
);
string_id!(
    /// Identifier of a [`Journey`](crate::model::Journey).
    JourneyId
);
string_id!(
    /// Identifier of a [`Mission`](crate::model::Mission).
    MissionId
);
string_id!(
    /// Identifier of an [`Offer`](crate::model::Offer).
    OfferId
);
string_id!(
    /// Identifier of a user acting as sender, recipient, agent, operator or curator.
    UserId
);
string_id!(
    /// Identifier of a parcel.
    ParcelId
);
string_id!(
    /// Identifier of a location.
    LocationId
);
string_id!(
    /// Correlation id tying an RPC reply (or a chain of derived events) to its origin.
    CorrelationId
);

impl StepId {
    /// Deterministic id of the `index`-th step seeded from an offer.
    ///
    /// Seeding the same offer twice yields the same ids, so redelivered
    /// `offer.created` events cannot create duplicate step rows.
    #[must_use]
    pub fn for_offer(offer_id: &OfferId, index: u32) -> Self {
        Self(format!("{offer_id}:{index}"))
    }
}

impl CorrelationId {
    /// Generate a fresh random correlation id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
