//! Error taxonomy of the coordination core.
//!
//! | Error | Handler outcome | RPC outcome |
//! |---|---|---|
//! | [`CoordinationError::Validation`] | acknowledged and logged, never dead-lettered | `{valid:false}` / `{success:false}` |
//! | [`CoordinationError::NotFound`] | dead-lettered | typed failure reply |
//! | [`CoordinationError::Transient`] | dead-lettered, redriven later | typed fallback |
//! | [`CoordinationError::Conflict`] | retried in-process, dead-lettered when exhausted | typed failure reply |
//!
//! Duplicate delivery of an already-applied message is not an error at all:
//! handlers resolve it to a successful no-op.

use crate::bus::BusError;
use crate::ids::{OfferId, ShipmentId, StepId};
use crate::model::StepState;
use crate::routing::EntityType;
use crate::store::StoreError;
use thiserror::Error;

/// Domain rule violations. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The requested state is not an allowed successor.
    #[error("step {step_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        /// Step.
        step_id: StepId,
        /// Current state.
        from: StepState,
        /// Requested state.
        to: StepState,
    },

    /// An idempotency key was reused for a different target state.
    #[error(
        "idempotency key '{key}' on step {step_id} already applied {applied}, cannot apply {requested}"
    )]
    IdempotencyKeyReused {
        /// Step.
        step_id: StepId,
        /// Reused key.
        key: String,
        /// Target the key was first used for.
        applied: StepState,
        /// Target of the new request.
        requested: StepState,
    },

    /// An offer references neither a mission nor a journey.
    #[error("offer {offer_id} must reference a mission or a journey")]
    MissingBid {
        /// Offer.
        offer_id: OfferId,
    },

    /// The entity's status does not allow the change.
    #[error("{entity} {id}: {reason}")]
    InvalidStatusChange {
        /// Entity type.
        entity: EntityType,
        /// Entity id.
        id: String,
        /// Why the change is refused.
        reason: String,
    },

    /// The journey cannot be booked.
    #[error("journey {journey_id} is unavailable: {reason}")]
    JourneyUnavailable {
        /// Journey.
        journey_id: crate::ids::JourneyId,
        /// Why.
        reason: String,
    },

    /// The shipment is already attached to another mission or journey.
    #[error("shipment {shipment_id} is already attached to {existing}")]
    AlreadyAttached {
        /// Shipment.
        shipment_id: ShipmentId,
        /// Existing attachment.
        existing: String,
    },

    /// A rating was refused.
    #[error("invalid rating: {0}")]
    InvalidRating(String),

    /// A message payload could not be decoded.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A required field is empty.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
}

/// What a consumer does with a message whose handler returned an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and drop; retrying cannot succeed.
    Acknowledge,
    /// Reject without requeue so the broker dead-letters it.
    DeadLetter,
}

/// Errors returned by choreographer handlers and services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// A domain rule was violated.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity type.
        entity: EntityType,
        /// Entity id.
        id: String,
    },

    /// Broker or store unavailable.
    #[error("transient infrastructure failure: {0}")]
    Transient(String),

    /// Optimistic concurrency check failed.
    #[error("concurrent modification of {entity} {id}")]
    Conflict {
        /// Entity type.
        entity: EntityType,
        /// Entity id.
        id: String,
    },
}

impl CoordinationError {
    /// A [`CoordinationError::NotFound`] for `entity` with `id`.
    pub fn not_found(entity: EntityType, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Consumer disposition for this error.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::Validation(_) => Disposition::Acknowledge,
            Self::NotFound { .. } | Self::Transient(_) | Self::Conflict { .. } => {
                Disposition::DeadLetter
            }
        }
    }

    /// Whether this is an optimistic concurrency conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Transient(_) => "transient",
            Self::Conflict { .. } => "conflict",
        }
    }
}

impl From<BusError> for CoordinationError {
    fn from(error: BusError) -> Self {
        match error {
            BusError::Serialization(reason) => Self::Validation(ValidationError::Malformed(reason)),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<StoreError> for CoordinationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict { entity, id, .. } => Self::Conflict { entity, id },
            StoreError::Unavailable(reason) => Self::Transient(reason),
        }
    }
}
