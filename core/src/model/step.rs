//! Step: one custody leg of a shipment, and its transition table.

use crate::error::ValidationError;
use crate::ids::{JourneyId, OfferId, ShipmentId, StepId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepState {
    /// Created, not yet accepted by the agent.
    Initialized,
    /// Accepted by the agent.
    Accepted,
    /// Declined by the agent. Terminal.
    Rejected,
    /// Agent committed to perform the leg.
    Committed,
    /// Agent is on the way.
    Commenced,
    /// Parcel is in the agent's custody.
    PickedUp,
    /// Parcel handed to the recipient of the leg.
    DroppedOff,
    /// Leg confirmed done.
    Fulfilled,
    /// Payment for the leg claimed.
    Claimed,
    /// Payment settled. Terminal.
    Completed,
    /// Payment refunded. Terminal.
    Refunded,
    /// Leg abandoned. Terminal.
    Cancelled,
}

use StepState::{
    Accepted, Cancelled, Claimed, Commenced, Committed, Completed, DroppedOff, Fulfilled,
    Initialized, PickedUp, Refunded, Rejected,
};

impl StepState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 12] = [
        Initialized,
        Accepted,
        Rejected,
        Committed,
        Commenced,
        PickedUp,
        DroppedOff,
        Fulfilled,
        Claimed,
        Completed,
        Refunded,
        Cancelled,
    ];

    /// States a step may move to from `self`.
    #[must_use]
    pub const fn successors(self) -> &'static [Self] {
        match self {
            Initialized => &[Accepted, Rejected, Cancelled],
            Accepted => &[Committed, Cancelled],
            Committed => &[Commenced, Cancelled],
            Commenced => &[PickedUp, Cancelled],
            PickedUp => &[DroppedOff, Cancelled],
            DroppedOff => &[Fulfilled, Cancelled],
            Fulfilled => &[Claimed],
            Claimed => &[Completed, Refunded],
            Rejected | Cancelled | Completed | Refunded => &[],
        }
    }

    /// Whether `target` is an allowed successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, target: Self) -> bool {
        self.successors().contains(&target)
    }

    /// Terminal states have no successors.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// `CANCELLED` and `REJECTED`.
    #[must_use]
    pub const fn is_hard_failure(self) -> bool {
        matches!(self, Cancelled | Rejected)
    }

    /// `FULFILLED`, `CLAIMED` and `COMPLETED`.
    #[must_use]
    pub const fn is_delivered(self) -> bool {
        matches!(self, Fulfilled | Claimed | Completed)
    }

    /// Position along the happy path, `None` for hard failures.
    ///
    /// `COMPLETED` and `REFUNDED` share the last rank: both settle a
    /// claimed leg.
    #[must_use]
    pub const fn progress(self) -> Option<u8> {
        match self {
            Initialized => Some(0),
            Accepted => Some(1),
            Committed => Some(2),
            Commenced => Some(3),
            PickedUp => Some(4),
            DroppedOff => Some(5),
            Fulfilled => Some(6),
            Claimed => Some(7),
            Completed | Refunded => Some(8),
            Rejected | Cancelled => None,
        }
    }

    /// Wire name (`PICKED_UP`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Initialized => "INITIALIZED",
            Accepted => "ACCEPTED",
            Rejected => "REJECTED",
            Committed => "COMMITTED",
            Commenced => "COMMENCED",
            PickedUp => "PICKED_UP",
            DroppedOff => "DROPPED_OFF",
            Fulfilled => "FULFILLED",
            Claimed => "CLAIMED",
            Completed => "COMPLETED",
            Refunded => "REFUNDED",
            Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commercial parameters of a leg.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepParameters {
    /// Price of the leg in minor currency units.
    pub cost: u64,
    /// Who performs the leg.
    pub performer: Option<UserId>,
    /// Who requested the leg.
    pub requester: Option<UserId>,
}

/// Rating left on a completed leg.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rating {
    /// Score from 1 to 5.
    pub score: u8,
    /// Free-form comment.
    pub comment: Option<String>,
}

/// A request to move a step to `target`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    /// Step to transition.
    pub step_id: StepId,
    /// Requested state.
    pub target: StepState,
    /// User performing the transition.
    pub performer_id: UserId,
    /// Optional human-readable reason.
    pub reason: Option<String>,
    /// Caller-supplied key identifying this request across redeliveries.
    pub idempotency_key: String,
}

/// An applied transition, kept in the step's history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Key of the request that produced the transition.
    pub idempotency_key: String,
    /// State before.
    pub from: StepState,
    /// State after.
    pub to: StepState,
    /// Who performed it.
    pub performer_id: UserId,
    /// Reason supplied with the request.
    pub reason: Option<String>,
    /// When it was applied.
    pub at: DateTime<Utc>,
}

/// Result of applying a [`TransitionRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The state changed.
    Applied {
        /// State before.
        previous: StepState,
        /// State after.
        current: StepState,
    },
    /// The request was already applied; nothing changed.
    Duplicate,
}

/// One custody leg of a shipment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Step id.
    pub id: StepId,
    /// Owning shipment.
    pub shipment_id: ShipmentId,
    /// Journey the leg travels on, if any.
    pub journey_id: Option<JourneyId>,
    /// Position within the shipment's ordered legs.
    pub index: u32,
    /// Operator responsible for the leg.
    pub operator_id: Option<UserId>,
    /// Agent carrying the parcel.
    pub agent_id: Option<UserId>,
    /// Who hands the parcel over at the start of the leg.
    pub sender_id: UserId,
    /// Who receives the parcel at the end of the leg.
    pub recipient_id: UserId,
    /// Who currently holds the parcel.
    pub holder_id: Option<UserId>,
    /// Current state.
    pub state: StepState,
    /// Commercial parameters.
    pub parameters: StepParameters,
    /// Offer that seeded the step.
    pub offer_id: Option<OfferId>,
    /// Rating, once completed.
    pub rating: Option<Rating>,
    /// Applied transitions, oldest first.
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

impl Step {
    /// Check `request` against the current state without mutating.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::IdempotencyKeyReused`] if the key was already
    ///   used for a different target
    /// - [`ValidationError::InvalidTransition`] if the target is not an
    ///   allowed successor
    pub fn check_transition(
        &self,
        request: &TransitionRequest,
    ) -> Result<TransitionOutcome, ValidationError> {
        let earlier = self
            .transitions
            .iter()
            .find(|record| record.idempotency_key == request.idempotency_key);
        if let Some(record) = earlier {
            return if record.to == request.target {
                Ok(TransitionOutcome::Duplicate)
            } else {
                Err(ValidationError::IdempotencyKeyReused {
                    step_id: self.id.clone(),
                    key: request.idempotency_key.clone(),
                    applied: record.to,
                    requested: request.target,
                })
            };
        }

        if self.state.can_transition_to(request.target) {
            Ok(TransitionOutcome::Applied {
                previous: self.state,
                current: request.target,
            })
        } else {
            Err(ValidationError::InvalidTransition {
                step_id: self.id.clone(),
                from: self.state,
                to: request.target,
            })
        }
    }

    /// Apply `request`, recording it in the history and updating custody.
    ///
    /// A request whose idempotency key was already applied with the same
    /// target returns [`TransitionOutcome::Duplicate`] and changes nothing.
    ///
    /// # Errors
    ///
    /// See [`Step::check_transition`]. On error the step is unchanged.
    pub fn apply_transition(
        &mut self,
        request: &TransitionRequest,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, ValidationError> {
        let outcome = self.check_transition(request)?;
        if let TransitionOutcome::Applied { previous, current } = outcome {
            self.state = current;
            match current {
                PickedUp => self.holder_id = Some(request.performer_id.clone()),
                DroppedOff => self.holder_id = Some(self.recipient_id.clone()),
                _ => {}
            }
            self.transitions.push(TransitionRecord {
                idempotency_key: request.idempotency_key.clone(),
                from: previous,
                to: current,
                performer_id: request.performer_id.clone(),
                reason: request.reason.clone(),
                at,
            });
        }
        Ok(outcome)
    }

    /// Attach a rating to a completed step.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidRating`] if the step is not
    /// `COMPLETED` or the score is outside 1..=5.
    pub fn rate(&mut self, rating: Rating) -> Result<(), ValidationError> {
        if self.state != Completed {
            return Err(ValidationError::InvalidRating(format!(
                "step {} is {}, ratings need COMPLETED",
                self.id, self.state
            )));
        }
        if !(1..=5).contains(&rating.score) {
            return Err(ValidationError::InvalidRating(format!(
                "score {} outside 1..=5",
                rating.score
            )));
        }
        self.rating = Some(rating);
        Ok(())
    }
}
