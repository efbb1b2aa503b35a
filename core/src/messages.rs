//! Typed payloads for every event, command and RPC.
//!
//! Each payload is tied to its route through an associated constant, so the
//! routing key of a published message is always derived from its type.

use crate::ids::{JourneyId, MissionId, OfferId, ShipmentId, StepId, UserId};
use crate::model::{Bid, Offer, ShipmentStatus, StepRef, StepState, TransitionRequest};
use crate::routing::{CommandKind, EventKind, RpcAction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A payload published on the events exchange.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Route of the event.
    const KIND: EventKind;

    /// Id of the entity the event is about.
    fn entity_id(&self) -> &str;
}

/// A payload sent on the commands exchange.
pub trait DomainCommand: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Route of the command.
    const KIND: CommandKind;

    /// Id of the target entity.
    fn entity_id(&self) -> &str;
}

/// A typed RPC reply with a well-formed failure value.
pub trait RpcReply: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Reply returned instead of an error: on timeout, on transport failure,
    /// and when the responder's handler fails.
    fn failure(reason: impl Into<String>) -> Self;
}

/// A payload sent on the RPC exchange.
pub trait RpcCall: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Route of the request.
    const ACTION: RpcAction;

    /// Reply type.
    type Reply: RpcReply;

    /// Id of the entity the request reads.
    fn entity_id(&self) -> &str;
}

macro_rules! domain_event {
    ($ty:ty, $kind:ident, $id:ident) => {
        impl DomainEvent for $ty {
            const KIND: EventKind = EventKind::$kind;

            fn entity_id(&self) -> &str {
                self.$id.as_str()
            }
        }
    };
}

macro_rules! domain_command {
    ($ty:ty, $kind:ident, $($id:ident).+) => {
        impl DomainCommand for $ty {
            const KIND: CommandKind = CommandKind::$kind;

            fn entity_id(&self) -> &str {
                self.$($id).+.as_str()
            }
        }
    };
}

// ===== Events =====

/// A step was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCreated {
    /// Step.
    pub step_id: StepId,
    /// Owning shipment.
    pub shipment_id: ShipmentId,
    /// Journey the leg travels on.
    pub journey_id: Option<JourneyId>,
    /// Seeding offer.
    pub offer_id: Option<OfferId>,
    /// Leg index.
    pub index: u32,
    /// Initial state.
    pub state: StepState,
}
domain_event!(StepCreated, StepCreated, step_id);

/// A step changed state.
///
/// `steps` lists every step of the shipment in leg order, with the changed
/// step already at its new state, so the shipment can be re-aggregated
/// without another query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStateChanged {
    /// Step.
    pub step_id: StepId,
    /// Owning shipment.
    pub shipment_id: ShipmentId,
    /// State before.
    pub previous: StepState,
    /// State after.
    pub current: StepState,
    /// Who performed the transition.
    pub performer_id: UserId,
    /// Reason given.
    pub reason: Option<String>,
    /// Key of the transition request.
    pub idempotency_key: String,
    /// Sibling snapshots, in leg order.
    pub steps: Vec<StepRef>,
}
domain_event!(StepStateChanged, StepStateChanged, step_id);

/// A shipment's derived status changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentStatusChanged {
    /// Shipment.
    pub shipment_id: ShipmentId,
    /// Attached journey.
    pub journey_id: Option<JourneyId>,
    /// Attached mission.
    pub mission_id: Option<MissionId>,
    /// Status before.
    pub previous: ShipmentStatus,
    /// Status after.
    pub current: ShipmentStatus,
}
domain_event!(ShipmentStatusChanged, ShipmentStatusChanged, shipment_id);

/// An offer attached a mission or journey to a shipment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentOfferAttached {
    /// Shipment.
    pub shipment_id: ShipmentId,
    /// Offer.
    pub offer_id: OfferId,
    /// Attached mission.
    pub mission_id: Option<MissionId>,
    /// Attached journey.
    pub journey_id: Option<JourneyId>,
}
domain_event!(ShipmentOfferAttached, ShipmentOfferAttached, shipment_id);

/// A journey was booked.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyBooked {
    /// Journey.
    pub journey_id: JourneyId,
    /// Booking shipment.
    pub shipment_id: ShipmentId,
    /// Agent of the journey.
    pub agent_id: UserId,
}
domain_event!(JourneyBooked, JourneyBooked, journey_id);

/// A booking was released after the shipment aborted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyReleased {
    /// Journey.
    pub journey_id: JourneyId,
    /// Shipment that held the booking.
    pub shipment_id: ShipmentId,
}
domain_event!(JourneyReleased, JourneyReleased, journey_id);

/// A booked journey's shipment was delivered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyCompleted {
    /// Journey.
    pub journey_id: JourneyId,
    /// Delivered shipment.
    pub shipment_id: ShipmentId,
}
domain_event!(JourneyCompleted, JourneyCompleted, journey_id);

/// An available journey was cancelled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyCancelled {
    /// Journey.
    pub journey_id: JourneyId,
    /// Agent of the journey.
    pub agent_id: UserId,
    /// Why.
    pub reason: Option<String>,
}
domain_event!(JourneyCancelled, JourneyCancelled, journey_id);

/// The agent of a booked journey became unavailable. The booking stands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JourneyAgentUnavailable {
    /// Journey.
    pub journey_id: JourneyId,
    /// Agent.
    pub agent_id: UserId,
    /// Booking shipment.
    pub shipment_id: Option<ShipmentId>,
    /// Notice that triggered the notification.
    pub notice_id: String,
    /// Why.
    pub reason: Option<String>,
}
domain_event!(JourneyAgentUnavailable, JourneyAgentUnavailable, journey_id);

/// A journey joined a mission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionJourneyAdded {
    /// Mission.
    pub mission_id: MissionId,
    /// Journey.
    pub journey_id: JourneyId,
}
domain_event!(MissionJourneyAdded, MissionJourneyAdded, mission_id);

/// A journey left a mission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionJourneyRemoved {
    /// Mission.
    pub mission_id: MissionId,
    /// Journey.
    pub journey_id: JourneyId,
}
domain_event!(MissionJourneyRemoved, MissionJourneyRemoved, mission_id);

/// A mission was handed to a new curator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionCuratorReassigned {
    /// Mission.
    pub mission_id: MissionId,
    /// Former curator.
    pub previous_curator_id: UserId,
    /// New curator.
    pub curator_id: UserId,
}
domain_event!(MissionCuratorReassigned, MissionCuratorReassigned, mission_id);

/// An offer was created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferCreated {
    /// Offer.
    pub offer_id: OfferId,
    /// Shipment offered.
    pub shipment_id: ShipmentId,
    /// Target.
    pub bid: Bid,
}
domain_event!(OfferCreated, OfferCreated, offer_id);

/// An offer's bid changed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferUpdated {
    /// Offer.
    pub offer_id: OfferId,
    /// Shipment offered.
    pub shipment_id: ShipmentId,
    /// New target.
    pub bid: Bid,
}
domain_event!(OfferUpdated, OfferUpdated, offer_id);

/// Steps were seeded for an offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferStepsSeeded {
    /// Offer.
    pub offer_id: OfferId,
    /// Shipment.
    pub shipment_id: ShipmentId,
    /// Seeded steps in leg order.
    pub step_ids: Vec<StepId>,
}
domain_event!(OfferStepsSeeded, OfferStepsSeeded, offer_id);

/// Integration event: an agent became unavailable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentUnavailable {
    /// Agent.
    pub agent_id: UserId,
    /// Unique id of this notice.
    pub notice_id: String,
    /// Why.
    pub reason: Option<String>,
}
domain_event!(AgentUnavailable, AgentUnavailable, agent_id);

/// Integration event: a curator account was deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuratorDeleted {
    /// Curator.
    pub curator_id: UserId,
}
domain_event!(CuratorDeleted, CuratorDeleted, curator_id);

// ===== Commands =====

domain_command!(TransitionRequest, TransitionStep, step_id);

/// Book a journey for a shipment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookJourney {
    /// Journey.
    pub journey_id: JourneyId,
    /// Shipment.
    pub shipment_id: ShipmentId,
}
domain_command!(BookJourney, BookJourney, journey_id);

/// Add a journey to a mission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddJourneyToMission {
    /// Mission.
    pub mission_id: MissionId,
    /// Journey.
    pub journey_id: JourneyId,
}
domain_command!(AddJourneyToMission, AddJourneyToMission, mission_id);

/// Remove a journey from a mission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveJourneyFromMission {
    /// Mission.
    pub mission_id: MissionId,
    /// Journey.
    pub journey_id: JourneyId,
}
domain_command!(RemoveJourneyFromMission, RemoveJourneyFromMission, mission_id);

/// Create an offer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOffer {
    /// The offer to create.
    pub offer: Offer,
}
domain_command!(CreateOffer, CreateOffer, offer.id);

/// Replace an offer's bid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOffer {
    /// Offer.
    pub offer_id: OfferId,
    /// New target.
    pub bid: Bid,
}
domain_command!(UpdateOffer, UpdateOffer, offer_id);

// ===== RPC =====

/// `{valid, reason}` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    /// Whether the request would be accepted.
    pub valid: bool,
    /// Why not.
    pub reason: Option<String>,
}

impl Validity {
    /// A positive answer.
    #[must_use]
    pub const fn valid() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }
}

impl RpcReply for Validity {
    fn failure(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// Could this shipment book this journey?
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateJourneyBooking {
    /// Journey.
    pub journey_id: JourneyId,
    /// Shipment.
    pub shipment_id: ShipmentId,
}

impl RpcCall for ValidateJourneyBooking {
    const ACTION: RpcAction = RpcAction::ValidateJourneyBooking;
    type Reply = Validity;

    fn entity_id(&self) -> &str {
        self.journey_id.as_str()
    }
}

/// Would this step accept a transition to `target`?
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateStepTransition {
    /// Step.
    pub step_id: StepId,
    /// Requested state.
    pub target: StepState,
}

impl RpcCall for ValidateStepTransition {
    const ACTION: RpcAction = RpcAction::ValidateStepTransition;
    type Reply = Validity;

    fn entity_id(&self) -> &str {
        self.step_id.as_str()
    }
}

/// Read a shipment's derived status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetShipmentStatus {
    /// Shipment.
    pub shipment_id: ShipmentId,
}

/// `{success, status, error}` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentStatusReply {
    /// Whether the read succeeded.
    pub success: bool,
    /// The status.
    pub status: Option<ShipmentStatus>,
    /// Why it failed.
    pub error: Option<String>,
}

impl RpcReply for ShipmentStatusReply {
    fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            status: None,
            error: Some(reason.into()),
        }
    }
}

impl RpcCall for GetShipmentStatus {
    const ACTION: RpcAction = RpcAction::GetShipmentStatus;
    type Reply = ShipmentStatusReply;

    fn entity_id(&self) -> &str {
        self.shipment_id.as_str()
    }
}

/// How many steps would an offer seed for this shipment?
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewOfferSteps {
    /// Shipment.
    pub shipment_id: ShipmentId,
}

/// `{success, step_count, error}` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPreview {
    /// Whether the preview succeeded.
    pub success: bool,
    /// Number of steps.
    pub step_count: Option<u32>,
    /// Why it failed.
    pub error: Option<String>,
}

impl RpcReply for StepPreview {
    fn failure(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            step_count: None,
            error: Some(reason.into()),
        }
    }
}

impl RpcCall for PreviewOfferSteps {
    const ACTION: RpcAction = RpcAction::PreviewOfferSteps;
    type Reply = StepPreview;

    fn entity_id(&self) -> &str {
        self.shipment_id.as_str()
    }
}
