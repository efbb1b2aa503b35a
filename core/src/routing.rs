//! Typed routing table.
//!
//! Every routing key and queue name the coordination core uses is derived
//! from an enum variant through an exhaustive `match`, so a call site can
//! never assemble a key by string concatenation. [`RoutingTable::validate`]
//! is run once at startup to check the naming conventions and the
//! one-handler-per-command rule before any queue is declared.
//!
//! # Conventions
//!
//! | Channel | Routing key | Example |
//! |---|---|---|
//! | Event | `{entity}.{eventType}` | `step.state.changed` |
//! | Command | `{verb}.{entity}` | `book.journey` |
//! | RPC | `rpc.{action}.{entity}` | `rpc.validate.journey.booking` |
//!
//! Queues are named `{entities}.{event|command|rpc}.{verb}.queue`; the
//! dead-letter queue of `q` is `dlq.{q}` and is bound with the same key.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Entity kinds that appear in headers and routing keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    /// A custody leg.
    Step,
    /// A parcel movement.
    Shipment,
    /// An agent-offered transport slot.
    Journey,
    /// A curated bundle of journeys.
    Mission,
    /// A bid attaching a shipment to a mission or journey.
    Offer,
    /// An agent (integration events only).
    Agent,
    /// A mission curator (integration events only).
    Curator,
}

impl EntityType {
    /// Singular lowercase name used in routing keys and headers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Shipment => "shipment",
            Self::Journey => "journey",
            Self::Mission => "mission",
            Self::Offer => "offer",
            Self::Agent => "agent",
            Self::Curator => "curator",
        }
    }

    /// Plural name used as the queue-name prefix.
    #[must_use]
    pub const fn plural(self) -> &'static str {
        match self {
            Self::Step => "steps",
            Self::Shipment => "shipments",
            Self::Journey => "journeys",
            Self::Mission => "missions",
            Self::Offer => "offers",
            Self::Agent => "agents",
            Self::Curator => "curators",
        }
    }

    /// Header carrying the id of an entity of this type (`x-<entity>-id`).
    #[must_use]
    pub fn id_header(self) -> String {
        format!("x-{}-id", self.as_str())
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three channel kinds of the message bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Topic-routed, fire-and-forget, any number of consumers.
    Event,
    /// Direct-routed, exactly one logical handler.
    Command,
    /// Direct-routed request with a reply queue and a deadline.
    Rpc,
}

impl ChannelKind {
    /// Name used in the queue-name convention.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Command => "command",
            Self::Rpc => "rpc",
        }
    }
}

/// Every logical event published or consumed by the coordination core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A step row was created (offer seeding).
    StepCreated,
    /// A step moved to a new state.
    StepStateChanged,
    /// A shipment's derived status changed.
    ShipmentStatusChanged,
    /// An offer attached a mission or journey to a shipment.
    ShipmentOfferAttached,
    /// A journey was booked by a shipment.
    JourneyBooked,
    /// A booked journey was released back to availability.
    JourneyReleased,
    /// A booked journey's shipment was delivered.
    JourneyCompleted,
    /// An available journey was cancelled.
    JourneyCancelled,
    /// The agent of a booked journey became unavailable.
    JourneyAgentUnavailable,
    /// A journey was added to a mission.
    MissionJourneyAdded,
    /// A journey was removed from a mission.
    MissionJourneyRemoved,
    /// A mission's curator was reassigned.
    MissionCuratorReassigned,
    /// An offer was created.
    OfferCreated,
    /// An offer's bid was updated.
    OfferUpdated,
    /// Steps were seeded for an offer.
    OfferStepsSeeded,
    /// Integration event: an agent became unavailable.
    AgentUnavailable,
    /// Integration event: a curator account was deleted.
    CuratorDeleted,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [Self; 17] = [
        Self::StepCreated,
        Self::StepStateChanged,
        Self::ShipmentStatusChanged,
        Self::ShipmentOfferAttached,
        Self::JourneyBooked,
        Self::JourneyReleased,
        Self::JourneyCompleted,
        Self::JourneyCancelled,
        Self::JourneyAgentUnavailable,
        Self::MissionJourneyAdded,
        Self::MissionJourneyRemoved,
        Self::MissionCuratorReassigned,
        Self::OfferCreated,
        Self::OfferUpdated,
        Self::OfferStepsSeeded,
        Self::AgentUnavailable,
        Self::CuratorDeleted,
    ];

    /// Entity the event is about.
    #[must_use]
    pub const fn entity(self) -> EntityType {
        match self {
            Self::StepCreated | Self::StepStateChanged => EntityType::Step,
            Self::ShipmentStatusChanged | Self::ShipmentOfferAttached => EntityType::Shipment,
            Self::JourneyBooked
            | Self::JourneyReleased
            | Self::JourneyCompleted
            | Self::JourneyCancelled
            | Self::JourneyAgentUnavailable => EntityType::Journey,
            Self::MissionJourneyAdded
            | Self::MissionJourneyRemoved
            | Self::MissionCuratorReassigned => EntityType::Mission,
            Self::OfferCreated | Self::OfferUpdated | Self::OfferStepsSeeded => EntityType::Offer,
            Self::AgentUnavailable => EntityType::Agent,
            Self::CuratorDeleted => EntityType::Curator,
        }
    }

    /// Event type carried in the `x-event-type` header.
    #[must_use]
    pub const fn event_type(self) -> &'static str {
        match self {
            Self::StepCreated | Self::OfferCreated => "created",
            Self::StepStateChanged => "state.changed",
            Self::ShipmentStatusChanged => "status.changed",
            Self::ShipmentOfferAttached => "offer.attached",
            Self::JourneyBooked => "booked",
            Self::JourneyReleased => "released",
            Self::JourneyCompleted => "completed",
            Self::JourneyCancelled => "cancelled",
            Self::JourneyAgentUnavailable => "agent.unavailable",
            Self::MissionJourneyAdded => "journey.added",
            Self::MissionJourneyRemoved => "journey.removed",
            Self::MissionCuratorReassigned => "curator.reassigned",
            Self::OfferUpdated => "updated",
            Self::OfferStepsSeeded => "steps.seeded",
            Self::AgentUnavailable => "unavailable",
            Self::CuratorDeleted => "deleted",
        }
    }

    /// Routing key on the events exchange.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::StepCreated => "step.created",
            Self::StepStateChanged => "step.state.changed",
            Self::ShipmentStatusChanged => "shipment.status.changed",
            Self::ShipmentOfferAttached => "shipment.offer.attached",
            Self::JourneyBooked => "journey.booked",
            Self::JourneyReleased => "journey.released",
            Self::JourneyCompleted => "journey.completed",
            Self::JourneyCancelled => "journey.cancelled",
            Self::JourneyAgentUnavailable => "journey.agent.unavailable",
            Self::MissionJourneyAdded => "mission.journey.added",
            Self::MissionJourneyRemoved => "mission.journey.removed",
            Self::MissionCuratorReassigned => "mission.curator.reassigned",
            Self::OfferCreated => "offer.created",
            Self::OfferUpdated => "offer.updated",
            Self::OfferStepsSeeded => "offer.steps.seeded",
            Self::AgentUnavailable => "agent.unavailable",
            Self::CuratorDeleted => "curator.deleted",
        }
    }
}

/// Every command type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Request a step transition.
    TransitionStep,
    /// Book a journey for a shipment.
    BookJourney,
    /// Add a journey to a mission.
    AddJourneyToMission,
    /// Remove a journey from a mission.
    RemoveJourneyFromMission,
    /// Create an offer.
    CreateOffer,
    /// Update an offer's bid.
    UpdateOffer,
}

impl CommandKind {
    /// All command kinds.
    pub const ALL: [Self; 6] = [
        Self::TransitionStep,
        Self::BookJourney,
        Self::AddJourneyToMission,
        Self::RemoveJourneyFromMission,
        Self::CreateOffer,
        Self::UpdateOffer,
    ];

    /// Target entity.
    #[must_use]
    pub const fn entity(self) -> EntityType {
        match self {
            Self::TransitionStep => EntityType::Step,
            Self::BookJourney => EntityType::Journey,
            Self::AddJourneyToMission | Self::RemoveJourneyFromMission => EntityType::Mission,
            Self::CreateOffer | Self::UpdateOffer => EntityType::Offer,
        }
    }

    /// Imperative verb.
    #[must_use]
    pub const fn verb(self) -> &'static str {
        match self {
            Self::TransitionStep => "transition",
            Self::BookJourney => "book",
            Self::AddJourneyToMission => "add-journey",
            Self::RemoveJourneyFromMission => "remove-journey",
            Self::CreateOffer => "create",
            Self::UpdateOffer => "update",
        }
    }

    /// Routing key on the commands exchange.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::TransitionStep => "transition.step",
            Self::BookJourney => "book.journey",
            Self::AddJourneyToMission => "add-journey.mission",
            Self::RemoveJourneyFromMission => "remove-journey.mission",
            Self::CreateOffer => "create.offer",
            Self::UpdateOffer => "update.offer",
        }
    }
}

/// Every RPC action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcAction {
    /// Can this journey be booked by this shipment?
    ValidateJourneyBooking,
    /// Would this step transition be accepted?
    ValidateStepTransition,
    /// Current derived status of a shipment.
    GetShipmentStatus,
    /// How many steps would an offer seed for a shipment?
    PreviewOfferSteps,
}

impl RpcAction {
    /// All RPC actions.
    pub const ALL: [Self; 4] = [
        Self::ValidateJourneyBooking,
        Self::ValidateStepTransition,
        Self::GetShipmentStatus,
        Self::PreviewOfferSteps,
    ];

    /// Entity the action reads.
    #[must_use]
    pub const fn entity(self) -> EntityType {
        match self {
            Self::ValidateJourneyBooking => EntityType::Journey,
            Self::ValidateStepTransition => EntityType::Step,
            Self::GetShipmentStatus => EntityType::Shipment,
            Self::PreviewOfferSteps => EntityType::Offer,
        }
    }

    /// Action name without the `rpc.` prefix; used for metrics labels and
    /// the `x-event-type` header.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ValidateJourneyBooking => "validate.journey.booking",
            Self::ValidateStepTransition => "validate.step.transition",
            Self::GetShipmentStatus => "get.shipment.status",
            Self::PreviewOfferSteps => "preview.offer.steps",
        }
    }

    /// Routing key on the RPC exchange.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::ValidateJourneyBooking => "rpc.validate.journey.booking",
            Self::ValidateStepTransition => "rpc.validate.step.transition",
            Self::GetShipmentStatus => "rpc.get.shipment.status",
            Self::PreviewOfferSteps => "rpc.preview.offer.steps",
        }
    }
}

/// A routed message type on one of the three channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Route {
    /// An event on the topic exchange.
    Event(EventKind),
    /// A command on the direct commands exchange.
    Command(CommandKind),
    /// An RPC request on the direct RPC exchange.
    Rpc(RpcAction),
}

impl Route {
    /// Channel kind of the route.
    #[must_use]
    pub const fn channel(self) -> ChannelKind {
        match self {
            Self::Event(_) => ChannelKind::Event,
            Self::Command(_) => ChannelKind::Command,
            Self::Rpc(_) => ChannelKind::Rpc,
        }
    }

    /// Routing key.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::Event(kind) => kind.routing_key(),
            Self::Command(kind) => kind.routing_key(),
            Self::Rpc(action) => action.routing_key(),
        }
    }
}

/// Every queue the coordination core declares.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Journey booking on `step.created`.
    JourneysStepCreated,
    /// Journey cancellation/notification on `agent.unavailable`.
    JourneysAgentUnavailable,
    /// Journey completion/release on `shipment.status.changed`.
    JourneysShipmentStatusChanged,
    /// `book.journey` command.
    JourneysBook,
    /// `rpc.validate.journey.booking`.
    JourneysValidateBooking,
    /// Curator reassignment on `curator.deleted`.
    MissionsCuratorDeleted,
    /// `add-journey.mission` command.
    MissionsAddJourney,
    /// `remove-journey.mission` command.
    MissionsRemoveJourney,
    /// Step seeding on `offer.created`.
    OffersCreated,
    /// `create.offer` command.
    OffersCreate,
    /// `update.offer` command.
    OffersUpdate,
    /// `rpc.preview.offer.steps`.
    OffersPreviewSteps,
    /// Status aggregation on `step.state.changed`.
    ShipmentsStepStateChanged,
    /// `rpc.get.shipment.status`.
    ShipmentsGetStatus,
    /// `transition.step` command.
    StepsTransition,
    /// `rpc.validate.step.transition`.
    StepsValidateTransition,
    /// Durable queue for an event no core handler consumes, drained by
    /// notification subsystems outside this core.
    Outbound(EventKind),
}

impl QueueId {
    /// Every queue consumed by a handler inside the coordination core.
    pub const CONSUMERS: [Self; 16] = [
        Self::JourneysStepCreated,
        Self::JourneysAgentUnavailable,
        Self::JourneysShipmentStatusChanged,
        Self::JourneysBook,
        Self::JourneysValidateBooking,
        Self::MissionsCuratorDeleted,
        Self::MissionsAddJourney,
        Self::MissionsRemoveJourney,
        Self::OffersCreated,
        Self::OffersCreate,
        Self::OffersUpdate,
        Self::OffersPreviewSteps,
        Self::ShipmentsStepStateChanged,
        Self::ShipmentsGetStatus,
        Self::StepsTransition,
        Self::StepsValidateTransition,
    ];

    /// Queue name.
    #[must_use]
    pub fn name(self) -> String {
        let name = match self {
            Self::JourneysStepCreated => "journeys.event.step-created.queue",
            Self::JourneysAgentUnavailable => "journeys.event.agent-unavailable.queue",
            Self::JourneysShipmentStatusChanged => "journeys.event.shipment-status-changed.queue",
            Self::JourneysBook => "journeys.command.book.queue",
            Self::JourneysValidateBooking => "journeys.rpc.validate-booking.queue",
            Self::MissionsCuratorDeleted => "missions.event.curator-deleted.queue",
            Self::MissionsAddJourney => "missions.command.add-journey.queue",
            Self::MissionsRemoveJourney => "missions.command.remove-journey.queue",
            Self::OffersCreated => "offers.event.created.queue",
            Self::OffersCreate => "offers.command.create.queue",
            Self::OffersUpdate => "offers.command.update.queue",
            Self::OffersPreviewSteps => "offers.rpc.preview-steps.queue",
            Self::ShipmentsStepStateChanged => "shipments.event.step-state-changed.queue",
            Self::ShipmentsGetStatus => "shipments.rpc.get-status.queue",
            Self::StepsTransition => "steps.command.transition.queue",
            Self::StepsValidateTransition => "steps.rpc.validate-transition.queue",
            Self::Outbound(kind) => {
                return format!(
                    "notifications.event.{}.queue",
                    kind.routing_key().replace('.', "-")
                );
            }
        };
        name.to_string()
    }

    /// The route bound to this queue.
    #[must_use]
    pub const fn route(self) -> Route {
        match self {
            Self::JourneysStepCreated => Route::Event(EventKind::StepCreated),
            Self::JourneysAgentUnavailable => Route::Event(EventKind::AgentUnavailable),
            Self::JourneysShipmentStatusChanged => Route::Event(EventKind::ShipmentStatusChanged),
            Self::JourneysBook => Route::Command(CommandKind::BookJourney),
            Self::JourneysValidateBooking => Route::Rpc(RpcAction::ValidateJourneyBooking),
            Self::MissionsCuratorDeleted => Route::Event(EventKind::CuratorDeleted),
            Self::MissionsAddJourney => Route::Command(CommandKind::AddJourneyToMission),
            Self::MissionsRemoveJourney => Route::Command(CommandKind::RemoveJourneyFromMission),
            Self::OffersCreated => Route::Event(EventKind::OfferCreated),
            Self::OffersCreate => Route::Command(CommandKind::CreateOffer),
            Self::OffersUpdate => Route::Command(CommandKind::UpdateOffer),
            Self::OffersPreviewSteps => Route::Rpc(RpcAction::PreviewOfferSteps),
            Self::ShipmentsStepStateChanged => Route::Event(EventKind::StepStateChanged),
            Self::ShipmentsGetStatus => Route::Rpc(RpcAction::GetShipmentStatus),
            Self::StepsTransition => Route::Command(CommandKind::TransitionStep),
            Self::StepsValidateTransition => Route::Rpc(RpcAction::ValidateStepTransition),
            Self::Outbound(kind) => Route::Event(kind),
        }
    }

    /// Whether a handler inside the core drains this queue.
    #[must_use]
    pub const fn is_consumed(self) -> bool {
        !matches!(self, Self::Outbound(_))
    }

    /// Name of this queue's dead-letter queue (also its DLX routing key).
    #[must_use]
    pub fn dead_letter_queue(self) -> String {
        dead_letter_queue(&self.name())
    }

    /// Name of the queue holding this queue's parked messages.
    #[must_use]
    pub fn parked_queue(self) -> String {
        parked_queue(&self.name())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Dead-letter queue name (and DLX routing key) for `queue`.
#[must_use]
pub fn dead_letter_queue(queue: &str) -> String {
    format!("dlq.{queue}")
}

/// Queue that holds messages of `queue` which exhausted their redrives.
#[must_use]
pub fn parked_queue(queue: &str) -> String {
    format!("parked.{queue}")
}

/// Errors found by [`RoutingTable::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// A routing key does not follow its channel's convention.
    #[error("routing key '{key}' is malformed: {reason}")]
    MalformedKey {
        /// Offending key.
        key: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// A queue name does not follow `{entities}.{channel}.{verb}.queue`.
    #[error("queue name '{name}' is malformed: {reason}")]
    MalformedQueueName {
        /// Offending name.
        name: String,
        /// What is wrong with it.
        reason: &'static str,
    },

    /// Two bindings declare the same queue.
    #[error("queue '{0}' is declared twice")]
    DuplicateQueue(String),

    /// A command or RPC key has more than one handler queue.
    #[error("routing key '{0}' has more than one handler queue")]
    DuplicateHandler(&'static str),

    /// A route has no queue bound at all.
    #[error("routing key '{0}' has no bound queue")]
    Unbound(&'static str),
}

/// A queue together with the route bound to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueBinding {
    /// The queue.
    pub queue: QueueId,
    /// The bound route.
    pub route: Route,
}

impl QueueBinding {
    /// Binding of `queue` to its own route.
    #[must_use]
    pub const fn of(queue: QueueId) -> Self {
        Self {
            queue,
            route: queue.route(),
        }
    }
}

/// The complete queue topology of the coordination core.
#[derive(Clone, Debug)]
pub struct RoutingTable {
    bindings: Vec<QueueBinding>,
}

impl RoutingTable {
    /// The standard table: every consumer queue, plus an outbound queue for
    /// each event no core handler consumes.
    #[must_use]
    pub fn standard() -> Self {
        let mut bindings: Vec<QueueBinding> =
            QueueId::CONSUMERS.iter().copied().map(QueueBinding::of).collect();
        for kind in EventKind::ALL {
            let consumed = bindings.iter().any(|b| b.route == Route::Event(kind));
            if !consumed {
                bindings.push(QueueBinding::of(QueueId::Outbound(kind)));
            }
        }
        Self { bindings }
    }

    /// A table from explicit bindings.
    #[must_use]
    pub const fn from_bindings(bindings: Vec<QueueBinding>) -> Self {
        Self { bindings }
    }

    /// All bindings.
    #[must_use]
    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    /// Bindings whose queue is drained by a core handler.
    pub fn consumer_bindings(&self) -> impl Iterator<Item = &QueueBinding> {
        self.bindings.iter().filter(|b| b.queue.is_consumed())
    }

    /// Check naming conventions and handler cardinality.
    ///
    /// # Errors
    ///
    /// Returns the first [`RoutingError`] found.
    pub fn validate(&self) -> Result<(), RoutingError> {
        let mut names = HashSet::new();
        let mut handlers: HashMap<&'static str, usize> = HashMap::new();

        for binding in &self.bindings {
            check_routing_key(binding.route)?;

            let name = binding.queue.name();
            check_queue_name(&name, binding.route.channel())?;
            if !names.insert(name.clone()) {
                return Err(RoutingError::DuplicateQueue(name));
            }

            if binding.route.channel() != ChannelKind::Event {
                let count = handlers.entry(binding.route.routing_key()).or_insert(0);
                *count += 1;
                if *count > 1 {
                    return Err(RoutingError::DuplicateHandler(binding.route.routing_key()));
                }
            }
        }

        let every_route = EventKind::ALL
            .into_iter()
            .map(Route::Event)
            .chain(CommandKind::ALL.into_iter().map(Route::Command))
            .chain(RpcAction::ALL.into_iter().map(Route::Rpc));
        for route in every_route {
            if !self.bindings.iter().any(|b| b.route == route) {
                return Err(RoutingError::Unbound(route.routing_key()));
            }
        }

        Ok(())
    }
}

fn is_key_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn check_routing_key(route: Route) -> Result<(), RoutingError> {
    let key = route.routing_key();
    let malformed = |reason| RoutingError::MalformedKey {
        key: key.to_string(),
        reason,
    };

    if !key.split('.').all(is_key_segment) {
        return Err(malformed("segments must be non-empty lowercase words"));
    }

    let expected = match route {
        Route::Event(kind) => format!("{}.{}", kind.entity(), kind.event_type()),
        Route::Command(kind) => format!("{}.{}", kind.verb(), kind.entity()),
        Route::Rpc(action) => {
            let entity = action.entity().as_str();
            let has_entity = action.name().split('.').any(|segment| segment == entity);
            if !has_entity {
                return Err(malformed("rpc key must name its entity"));
            }
            format!("rpc.{}", action.name())
        }
    };
    if key == expected {
        Ok(())
    } else {
        Err(malformed("key does not follow its channel convention"))
    }
}

fn check_queue_name(name: &str, channel: ChannelKind) -> Result<(), RoutingError> {
    let malformed = |reason| RoutingError::MalformedQueueName {
        name: name.to_string(),
        reason,
    };

    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() != 4 || segments[3] != "queue" {
        return Err(malformed("expected {entities}.{channel}.{verb}.queue"));
    }
    let known_prefix = segments[0] == "notifications"
        || [
            EntityType::Step,
            EntityType::Shipment,
            EntityType::Journey,
            EntityType::Mission,
            EntityType::Offer,
        ]
        .iter()
        .any(|entity| entity.plural() == segments[0]);
    if !known_prefix {
        return Err(malformed("unknown owning entity"));
    }
    if segments[1] != channel.as_str() {
        return Err(malformed("channel segment does not match the bound route"));
    }
    if !is_key_segment(segments[2]) {
        return Err(malformed("verb must be a lowercase word"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_is_valid() {
        assert_eq!(RoutingTable::standard().validate(), Ok(()));
    }

    #[test]
    fn every_event_has_a_bound_queue() {
        let table = RoutingTable::standard();
        for kind in EventKind::ALL {
            assert!(
                table.bindings().iter().any(|b| b.route == Route::Event(kind)),
                "{kind:?} unbound"
            );
        }
    }

    #[test]
    fn outbound_queues_follow_naming() {
        assert_eq!(
            QueueId::Outbound(EventKind::JourneyBooked).name(),
            "notifications.event.journey-booked.queue"
        );
    }

    #[test]
    fn dead_letter_names_use_prefix() {
        assert_eq!(
            QueueId::JourneysBook.dead_letter_queue(),
            "dlq.journeys.command.book.queue"
        );
        assert_eq!(
            QueueId::JourneysBook.parked_queue(),
            "parked.journeys.command.book.queue"
        );
    }

    #[test]
    fn duplicate_command_handler_is_rejected() {
        let mut bindings: Vec<QueueBinding> = RoutingTable::standard().bindings().to_vec();
        bindings.push(QueueBinding {
            queue: QueueId::OffersUpdate,
            route: Route::Command(CommandKind::BookJourney),
        });
        let table = RoutingTable::from_bindings(bindings);
        assert!(matches!(
            table.validate(),
            Err(RoutingError::DuplicateQueue(_) | RoutingError::DuplicateHandler(_))
        ));
    }

    #[test]
    fn channel_mismatch_is_rejected() {
        let table = RoutingTable::from_bindings(vec![QueueBinding {
            queue: QueueId::JourneysBook,
            route: Route::Event(EventKind::StepCreated),
        }]);
        assert!(matches!(
            table.validate(),
            Err(RoutingError::MalformedQueueName { .. })
        ));
    }

    #[test]
    fn missing_command_queue_is_rejected() {
        let bindings = RoutingTable::standard()
            .bindings()
            .iter()
            .copied()
            .filter(|b| b.queue != QueueId::StepsTransition)
            .collect();
        assert_eq!(
            RoutingTable::from_bindings(bindings).validate(),
            Err(RoutingError::Unbound("transition.step"))
        );
    }
}
