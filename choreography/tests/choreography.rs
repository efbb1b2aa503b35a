//! End-to-end choreography over the in-memory broker.
//!
//! Each test builds a coordinator without spawning it and drives the queues
//! with `run_until_idle`, so message order is deterministic.

#![allow(clippy::unwrap_used)]

use courier_choreography::{Coordinator, Stores};
use courier_core::bus::{Broker, Exchange, QueueSpec};
use courier_core::environment::SystemClock;
use courier_core::ids::{CorrelationId, JourneyId, MissionId, OfferId, ShipmentId, StepId, UserId};
use courier_core::messages::{
    AddJourneyToMission, AgentUnavailable, CreateOffer, ShipmentStatusChanged, StepStateChanged,
    UpdateOffer,
};
use courier_core::model::{
    Bid, Journey, JourneyStatus, Mission, Offer, Shipment, ShipmentStatus, Step, StepState,
    TransitionRequest,
};
use courier_core::routing::QueueId;
use courier_runtime::broker::InMemoryBroker;
use courier_runtime::channel::{CommandChannel, EventChannel};
use courier_runtime::config::RedriveConfig;
use courier_runtime::redrive::Redriver;
use courier_testing::fixtures::{journey, journey_offer, mission, shipment};
use courier_testing::{InMemoryEntityStore, LegStepFactory, test_clock};
use std::sync::Arc;

struct World {
    broker: Arc<InMemoryBroker>,
    steps: InMemoryEntityStore<Step>,
    shipments: InMemoryEntityStore<Shipment>,
    journeys: InMemoryEntityStore<Journey>,
    missions: InMemoryEntityStore<Mission>,
    offers: InMemoryEntityStore<Offer>,
}

impl World {
    fn new() -> Self {
        Self {
            broker: Arc::new(InMemoryBroker::default()),
            steps: InMemoryEntityStore::new(),
            shipments: InMemoryEntityStore::new(),
            journeys: InMemoryEntityStore::new(),
            missions: InMemoryEntityStore::new(),
            offers: InMemoryEntityStore::new(),
        }
    }

    fn stores(&self) -> Stores {
        Stores {
            steps: Arc::new(self.steps.clone()),
            shipments: Arc::new(self.shipments.clone()),
            journeys: Arc::new(self.journeys.clone()),
            missions: Arc::new(self.missions.clone()),
            offers: Arc::new(self.offers.clone()),
        }
    }

    async fn coordinator(&self) -> Coordinator {
        Coordinator::builder()
            .broker(self.broker.clone())
            .stores(self.stores())
            .step_factory(Arc::new(LegStepFactory::default()))
            .clock(Arc::new(test_clock()))
            .build()
            .await
            .unwrap()
    }

    /// Declare a side queue collecting every event matching `pattern`.
    async fn watch(&self, name: &str, pattern: &str) {
        self.broker
            .declare_queue(QueueSpec::durable(name).bind(Exchange::Events, pattern))
            .await
            .unwrap();
    }

    fn commands(&self) -> CommandChannel {
        CommandChannel::new(self.broker.clone())
    }

    fn events(&self) -> EventChannel {
        EventChannel::new(self.broker.clone())
    }

    async fn depth(&self, queue: &str) -> usize {
        self.broker.depth(queue).await.unwrap()
    }
}

fn transition(step: &str, target: StepState) -> TransitionRequest {
    TransitionRequest {
        step_id: StepId::new(step),
        target,
        performer_id: UserId::new("agent-1"),
        reason: None,
        idempotency_key: String::new(),
    }
}

const LIFECYCLE: [StepState; 7] = [
    StepState::Committed,
    StepState::Commenced,
    StepState::PickedUp,
    StepState::DroppedOff,
    StepState::Fulfilled,
    StepState::Claimed,
    StepState::Completed,
];

/// Create offer `o-1` of `s-1` on `j-1` and let the choreography settle.
async fn offer_seeded(world: &World, coordinator: &Coordinator) {
    world.shipments.seed(shipment("s-1"));
    world.journeys.seed(journey("j-1", "agent-1"));
    let create = CreateOffer {
        offer: journey_offer("o-1", "s-1", "j-1"),
    };
    world
        .commands()
        .send(&create, "create-o-1", &CorrelationId::generate())
        .await
        .unwrap();
    coordinator.run_until_idle().await.unwrap();
}

#[tokio::test]
async fn offer_is_seeded_and_journey_booked() {
    let world = World::new();
    let coordinator = world.coordinator().await;

    offer_seeded(&world, &coordinator).await;

    let offer = world.offers.entity("o-1").unwrap();
    assert!(offer.seeded);
    assert_eq!(offer.step_count, 2);

    for id in ["o-1:0", "o-1:1"] {
        let step = world.steps.entity(id).unwrap();
        assert_eq!(step.state, StepState::Accepted);
        assert_eq!(step.offer_id, Some(OfferId::new("o-1")));
        assert_eq!(step.journey_id, Some(JourneyId::new("j-1")));
    }

    let shipment = world.shipments.entity("s-1").unwrap();
    assert_eq!(shipment.status, ShipmentStatus::Initialized);
    assert_eq!(shipment.journey_id, Some(JourneyId::new("j-1")));
    assert_eq!(shipment.steps.len(), 2);

    let journey = world.journeys.entity("j-1").unwrap();
    assert_eq!(journey.status, JourneyStatus::Booked);
    assert_eq!(journey.booked_by, Some(ShipmentId::new("s-1")));
}

#[tokio::test]
async fn delivered_shipment_completes_its_journey() {
    let world = World::new();
    world.watch("watch.status", "shipment.status.changed").await;
    let coordinator = world.coordinator().await;
    offer_seeded(&world, &coordinator).await;

    let correlation = CorrelationId::generate();
    for step in ["o-1:0", "o-1:1"] {
        for target in LIFECYCLE {
            let key = format!("{step}:{target}");
            world
                .commands()
                .send(&transition(step, target), &key, &correlation)
                .await
                .unwrap();
        }
    }
    coordinator.run_until_idle().await.unwrap();

    for id in ["o-1:0", "o-1:1"] {
        let step = world.steps.entity(id).unwrap();
        assert_eq!(step.state, StepState::Completed);
        assert_eq!(step.transitions.len(), LIFECYCLE.len());
    }
    assert_eq!(
        world.shipments.entity("s-1").unwrap().status,
        ShipmentStatus::Delivered
    );
    assert_eq!(
        world.journeys.entity("j-1").unwrap().status,
        JourneyStatus::Completed
    );

    let statuses: Vec<ShipmentStatus> = world
        .broker
        .peek("watch.status")
        .unwrap()
        .iter()
        .map(|envelope| envelope.decode::<ShipmentStatusChanged>().unwrap().current)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ShipmentStatus::Initialized,
            ShipmentStatus::InTransit,
            ShipmentStatus::Delivered
        ]
    );
}

#[tokio::test]
async fn redelivered_transition_applies_once() {
    let world = World::new();
    world.watch("watch.steps", "step.state.changed").await;
    let coordinator = world.coordinator().await;
    offer_seeded(&world, &coordinator).await;

    let request = transition("o-1:0", StepState::Committed);
    let correlation = CorrelationId::generate();
    for _ in 0..3 {
        world
            .commands()
            .send(&request, "commit-once", &correlation)
            .await
            .unwrap();
    }
    coordinator.run_until_idle().await.unwrap();

    let step = world.steps.entity("o-1:0").unwrap();
    assert_eq!(step.state, StepState::Committed);
    assert_eq!(step.transitions.len(), 1);
    assert_eq!(world.depth("watch.steps").await, 1);

    let published = world.broker.peek("watch.steps").unwrap();
    let event = published[0].decode::<StepStateChanged>().unwrap();
    assert_eq!(event.idempotency_key, "commit-once");
    assert_eq!(event.steps.len(), 2);
}

#[tokio::test]
async fn illegal_transition_is_dropped_without_side_effects() {
    let world = World::new();
    world.watch("watch.steps", "step.state.changed").await;
    let coordinator = world.coordinator().await;
    offer_seeded(&world, &coordinator).await;

    // ACCEPTED cannot jump to FULFILLED
    world
        .commands()
        .send(
            &transition("o-1:0", StepState::Fulfilled),
            "skip-ahead",
            &CorrelationId::generate(),
        )
        .await
        .unwrap();
    coordinator.run_until_idle().await.unwrap();

    assert_eq!(world.steps.entity("o-1:0").unwrap().state, StepState::Accepted);
    assert_eq!(world.depth("watch.steps").await, 0);
    let dlq = QueueId::StepsTransition.dead_letter_queue();
    assert_eq!(world.depth(&dlq).await, 0);
}

#[tokio::test]
async fn offer_with_empty_bid_is_rejected() {
    let world = World::new();
    world.watch("watch.offers", "offer.#").await;
    let coordinator = world.coordinator().await;
    world.shipments.seed(shipment("s-1"));

    let create = CreateOffer {
        offer: Offer::new(OfferId::new("o-1"), ShipmentId::new("s-1"), Bid::default()),
    };
    world
        .commands()
        .send(&create, "create-empty", &CorrelationId::generate())
        .await
        .unwrap();
    coordinator.run_until_idle().await.unwrap();

    assert!(world.offers.entity("o-1").is_none());
    assert_eq!(world.depth("watch.offers").await, 0);
}

#[tokio::test]
async fn offer_update_to_empty_bid_keeps_previous_bid() {
    let world = World::new();
    let coordinator = world.coordinator().await;
    offer_seeded(&world, &coordinator).await;

    let update = UpdateOffer {
        offer_id: OfferId::new("o-1"),
        bid: Bid::default(),
    };
    world
        .commands()
        .send(&update, "clear-bid", &CorrelationId::generate())
        .await
        .unwrap();
    coordinator.run_until_idle().await.unwrap();

    let offer = world.offers.entity("o-1").unwrap();
    assert_eq!(offer.bid, Bid::journey(JourneyId::new("j-1")));
}

#[tokio::test]
async fn repeated_add_journey_keeps_one_entry() {
    let world = World::new();
    world.watch("watch.missions", "mission.#").await;
    let coordinator = world.coordinator().await;
    world.missions.seed(mission("m-1", "curator-1"));
    world.journeys.seed(journey("j-1", "agent-1"));

    let add = AddJourneyToMission {
        mission_id: MissionId::new("m-1"),
        journey_id: JourneyId::new("j-1"),
    };
    let correlation = CorrelationId::generate();
    for _ in 0..2 {
        world.commands().send(&add, "add-j-1", &correlation).await.unwrap();
    }
    coordinator.run_until_idle().await.unwrap();

    let mission = world.missions.entity("m-1").unwrap();
    assert_eq!(mission.journey_ids, vec![JourneyId::new("j-1")]);
    assert_eq!(world.depth("watch.missions").await, 1);
}

#[tokio::test]
async fn unavailable_agent_cancels_open_journeys_and_flags_booked_ones() {
    let world = World::new();
    world.watch("watch.cancelled", "journey.cancelled").await;
    world.watch("watch.flagged", "journey.agent.unavailable").await;
    let coordinator = world.coordinator().await;

    world.journeys.seed(journey("j-open", "agent-1"));
    world.journeys.seed(Journey {
        status: JourneyStatus::Booked,
        booked_by: Some(ShipmentId::new("s-1")),
        ..journey("j-booked", "agent-1")
    });
    world.journeys.seed(journey("j-other", "agent-2"));

    let notice = AgentUnavailable {
        agent_id: UserId::new("agent-1"),
        notice_id: "notice-1".to_string(),
        reason: Some("sick".to_string()),
    };
    for _ in 0..2 {
        world
            .events()
            .publish(&notice, &CorrelationId::generate())
            .await
            .unwrap();
    }
    coordinator.run_until_idle().await.unwrap();

    assert_eq!(
        world.journeys.entity("j-open").unwrap().status,
        JourneyStatus::Cancelled
    );
    assert_eq!(
        world.journeys.entity("j-booked").unwrap().status,
        JourneyStatus::Booked
    );
    assert_eq!(
        world.journeys.entity("j-other").unwrap().status,
        JourneyStatus::Available
    );
    assert_eq!(world.depth("watch.cancelled").await, 1);
    assert_eq!(world.depth("watch.flagged").await, 1);
}

#[tokio::test]
async fn failed_message_is_dead_lettered_and_redriven_later() {
    let world = World::new();
    let coordinator = world.coordinator().await;
    world.missions.seed(mission("m-1", "curator-1"));

    // Journey not yet known
    let add = AddJourneyToMission {
        mission_id: MissionId::new("m-1"),
        journey_id: JourneyId::new("j-late"),
    };
    world
        .commands()
        .send(&add, "add-j-late", &CorrelationId::generate())
        .await
        .unwrap();
    coordinator.run_until_idle().await.unwrap();

    let queue = QueueId::MissionsAddJourney.name();
    let dlq = QueueId::MissionsAddJourney.dead_letter_queue();
    assert_eq!(world.depth(&queue).await, 0);
    assert_eq!(world.depth(&dlq).await, 1);
    assert!(world.missions.entity("m-1").unwrap().journey_ids.is_empty());

    world.journeys.seed(journey("j-late", "agent-1"));
    let redriver = Redriver::new(
        world.broker.clone(),
        vec![queue.clone()],
        RedriveConfig::default(),
        Arc::new(SystemClock),
    );
    let report = redriver.redrive_once(&queue, 10).await.unwrap();
    assert_eq!(report.redriven, 1);
    coordinator.run_until_idle().await.unwrap();

    assert_eq!(world.depth(&dlq).await, 0);
    assert_eq!(
        world.missions.entity("m-1").unwrap().journey_ids,
        vec![JourneyId::new("j-late")]
    );
}

#[tokio::test]
async fn status_for_unknown_shipment_is_dead_lettered() {
    let world = World::new();
    let coordinator = world.coordinator().await;
    world.steps.seed(courier_testing::fixtures::step(
        "st-1",
        "s-missing",
        0,
        StepState::Accepted,
    ));

    world
        .commands()
        .send(
            &transition("st-1", StepState::Committed),
            "commit-st-1",
            &CorrelationId::generate(),
        )
        .await
        .unwrap();
    coordinator.run_until_idle().await.unwrap();

    assert_eq!(world.steps.entity("st-1").unwrap().state, StepState::Committed);
    let dlq = QueueId::ShipmentsStepStateChanged.dead_letter_queue();
    assert_eq!(world.depth(&dlq).await, 1);
}
