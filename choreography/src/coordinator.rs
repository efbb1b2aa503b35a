//! Coordinator bootstrap and lifecycle.
//!
//! Wires every choreographer to its queue and manages the consumer tasks:
//!
//! 1. **Build**: validate the configuration and routing table, declare the
//!    queue topology on the broker
//! 2. **Start**: spawn one consumer per consumed queue, plus the redriver
//! 3. **Shutdown**: broadcast the shutdown signal and wait for every task
//!    (10s timeout each)
//!
//! # Example
//!
//! ```rust,ignore
//! let handle = Coordinator::builder()
//!     .config(CourierConfig::from_env())
//!     .broker(broker)
//!     .stores(Stores::in_memory())
//!     .step_factory(factory)
//!     .start()
//!     .await?;
//!
//! let status = handle.rpc().call(&GetShipmentStatus { shipment_id }).await;
//! handle.shutdown().await;
//! ```

use crate::environment::{Environment, Stores};
use crate::journey::JourneyChoreographer;
use crate::mission::MissionChoreographer;
use crate::offer::{OfferChoreographer, OfferService};
use crate::shipment::ShipmentAggregator;
use crate::step_engine::StepEngine;
use courier_core::bus::{Broker, BusError};
use courier_core::environment::{Clock, StepFactory, SystemClock};
use courier_core::ids::UserId;
use courier_core::messages::{
    AddJourneyToMission, AgentUnavailable, BookJourney, CreateOffer, CuratorDeleted,
    GetShipmentStatus, OfferCreated, PreviewOfferSteps, RemoveJourneyFromMission, RpcCall,
    ShipmentStatusChanged, StepCreated, StepStateChanged, UpdateOffer, ValidateJourneyBooking,
    ValidateStepTransition,
};
use courier_core::model::TransitionRequest;
use courier_core::routing::{QueueId, RoutingError, RoutingTable};
use courier_runtime::broker::InMemoryBroker;
use courier_runtime::channel::{CommandChannel, EventChannel};
use courier_runtime::config::{ConfigError, CourierConfig};
use courier_runtime::consumer::{Decoded, Handles, MessageHandler, QueueConsumer};
use courier_runtime::redrive::Redriver;
use courier_runtime::rpc::{RpcClient, RpcEndpoint, RpcHandler};
use courier_runtime::topology::Topology;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// How long [`CoordinatorHandle::shutdown`] waits for each task.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while building the coordinator.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The routing table is inconsistent.
    #[error("invalid routing table: {0}")]
    Routing(#[from] RoutingError),

    /// The topology could not be declared.
    #[error("failed to declare topology: {0}")]
    Topology(#[from] BusError),

    /// No step factory was supplied.
    #[error("a step factory is required")]
    MissingStepFactory,
}

/// Every choreographer, shared by the queue handlers and direct callers.
#[derive(Clone)]
pub struct Services {
    /// Step Lifecycle Engine.
    pub steps: Arc<StepEngine>,
    /// Shipment Status Aggregator.
    pub shipments: Arc<ShipmentAggregator>,
    /// Journey choreographer.
    pub journeys: Arc<JourneyChoreographer>,
    /// Mission choreographer.
    pub missions: Arc<MissionChoreographer>,
    /// Offer create/update service.
    pub offers: Arc<OfferService>,
    /// Offer step seeding.
    pub seeding: Arc<OfferChoreographer>,
}

impl Services {
    /// Build every choreographer over `env`.
    #[must_use]
    pub fn new(env: &Environment, factory: Arc<dyn StepFactory>, system_curator: UserId) -> Self {
        Self {
            steps: Arc::new(StepEngine::new(env)),
            shipments: Arc::new(ShipmentAggregator::new(env)),
            journeys: Arc::new(JourneyChoreographer::new(env)),
            missions: Arc::new(MissionChoreographer::new(env, system_curator)),
            offers: Arc::new(OfferService::new(env)),
            seeding: Arc::new(OfferChoreographer::new(env, factory)),
        }
    }

    /// The handler draining `queue`, or `None` for outbound queues.
    #[must_use]
    pub fn handler_for(
        &self,
        queue: QueueId,
        broker: &Arc<dyn Broker>,
        clock: &Arc<dyn Clock>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let handler = match queue {
            QueueId::JourneysStepCreated => decoded::<StepCreated, _>(&self.journeys),
            QueueId::JourneysAgentUnavailable => decoded::<AgentUnavailable, _>(&self.journeys),
            QueueId::JourneysShipmentStatusChanged => {
                decoded::<ShipmentStatusChanged, _>(&self.journeys)
            }
            QueueId::JourneysBook => decoded::<BookJourney, _>(&self.journeys),
            QueueId::JourneysValidateBooking => {
                endpoint::<ValidateJourneyBooking, _>(&self.journeys, broker, clock)
            }
            QueueId::MissionsCuratorDeleted => decoded::<CuratorDeleted, _>(&self.missions),
            QueueId::MissionsAddJourney => decoded::<AddJourneyToMission, _>(&self.missions),
            QueueId::MissionsRemoveJourney => {
                decoded::<RemoveJourneyFromMission, _>(&self.missions)
            }
            QueueId::OffersCreated => decoded::<OfferCreated, _>(&self.seeding),
            QueueId::OffersCreate => decoded::<CreateOffer, _>(&self.offers),
            QueueId::OffersUpdate => decoded::<UpdateOffer, _>(&self.offers),
            QueueId::OffersPreviewSteps => {
                endpoint::<PreviewOfferSteps, _>(&self.seeding, broker, clock)
            }
            QueueId::ShipmentsStepStateChanged => decoded::<StepStateChanged, _>(&self.shipments),
            QueueId::ShipmentsGetStatus => {
                endpoint::<GetShipmentStatus, _>(&self.shipments, broker, clock)
            }
            QueueId::StepsTransition => decoded::<TransitionRequest, _>(&self.steps),
            QueueId::StepsValidateTransition => {
                endpoint::<ValidateStepTransition, _>(&self.steps, broker, clock)
            }
            QueueId::Outbound(_) => return None,
        };
        Some(handler)
    }
}

fn decoded<P, H>(handler: &Arc<H>) -> Arc<dyn MessageHandler>
where
    P: DeserializeOwned + Send + 'static,
    H: Handles<P>,
{
    Arc::new(Decoded::<P, Arc<H>>::new(Arc::clone(handler)))
}

fn endpoint<C, H>(
    handler: &Arc<H>,
    broker: &Arc<dyn Broker>,
    clock: &Arc<dyn Clock>,
) -> Arc<dyn MessageHandler>
where
    C: RpcCall,
    H: RpcHandler<C>,
{
    Arc::new(RpcEndpoint::<C, Arc<H>>::new(
        Arc::clone(handler),
        Arc::clone(broker),
        Arc::clone(clock),
    ))
}

/// Builder for a [`Coordinator`].
///
/// Everything but the step factory has a default: default configuration,
/// an in-memory broker and stores, and the system clock.
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: Option<CourierConfig>,
    broker: Option<Arc<dyn Broker>>,
    stores: Option<Stores>,
    factory: Option<Arc<dyn StepFactory>>,
    clock: Option<Arc<dyn Clock>>,
    table: Option<RoutingTable>,
}

impl CoordinatorBuilder {
    /// Use `config`.
    #[must_use]
    pub fn config(mut self, config: CourierConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use `broker`.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Use `stores`.
    #[must_use]
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Derive offer legs with `factory`.
    #[must_use]
    pub fn step_factory(mut self, factory: Arc<dyn StepFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Use `clock`.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Replace the standard routing table.
    #[must_use]
    pub fn routing_table(mut self, table: RoutingTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Validate and declare the topology.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError`] if the configuration or routing table
    /// is invalid, the step factory is missing, or the broker refuses a
    /// declaration.
    pub async fn build(self) -> Result<Coordinator, CoordinatorError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let table = self.table.unwrap_or_else(RoutingTable::standard);
        table.validate()?;
        let factory = self.factory.ok_or(CoordinatorError::MissingStepFactory)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let broker = self.broker.unwrap_or_else(|| {
            Arc::new(InMemoryBroker::new(config.broker.clone()).with_clock(Arc::clone(&clock)))
        });
        let topology = Topology::from_table(&table, &config.broker, &config.rpc);
        topology.declare(broker.as_ref()).await?;

        let env = Environment {
            stores: self.stores.unwrap_or_else(Stores::in_memory),
            broker,
            clock,
            conflict_policy: config.consumer.conflict_policy(),
        };
        let services = Services::new(
            &env,
            factory,
            UserId::new(config.choreography.system_curator_id.clone()),
        );
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Coordinator {
            config,
            table,
            topology,
            env,
            services,
            shutdown_tx,
        })
    }

    /// Build, then start every consumer.
    ///
    /// # Errors
    ///
    /// See [`CoordinatorBuilder::build`].
    pub async fn start(self) -> Result<CoordinatorHandle, CoordinatorError> {
        Ok(self.build().await?.start())
    }
}

/// A declared but not yet running coordinator.
pub struct Coordinator {
    config: CourierConfig,
    table: RoutingTable,
    topology: Topology,
    env: Environment,
    services: Services,
    shutdown_tx: broadcast::Sender<()>,
}

impl Coordinator {
    /// Start building a coordinator.
    #[must_use]
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// The choreographers.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// The injected environment.
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.env
    }

    /// One consumer per consumed queue.
    #[must_use]
    pub fn consumers(&self) -> Vec<QueueConsumer> {
        self.table
            .consumer_bindings()
            .filter_map(|binding| {
                let handler =
                    self.services
                        .handler_for(binding.queue, &self.env.broker, &self.env.clock)?;
                Some(
                    QueueConsumer::new(
                        binding.queue.name(),
                        Arc::clone(&self.env.broker),
                        handler,
                        self.shutdown_tx.subscribe(),
                    )
                    .with_retry_delay(self.config.consumer.retry_delay),
                )
            })
            .collect()
    }

    /// Process ready messages on every consumed queue until a full pass
    /// finds nothing. Returns how many messages were processed.
    ///
    /// RPC requests are only answered if their caller runs concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if a queue cannot be read.
    pub async fn run_until_idle(&self) -> Result<usize, BusError> {
        let consumers = self.consumers();
        let mut total = 0;
        loop {
            let mut pass = 0;
            for consumer in &consumers {
                pass += consumer.drain().await?;
            }
            if pass == 0 {
                return Ok(total);
            }
            total += pass;
        }
    }

    /// Spawn every consumer and, if enabled, the redriver.
    #[must_use]
    pub fn start(self) -> CoordinatorHandle {
        let consumers = self.consumers();
        info!(consumer_count = consumers.len(), "Starting queue consumers");
        let mut tasks: Vec<tokio::task::JoinHandle<()>> =
            consumers.into_iter().map(QueueConsumer::spawn).collect();

        if self.config.redrive.enabled {
            let queues = self
                .topology
                .dead_lettered_queues()
                .map(str::to_string)
                .collect();
            let redriver = Redriver::new(
                Arc::clone(&self.env.broker),
                queues,
                self.config.redrive.clone(),
                Arc::clone(&self.env.clock),
            );
            tasks.push(redriver.spawn(self.shutdown_tx.subscribe()));
        }

        let rpc = RpcClient::new(
            Arc::clone(&self.env.broker),
            self.config.rpc.clone(),
            Arc::clone(&self.env.clock),
        );
        CoordinatorHandle {
            events: EventChannel::new(Arc::clone(&self.env.broker)),
            commands: CommandChannel::new(Arc::clone(&self.env.broker)),
            rpc,
            services: self.services,
            env: self.env,
            shutdown_tx: self.shutdown_tx,
            tasks,
        }
    }
}

/// A running coordinator.
pub struct CoordinatorHandle {
    events: EventChannel,
    commands: CommandChannel,
    rpc: RpcClient,
    services: Services,
    env: Environment,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl CoordinatorHandle {
    /// Event publisher.
    #[must_use]
    pub const fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Command sender.
    #[must_use]
    pub const fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    /// RPC client.
    #[must_use]
    pub const fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// The choreographers.
    #[must_use]
    pub const fn services(&self) -> &Services {
        &self.services
    }

    /// The injected environment.
    #[must_use]
    pub const fn environment(&self) -> &Environment {
        &self.env
    }

    /// Number of running background tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) {
        info!("Shutting down coordinator");
        if self.shutdown_tx.send(()).is_err() {
            warn!("No task was listening for the shutdown signal");
        }

        for (idx, handle) in self.tasks.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = idx, error = %e, "Task failed"),
                Err(_) => warn!(task = idx, "Task shutdown timed out"),
            }
        }
        info!("Coordinator stopped");
    }
}
