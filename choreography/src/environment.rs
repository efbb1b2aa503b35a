//! Collaborators shared by every choreographer.

use courier_core::bus::Broker;
use courier_core::environment::Clock;
use courier_core::model::{Journey, Mission, Offer, Shipment, Step};
use courier_core::store::{Entity, EntityStore};
use courier_runtime::retry::RetryPolicy;
use courier_runtime::runner::Runner;
use courier_testing::InMemoryEntityStore;
use std::sync::Arc;

/// One store per entity type.
#[derive(Clone)]
pub struct Stores {
    /// Steps.
    pub steps: Arc<dyn EntityStore<Step>>,
    /// Shipments.
    pub shipments: Arc<dyn EntityStore<Shipment>>,
    /// Journeys.
    pub journeys: Arc<dyn EntityStore<Journey>>,
    /// Missions.
    pub missions: Arc<dyn EntityStore<Mission>>,
    /// Offers.
    pub offers: Arc<dyn EntityStore<Offer>>,
}

impl Stores {
    /// Fresh in-memory stores.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            steps: Arc::new(InMemoryEntityStore::new()),
            shipments: Arc::new(InMemoryEntityStore::new()),
            journeys: Arc::new(InMemoryEntityStore::new()),
            missions: Arc::new(InMemoryEntityStore::new()),
            offers: Arc::new(InMemoryEntityStore::new()),
        }
    }
}

/// Injected dependencies of the choreographers.
///
/// Built once at start-up and cloned into each service; nothing here is
/// global.
#[derive(Clone)]
pub struct Environment {
    /// Entity stores.
    pub stores: Stores,
    /// Broker used for publishing.
    pub broker: Arc<dyn Broker>,
    /// Time source for transition records and RPC deadlines.
    pub clock: Arc<dyn Clock>,
    /// Re-decide budget on optimistic-concurrency conflicts.
    pub conflict_policy: RetryPolicy,
}

impl Environment {
    /// Runner over `store`.
    #[must_use]
    pub fn runner<T: Entity>(&self, store: &Arc<dyn EntityStore<T>>) -> Runner<T> {
        Runner::new(
            Arc::clone(store),
            Arc::clone(&self.broker),
            Arc::clone(&self.clock),
            self.conflict_policy.clone(),
        )
    }
}
