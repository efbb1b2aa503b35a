//! Queue declarations derived from the routing table.
//!
//! Every event and command queue gets a dead-letter queue bound on the
//! dead-letter exchange under `dlq.{queue}`, and is capped in length and
//! message age. Messages that exhaust their redrives move to an unbound
//! `parked.{queue}`. RPC request queues expire requests at the action's
//! deadline and dead-letter nothing: a late request has no caller left.

use crate::config::{BrokerConfig, RpcConfig};
use courier_core::bus::{Broker, BusError, Exchange, QueueSpec};
use courier_core::routing::{ChannelKind, Route, RoutingTable, dead_letter_queue, parked_queue};

/// Exchange a route is published on.
#[must_use]
pub const fn exchange_for(route: Route) -> Exchange {
    match route.channel() {
        ChannelKind::Event => Exchange::Events,
        ChannelKind::Command => Exchange::Commands,
        ChannelKind::Rpc => Exchange::Rpc,
    }
}

/// The full set of queue declarations.
#[derive(Clone, Debug)]
pub struct Topology {
    queues: Vec<QueueSpec>,
}

impl Topology {
    /// Build declarations for every binding of `table`.
    #[must_use]
    pub fn from_table(table: &RoutingTable, broker: &BrokerConfig, rpc: &RpcConfig) -> Self {
        let mut queues = Vec::new();
        for binding in table.bindings() {
            let name = binding.queue.name();
            let exchange = exchange_for(binding.route);
            let spec = QueueSpec::durable(&name).bind(exchange, binding.route.routing_key());

            match binding.route {
                Route::Rpc(action) => {
                    queues.push(spec.with_message_ttl(rpc.deadline_for(action)));
                }
                Route::Event(_) | Route::Command(_) => {
                    let dlq = dead_letter_queue(&name);
                    queues.push(
                        QueueSpec::durable(parked_queue(&name))
                            .with_max_length(broker.dlq_max_length),
                    );
                    queues.push(
                        QueueSpec::durable(&dlq)
                            .bind(Exchange::DeadLetter, &dlq)
                            .with_max_length(broker.dlq_max_length),
                    );
                    queues.push(
                        spec.with_max_length(broker.queue_max_length)
                            .with_message_ttl(broker.message_ttl)
                            .dead_letter_to(dlq),
                    );
                }
            }
        }
        Self { queues }
    }

    /// All declarations, each parked and dead-letter queue before its main queue.
    #[must_use]
    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    /// Declaration of `name`, if part of the topology.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<&QueueSpec> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Names of the queues that have a dead-letter queue.
    pub fn dead_lettered_queues(&self) -> impl Iterator<Item = &str> {
        self.queues
            .iter()
            .filter(|q| q.dead_letter_routing_key.is_some())
            .map(|q| q.name.as_str())
    }

    /// Declare every queue on `broker`.
    ///
    /// # Errors
    ///
    /// Returns the first [`BusError`] the broker reports.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), BusError> {
        for spec in &self.queues {
            broker.declare_queue(spec.clone()).await?;
        }
        tracing::info!(queues = self.queues.len(), "Topology declared");
        Ok(())
    }
}
