//! Typed event and command channels.
//!
//! Producers publish through these instead of the raw [`Broker`] so the
//! routing key always comes from the payload type. Publishing returns a
//! `Result`; there is no producer-side retry and the caller decides what a
//! failed publish means for it.

use crate::metrics::BusMetrics;
use courier_core::bus::{Broker, BusError, Exchange};
use courier_core::envelope::Envelope;
use courier_core::ids::CorrelationId;
use courier_core::messages::{DomainCommand, DomainEvent};
use courier_core::store::Outgoing;
use std::sync::Arc;

/// Publish `envelope` under its own topic and record the outcome.
///
/// # Errors
///
/// Returns the broker's [`BusError`].
pub async fn publish_envelope(
    broker: &dyn Broker,
    exchange: Exchange,
    envelope: Envelope,
) -> Result<(), BusError> {
    let routing_key = envelope.topic.clone();
    publish_routed(broker, exchange, &routing_key, envelope).await
}

/// Publish `envelope` with an explicit routing key, e.g. a queue name on
/// the default exchange, and record the outcome.
///
/// # Errors
///
/// Returns the broker's [`BusError`].
pub async fn publish_routed(
    broker: &dyn Broker,
    exchange: Exchange,
    routing_key: &str,
    envelope: Envelope,
) -> Result<(), BusError> {
    let label = exchange_label(exchange);
    match broker.publish(exchange, routing_key, envelope).await {
        Ok(()) => {
            BusMetrics::record_publish(label);
            tracing::debug!(exchange = label, routing_key, "Published");
            Ok(())
        }
        Err(e) => {
            BusMetrics::record_publish_failure(label);
            tracing::warn!(exchange = label, routing_key, error = %e, "Publish failed");
            Err(e)
        }
    }
}

/// Publish a decided message on its exchange.
///
/// # Errors
///
/// Returns the broker's [`BusError`].
pub async fn publish_outgoing(broker: &dyn Broker, outgoing: &Outgoing) -> Result<(), BusError> {
    let exchange = match outgoing {
        Outgoing::Event(_) => Exchange::Events,
        Outgoing::Command(_) => Exchange::Commands,
    };
    publish_envelope(broker, exchange, outgoing.envelope().clone()).await
}

const fn exchange_label(exchange: Exchange) -> &'static str {
    match exchange {
        Exchange::Events => "events",
        Exchange::Commands => "commands",
        Exchange::Rpc => "rpc",
        Exchange::DeadLetter => "dead-letter",
        Exchange::Default => "default",
    }
}

/// Fire-and-forget event publisher.
#[derive(Clone)]
pub struct EventChannel {
    broker: Arc<dyn Broker>,
}

impl EventChannel {
    /// Create a channel over `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Publish `event` on the events exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if encoding fails or the broker refuses it.
    pub async fn publish<E: DomainEvent>(
        &self,
        event: &E,
        correlation: &CorrelationId,
    ) -> Result<(), BusError> {
        let envelope = Envelope::event(event, correlation)?;
        publish_envelope(self.broker.as_ref(), Exchange::Events, envelope).await
    }
}

/// Directed command sender.
#[derive(Clone)]
pub struct CommandChannel {
    broker: Arc<dyn Broker>,
}

impl CommandChannel {
    /// Create a channel over `broker`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Send `command` with a caller-supplied idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if encoding fails or the broker refuses it.
    pub async fn send<C: DomainCommand>(
        &self,
        command: &C,
        idempotency_key: &str,
        correlation: &CorrelationId,
    ) -> Result<(), BusError> {
        let envelope = Envelope::command(command, idempotency_key, correlation)?;
        publish_envelope(self.broker.as_ref(), Exchange::Commands, envelope).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use courier_core::bus::QueueSpec;
    use courier_core::ids::{JourneyId, ShipmentId, UserId};
    use courier_core::messages::{BookJourney, JourneyBooked};

    #[tokio::test]
    async fn events_are_routed_by_type() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("q").bind(Exchange::Events, "journey.booked"))
            .await
            .unwrap();
        let channel = EventChannel::new(Arc::new(broker.clone()));

        channel
            .publish(
                &JourneyBooked {
                    journey_id: JourneyId::new("j-1"),
                    shipment_id: ShipmentId::new("s-1"),
                    agent_id: UserId::new("a-1"),
                },
                &CorrelationId::new("c-1"),
            )
            .await
            .unwrap();

        let queued = broker.peek("q").unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].topic, "journey.booked");
    }

    #[tokio::test]
    async fn commands_carry_their_idempotency_key() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("q").bind(Exchange::Commands, "book.journey"))
            .await
            .unwrap();
        let channel = CommandChannel::new(Arc::new(broker.clone()));

        channel
            .send(
                &BookJourney {
                    journey_id: JourneyId::new("j-1"),
                    shipment_id: ShipmentId::new("s-1"),
                },
                "book-1",
                &CorrelationId::new("c-1"),
            )
            .await
            .unwrap();

        let queued = broker.peek("q").unwrap();
        assert_eq!(queued[0].idempotency_key(), Some("book-1"));
    }
}
