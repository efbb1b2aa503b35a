//! Queue consumer with dead-letter discipline.
//!
//! A [`QueueConsumer`] drains one queue, one message at a time, in
//! delivery order, and settles every message according to the handler's
//! result:
//!
//! | Handler result | Settlement | Outcome label |
//! |---|---|---|
//! | `Ok(())` | ack | `ok` |
//! | `Err(Validation)` | ack, logged | `ignored` |
//! | `Err(NotFound \| Transient \| Conflict)` | nack without requeue (DLQ) | `dead_lettered` |
//!
//! Nothing is retried in-process; dead-lettered messages are reprocessed
//! by the [`Redriver`](crate::redrive::Redriver).
//!
//! # Pattern: Consume-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     consume(queue):
//!         for delivery in stream { handle; settle }
//!     if the stream failed or ended:
//!         wait retry_delay and consume again
//! }
//! ```

use crate::metrics::ConsumerMetrics;
use async_trait::async_trait;
use courier_core::bus::{Broker, BusError, Delivery};
use courier_core::envelope::Envelope;
use courier_core::error::{CoordinationError, Disposition};
use courier_core::ids::CorrelationId;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Handles raw envelopes from one queue.
///
/// Implementors must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Process one message.
    ///
    /// # Errors
    ///
    /// Returns a [`CoordinationError`]; its
    /// [`disposition`](CoordinationError::disposition) decides whether the
    /// message is dropped or dead-lettered.
    async fn handle(&self, envelope: &Envelope) -> Result<(), CoordinationError>;
}

/// Metadata of the message being handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageContext {
    /// Correlation id, generated if the producer sent none.
    pub correlation_id: CorrelationId,
    /// Idempotency key of a command.
    pub idempotency_key: Option<String>,
    /// Routing key.
    pub topic: String,
}

impl MessageContext {
    /// Context of `envelope`.
    #[must_use]
    pub fn of(envelope: &Envelope) -> Self {
        Self {
            correlation_id: envelope
                .correlation_id()
                .unwrap_or_else(CorrelationId::generate),
            idempotency_key: envelope.idempotency_key().map(str::to_string),
            topic: envelope.topic.clone(),
        }
    }
}

/// Handles decoded payloads of type `P`.
#[async_trait]
pub trait Handles<P>: Send + Sync + 'static {
    /// Process one payload.
    ///
    /// # Errors
    ///
    /// See [`MessageHandler::handle`].
    async fn handle(&self, payload: P, context: &MessageContext) -> Result<(), CoordinationError>;
}

#[async_trait]
impl<P, H> Handles<P> for Arc<H>
where
    P: Send + 'static,
    H: Handles<P>,
{
    async fn handle(&self, payload: P, context: &MessageContext) -> Result<(), CoordinationError> {
        self.as_ref().handle(payload, context).await
    }
}

/// Adapts a [`Handles<P>`] into a [`MessageHandler`] by decoding the
/// payload first. Undecodable payloads are validation errors and are
/// dropped rather than dead-lettered.
pub struct Decoded<P, H> {
    handler: H,
    _payload: PhantomData<fn() -> P>,
}

impl<P, H> Decoded<P, H> {
    /// Wrap `handler`.
    #[must_use]
    pub const fn new(handler: H) -> Self {
        Self {
            handler,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<P, H> MessageHandler for Decoded<P, H>
where
    P: DeserializeOwned + Send + 'static,
    H: Handles<P>,
{
    async fn handle(&self, envelope: &Envelope) -> Result<(), CoordinationError> {
        let payload: P = envelope.decode()?;
        let context = MessageContext::of(envelope);
        self.handler.handle(payload, &context).await
    }
}

/// Consumer of one queue.
pub struct QueueConsumer {
    queue: String,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
}

impl QueueConsumer {
    /// Create a consumer with the default reconnect delay (5 seconds).
    #[must_use]
    pub fn new(
        queue: impl Into<String>,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            queue: queue.into(),
            broker,
            handler,
            shutdown,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Set the delay before re-consuming after the stream failed or ended.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The consumed queue.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Spawn the consume loop.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Process ready messages until the queue is empty. Returns how many
    /// were processed.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the queue cannot be read.
    pub async fn drain(&self) -> Result<usize, BusError> {
        let mut processed = 0;
        while let Some(delivery) = self.broker.fetch(&self.queue).await? {
            process(&self.queue, self.handler.as_ref(), delivery).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn run(&mut self) {
        info!(queue = %self.queue, "Queue consumer started");

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(queue = %self.queue, "Queue consumer received shutdown signal");
                    break;
                }
                consume_result = self.broker.consume(&self.queue) => {
                    match consume_result {
                        Ok(mut stream) => {
                            if self.process_stream(&mut stream).await {
                                break;
                            }
                            warn!(queue = %self.queue, "Delivery stream ended, reconnecting in {:?}", self.retry_delay);
                        }
                        Err(e) => {
                            error!(
                                queue = %self.queue,
                                error = %e,
                                "Failed to consume queue, retrying in {:?}",
                                self.retry_delay
                            );
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }

        info!(queue = %self.queue, "Queue consumer stopped");
    }

    /// Returns `true` when shutdown was requested.
    async fn process_stream(&mut self, stream: &mut courier_core::bus::DeliveryStream) -> bool {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(queue = %self.queue, "Queue consumer received shutdown signal during processing");
                    return true;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(delivery)) => {
                            process(&self.queue, self.handler.as_ref(), delivery).await;
                        }
                        Some(Err(e)) => {
                            error!(queue = %self.queue, error = %e, "Error receiving delivery");
                            return false;
                        }
                        None => return false,
                    }
                }
            }
        }
    }
}

/// Handle one delivery and settle it.
async fn process(queue: &str, handler: &dyn MessageHandler, delivery: Delivery) {
    let topic = delivery.envelope().topic.clone();
    let result = handler.handle(delivery.envelope()).await;

    let (settled, outcome) = match result {
        Ok(()) => (delivery.ack().await, "ok"),
        Err(e) => match e.disposition() {
            Disposition::Acknowledge => {
                warn!(queue, topic = %topic, error = %e, "Message rejected by validation, dropping");
                (delivery.ack().await, "ignored")
            }
            Disposition::DeadLetter => {
                error!(queue, topic = %topic, kind = e.kind(), error = %e, "Handler failed, dead-lettering");
                (delivery.nack(false).await, "dead_lettered")
            }
        },
    };

    ConsumerMetrics::record(queue, outcome);
    if let Err(e) = settled {
        error!(queue, topic = %topic, error = %e, "Failed to settle delivery");
    }
}
