//! Message broker contract.
//!
//! The coordination core talks to an AMQP-style broker with five exchanges:
//!
//! ```text
//!   events (topic) ──┐
//!   commands (direct)├──► queue ──► consumer ──► ack
//!   rpc (direct) ────┘      │                 └─► nack(requeue=false)
//!   default (queue name)    │                          │
//!                           └── overflow / expiry ─────┤
//!                                                      ▼
//!                                   dead-letter exchange ──► dlq.{queue}
//! ```
//!
//! Every queue is declared with a [`QueueSpec`] capping its length and
//! message age; the broker dead-letters anything rejected, dropped for
//! length or expired. Delivery is at-least-once: consumers must be
//! idempotent.
//!
//! # Dyn Compatibility
//!
//! Methods return `Pin<Box<dyn Future>>` instead of using `async fn` so the
//! broker can be shared as `Arc<dyn Broker>` across consumers and runners.

use crate::envelope::Envelope;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed future returned by the broker and store contracts.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The broker is unreachable.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Publishing a message failed.
    #[error("Publish failed for routing key '{routing_key}': {reason}")]
    Publish {
        /// Routing key of the message.
        routing_key: String,
        /// Reason for failure.
        reason: String,
    },

    /// Consuming from a queue failed.
    #[error("Consume failed for queue '{queue}': {reason}")]
    Consume {
        /// Queue.
        queue: String,
        /// Reason for failure.
        reason: String,
    },

    /// The queue has not been declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A delivery was acknowledged twice or after its queue was deleted.
    #[error("Unknown delivery tag {tag} on queue '{queue}'")]
    UnknownDelivery {
        /// Queue.
        queue: String,
        /// Delivery tag.
        tag: u64,
    },

    /// A payload could not be encoded or decoded.
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Logical exchanges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Exchange {
    /// Topic exchange for events.
    Events,
    /// Direct exchange for commands.
    Commands,
    /// Direct exchange for RPC requests.
    Rpc,
    /// Dead-letter exchange (direct).
    DeadLetter,
    /// Default exchange: the routing key is the queue name.
    Default,
}

impl Exchange {
    /// Whether routing keys are matched as topic patterns.
    #[must_use]
    pub const fn is_topic(self) -> bool {
        matches!(self, Self::Events)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Events => "events",
            Self::Commands => "commands",
            Self::Rpc => "rpc",
            Self::DeadLetter => "dead-letter",
            Self::Default => "default",
        })
    }
}

/// A binding of a queue to an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    /// Exchange.
    pub exchange: Exchange,
    /// Routing key, or a topic pattern on [`Exchange::Events`].
    pub routing_key: String,
}

/// Declaration of a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name.
    pub name: String,
    /// Bindings.
    pub bindings: Vec<Binding>,
    /// Survives broker restarts.
    pub durable: bool,
    /// Deleted when its consumer goes away.
    pub auto_delete: bool,
    /// Maximum ready messages; the oldest is dead-lettered on overflow.
    pub max_length: Option<usize>,
    /// Maximum message age; older messages are dead-lettered.
    pub message_ttl: Option<Duration>,
    /// Routing key used on the dead-letter exchange; `None` discards.
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    /// A durable queue with no limits and no bindings.
    #[must_use]
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
            durable: true,
            auto_delete: false,
            max_length: None,
            message_ttl: None,
            dead_letter_routing_key: None,
        }
    }

    /// A transient, auto-deleted queue (RPC reply queues).
    #[must_use]
    pub fn transient(name: impl Into<String>) -> Self {
        Self {
            durable: false,
            auto_delete: true,
            ..Self::durable(name)
        }
    }

    /// Bind to `exchange` with `routing_key`.
    #[must_use]
    pub fn bind(mut self, exchange: Exchange, routing_key: impl Into<String>) -> Self {
        self.bindings.push(Binding {
            exchange,
            routing_key: routing_key.into(),
        });
        self
    }

    /// Cap the number of ready messages.
    #[must_use]
    pub const fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    /// Expire messages older than `ttl`.
    #[must_use]
    pub const fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Dead-letter with `routing_key` on the dead-letter exchange.
    #[must_use]
    pub fn dead_letter_to(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }
}

/// Settles deliveries on the broker.
pub trait Acknowledger: Send + Sync {
    /// Acknowledge: the message is done.
    fn ack(&self, tag: u64) -> BoxFuture<'_, Result<(), BusError>>;

    /// Reject. With `requeue` the message returns to the head of its queue,
    /// otherwise it is dead-lettered.
    fn nack(&self, tag: u64, requeue: bool) -> BoxFuture<'_, Result<(), BusError>>;

    /// Return an unsettled delivery to its queue; called when a [`Delivery`]
    /// is dropped without being settled.
    fn release(&self, _tag: u64) {}
}

/// A message handed to a consumer.
///
/// Must be settled with [`Delivery::ack`] or [`Delivery::nack`]; a delivery
/// dropped unsettled is returned to its queue marked redelivered.
pub struct Delivery {
    envelope: Envelope,
    tag: u64,
    redelivered: bool,
    acker: Arc<dyn Acknowledger>,
    settled: bool,
}

impl Delivery {
    /// Wrap a message received from `acker`'s queue.
    #[must_use]
    pub fn new(envelope: Envelope, tag: u64, redelivered: bool, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            tag,
            redelivered,
            acker,
            settled: false,
        }
    }

    /// The message.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Broker-assigned delivery tag.
    #[must_use]
    pub const fn tag(&self) -> u64 {
        self.tag
    }

    /// Whether this message was delivered before.
    #[must_use]
    pub const fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker refuses the acknowledgement.
    pub async fn ack(mut self) -> Result<(), BusError> {
        self.settled = true;
        self.acker.ack(self.tag).await
    }

    /// Reject; see [`Acknowledger::nack`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker refuses the rejection.
    pub async fn nack(mut self, requeue: bool) -> Result<(), BusError> {
        self.settled = true;
        self.acker.nack(self.tag, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.envelope.topic)
            .field("tag", &self.tag)
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if !self.settled {
            self.acker.release(self.tag);
        }
    }
}

/// Stream of deliveries from one queue.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BusError>> + Send>>;

/// An AMQP-style message broker.
pub trait Broker: Send + Sync {
    /// Declare a queue and its bindings. Re-declaring is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker is unreachable.
    fn declare_queue(&self, spec: QueueSpec) -> BoxFuture<'_, Result<(), BusError>>;

    /// Delete a queue, discarding its messages and bindings.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker is unreachable.
    fn delete_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BusError>>;

    /// Publish to `exchange` with `routing_key`.
    ///
    /// Unroutable messages are dropped silently, as AMQP does without the
    /// mandatory flag.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the broker did not accept the message.
    fn publish<'a>(
        &'a self,
        exchange: Exchange,
        routing_key: &'a str,
        envelope: Envelope,
    ) -> BoxFuture<'a, Result<(), BusError>>;

    /// Consume a queue. Deliveries arrive in queue order.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::QueueNotFound`] for undeclared queues.
    fn consume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<DeliveryStream, BusError>>;

    /// Pull a single message, if one is ready.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::QueueNotFound`] for undeclared queues.
    fn fetch<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Option<Delivery>, BusError>>;

    /// Number of ready messages.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::QueueNotFound`] for undeclared queues.
    fn depth<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<usize, BusError>>;
}

/// Whether `routing_key` matches the topic `pattern`.
///
/// Words are separated by `.`; `*` matches exactly one word, `#` matches
/// zero or more words.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&word, rest)) => match key.split_first() {
                Some((&first, key_rest)) => (word == "*" || word == first) && matches(rest, key_rest),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}
