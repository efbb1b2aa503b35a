//! In-process broker with AMQP queue semantics.
//!
//! Used by tests and by single-process deployments. It reproduces the
//! parts of AMQP the coordination core relies on:
//!
//! - topic matching (`*`, `#`) on the events exchange, exact matching on
//!   the direct exchanges, queue-name routing on the default exchange
//! - per-queue `max_length` (oldest message dead-lettered on overflow) and
//!   `message_ttl` (expired messages dead-lettered when next touched)
//! - `nack(requeue = false)` dead-letters to the queue's
//!   `dead_letter_routing_key` with `x-death-*` headers
//! - deliveries dropped unsettled return to the head of their queue,
//!   marked redelivered
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`.

use crate::config::BrokerConfig;
use courier_core::bus::{
    Acknowledger, BoxFuture, Broker, BusError, Delivery, DeliveryStream, Exchange, QueueSpec,
    topic_matches,
};
use courier_core::envelope::{Envelope, headers};
use courier_core::environment::{Clock, SystemClock};
use crate::metrics::DlqMetrics;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::Instant;

struct Stored {
    envelope: Envelope,
    enqueued_at: Instant,
    redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
    notify: Arc<Notify>,
}

struct BoundKey {
    exchange: Exchange,
    routing_key: String,
    queue: String,
}

enum Next {
    Message {
        tag: u64,
        envelope: Envelope,
        redelivered: bool,
    },
    Empty(Arc<Notify>),
}

struct BrokerState {
    queues: HashMap<String, QueueState>,
    bindings: Vec<BoundKey>,
    next_tag: u64,
    clock: Arc<dyn Clock>,
}

impl BrokerState {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            queues: HashMap::new(),
            bindings: Vec::new(),
            next_tag: 0,
            clock,
        }
    }

    fn route(&self, exchange: Exchange, routing_key: &str) -> Vec<String> {
        if exchange == Exchange::Default {
            return if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            };
        }
        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let hit = if exchange.is_topic() {
                topic_matches(&binding.routing_key, routing_key)
            } else {
                binding.routing_key == routing_key
            };
            if hit && !targets.contains(&binding.queue) {
                targets.push(binding.queue.clone());
            }
        }
        targets
    }

    fn enqueue(&mut self, queue: &str, envelope: Envelope, now: Instant) {
        self.expire(queue, now);
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state.ready.push_back(Stored {
            envelope,
            enqueued_at: now,
            redelivered: false,
        });
        state.notify.notify_one();
        let overflow = match state.spec.max_length {
            Some(max) if state.ready.len() > max => state.ready.pop_front(),
            _ => None,
        };
        if let Some(dropped) = overflow {
            self.dead_letter(queue, dropped.envelope, "maxlen", now);
        }
    }

    fn expire(&mut self, queue: &str, now: Instant) {
        let mut expired = Vec::new();
        if let Some(state) = self.queues.get_mut(queue) {
            if let Some(ttl) = state.spec.message_ttl {
                while state
                    .ready
                    .front()
                    .is_some_and(|m| now.duration_since(m.enqueued_at) >= ttl)
                {
                    if let Some(message) = state.ready.pop_front() {
                        expired.push(message);
                    }
                }
            }
        }
        for message in expired {
            self.dead_letter(queue, message.envelope, "expired", now);
        }
    }

    fn dead_letter(&mut self, queue: &str, envelope: Envelope, reason: &'static str, now: Instant) {
        let target = self
            .queues
            .get(queue)
            .and_then(|state| state.spec.dead_letter_routing_key.clone());
        let Some(routing_key) = target else {
            tracing::debug!(queue, reason, topic = %envelope.topic, "Message discarded, queue has no dead-letter target");
            return;
        };

        let count = envelope
            .header(headers::DEATH_COUNT)
            .and_then(|c| c.parse::<u32>().ok())
            .unwrap_or(0)
            + 1;
        let envelope = envelope
            .with_header(headers::DEATH_REASON, reason)
            .with_header(headers::DEATH_QUEUE, queue)
            .with_header(headers::DEATH_COUNT, count.to_string())
            .with_header(headers::DEATH_AT, self.clock.now().to_rfc3339());

        DlqMetrics::record_dead_lettered(queue, reason);
        tracing::warn!(queue, reason, topic = %envelope.topic, dlq = %routing_key, "Message dead-lettered");

        for target in self.route(Exchange::DeadLetter, &routing_key) {
            self.enqueue(&target, envelope.clone(), now);
        }
    }

    fn take(&mut self, queue: &str, now: Instant) -> Result<Next, BusError> {
        if !self.queues.contains_key(queue) {
            return Err(BusError::QueueNotFound(queue.to_string()));
        }
        self.expire(queue, now);
        let tag = self.next_tag + 1;
        let Some(state) = self.queues.get_mut(queue) else {
            return Err(BusError::QueueNotFound(queue.to_string()));
        };
        let Some(message) = state.ready.pop_front() else {
            return Ok(Next::Empty(Arc::clone(&state.notify)));
        };
        let next = Next::Message {
            tag,
            envelope: message.envelope.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(tag, message);
        self.next_tag = tag;
        Ok(next)
    }

    fn settle(&mut self, queue: &str, tag: u64, outcome: Settle) -> Result<(), BusError> {
        let unknown = || BusError::UnknownDelivery {
            queue: queue.to_string(),
            tag,
        };
        let state = self.queues.get_mut(queue).ok_or_else(unknown)?;
        let mut message = state.unacked.remove(&tag).ok_or_else(unknown)?;
        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                message.redelivered = true;
                state.ready.push_front(message);
                state.notify.notify_one();
            }
            Settle::Reject => self.dead_letter(queue, message.envelope, "rejected", Instant::now()),
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    Reject,
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct QueueAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
}

impl Acknowledger for QueueAcker {
    fn ack(&self, tag: u64) -> BoxFuture<'_, Result<(), BusError>> {
        let result = lock(&self.state).settle(&self.queue, tag, Settle::Ack);
        Box::pin(futures::future::ready(result))
    }

    fn nack(&self, tag: u64, requeue: bool) -> BoxFuture<'_, Result<(), BusError>> {
        let outcome = if requeue { Settle::Requeue } else { Settle::Reject };
        let result = lock(&self.state).settle(&self.queue, tag, outcome);
        Box::pin(futures::future::ready(result))
    }

    fn release(&self, tag: u64) {
        // The queue may be gone already (auto-deleted reply queues).
        let _ = lock(&self.state).settle(&self.queue, tag, Settle::Requeue);
    }
}

/// In-process broker.
///
/// Cloning shares the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    config: Arc<BrokerConfig>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl InMemoryBroker {
    /// An empty broker. `config` only supplies exchange names for logs.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(Arc::new(SystemClock)))),
            config: Arc::new(config),
        }
    }

    /// Stamp `x-death-at` from `clock` instead of the system time.
    #[must_use]
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        lock(&self.state).clock = clock;
        self
    }

    /// Ready messages of `queue`, oldest first, without consuming them.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::QueueNotFound`] for undeclared queues.
    pub fn peek(&self, queue: &str) -> Result<Vec<Envelope>, BusError> {
        let mut state = lock(&self.state);
        state.expire(queue, Instant::now());
        state
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))
    }

    /// Whether `queue` is declared.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state).queues.contains_key(queue)
    }

    fn take(&self, queue: &str) -> Result<Next, BusError> {
        lock(&self.state).take(queue, Instant::now())
    }

    fn acker(&self, queue: &str) -> Arc<dyn Acknowledger> {
        Arc::new(QueueAcker {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
        })
    }
}

impl Broker for InMemoryBroker {
    fn declare_queue(&self, spec: QueueSpec) -> BoxFuture<'_, Result<(), BusError>> {
        let mut state = lock(&self.state);
        for binding in &spec.bindings {
            let known = state.bindings.iter().any(|b| {
                b.exchange == binding.exchange
                    && b.routing_key == binding.routing_key
                    && b.queue == spec.name
            });
            if !known {
                state.bindings.push(BoundKey {
                    exchange: binding.exchange,
                    routing_key: binding.routing_key.clone(),
                    queue: spec.name.clone(),
                });
            }
        }
        if state.queues.contains_key(&spec.name) {
            tracing::debug!(queue = %spec.name, "Queue already declared");
        } else {
            tracing::debug!(queue = %spec.name, bindings = spec.bindings.len(), "Queue declared");
            state.queues.insert(
                spec.name.clone(),
                QueueState {
                    spec,
                    ready: VecDeque::new(),
                    unacked: HashMap::new(),
                    notify: Arc::new(Notify::new()),
                },
            );
        }
        Box::pin(futures::future::ready(Ok(())))
    }

    fn delete_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BusError>> {
        let mut state = lock(&self.state);
        state.bindings.retain(|b| b.queue != name);
        if let Some(queue) = state.queues.remove(name) {
            // Wake a parked consumer so its stream observes the deletion.
            queue.notify.notify_waiters();
            queue.notify.notify_one();
            tracing::debug!(queue = name, dropped = queue.ready.len(), "Queue deleted");
        }
        Box::pin(futures::future::ready(Ok(())))
    }

    fn publish<'a>(
        &'a self,
        exchange: Exchange,
        routing_key: &'a str,
        envelope: Envelope,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let targets = state.route(exchange, routing_key);
        if targets.is_empty() {
            tracing::debug!(
                exchange = self.config.exchange_name(exchange),
                routing_key,
                "Unroutable message dropped"
            );
        }
        for queue in targets {
            state.enqueue(&queue, envelope.clone(), now);
        }
        Box::pin(futures::future::ready(Ok(())))
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<DeliveryStream, BusError>> {
        if !self.has_queue(queue) {
            return Box::pin(futures::future::ready(Err(BusError::QueueNotFound(
                queue.to_string(),
            ))));
        }
        let broker = self.clone();
        let queue = queue.to_string();
        let acker = self.acker(&queue);
        let stream: DeliveryStream = Box::pin(async_stream::stream! {
            loop {
                let next = broker.take(&queue);
                match next {
                    Ok(Next::Message { tag, envelope, redelivered }) => {
                        yield Ok(Delivery::new(envelope, tag, redelivered, Arc::clone(&acker)));
                    }
                    Ok(Next::Empty(notify)) => notify.notified().await,
                    Err(error) => {
                        yield Err(error);
                        break;
                    }
                }
            }
        });
        Box::pin(futures::future::ready(Ok(stream)))
    }

    fn fetch<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Option<Delivery>, BusError>> {
        let result = self.take(queue).map(|next| match next {
            Next::Message {
                tag,
                envelope,
                redelivered,
            } => Some(Delivery::new(envelope, tag, redelivered, self.acker(queue))),
            Next::Empty(_) => None,
        });
        Box::pin(futures::future::ready(result))
    }

    fn depth<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<usize, BusError>> {
        let mut state = lock(&self.state);
        state.expire(queue, Instant::now());
        let result = state
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()));
        Box::pin(futures::future::ready(result))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn envelope(topic: &str) -> Envelope {
        Envelope::new(topic, serde_json::json!({ "topic": topic }))
    }

    async fn declare_with_dlq(broker: &InMemoryBroker, name: &str, key: &str) {
        let dlq = format!("dlq.{name}");
        broker
            .declare_queue(QueueSpec::durable(&dlq).bind(Exchange::DeadLetter, &dlq))
            .await
            .unwrap();
        broker
            .declare_queue(
                QueueSpec::durable(name)
                    .bind(Exchange::Events, key)
                    .dead_letter_to(&dlq),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn topic_routing_fans_out() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("a").bind(Exchange::Events, "step.*"))
            .await
            .unwrap();
        broker
            .declare_queue(QueueSpec::durable("b").bind(Exchange::Events, "step.created"))
            .await
            .unwrap();

        broker
            .publish(Exchange::Events, "step.created", envelope("step.created"))
            .await
            .unwrap();

        assert_eq!(broker.depth("a").await.unwrap(), 1);
        assert_eq!(broker.depth("b").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_routing_is_exact() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("c").bind(Exchange::Commands, "book.journey"))
            .await
            .unwrap();
        broker
            .publish(Exchange::Commands, "book.*", envelope("book.*"))
            .await
            .unwrap();
        assert_eq!(broker.depth("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_messages_reach_the_dead_letter_queue() {
        let broker = InMemoryBroker::default();
        declare_with_dlq(&broker, "q", "step.created").await;
        broker
            .publish(Exchange::Events, "step.created", envelope("step.created"))
            .await
            .unwrap();

        let delivery = broker.fetch("q").await.unwrap().unwrap();
        delivery.nack(false).await.unwrap();

        assert_eq!(broker.depth("q").await.unwrap(), 0);
        let dead = broker.peek("dlq.q").unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(headers::DEATH_REASON), Some("rejected"));
        assert_eq!(dead[0].header(headers::DEATH_QUEUE), Some("q"));
        assert_eq!(dead[0].header(headers::DEATH_COUNT), Some("1"));
    }

    #[tokio::test]
    async fn overflow_drops_the_oldest_message() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("dlq.q").bind(Exchange::DeadLetter, "dlq.q"))
            .await
            .unwrap();
        broker
            .declare_queue(
                QueueSpec::durable("q")
                    .bind(Exchange::Events, "#")
                    .with_max_length(2)
                    .dead_letter_to("dlq.q"),
            )
            .await
            .unwrap();

        for topic in ["a.one", "a.two", "a.three"] {
            broker
                .publish(Exchange::Events, topic, envelope(topic))
                .await
                .unwrap();
        }

        let ready: Vec<String> = broker.peek("q").unwrap().into_iter().map(|e| e.topic).collect();
        assert_eq!(ready, vec!["a.two", "a.three"]);
        let dead = broker.peek("dlq.q").unwrap();
        assert_eq!(dead[0].topic, "a.one");
        assert_eq!(dead[0].header(headers::DEATH_REASON), Some("maxlen"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("dlq.q").bind(Exchange::DeadLetter, "dlq.q"))
            .await
            .unwrap();
        broker
            .declare_queue(
                QueueSpec::durable("q")
                    .bind(Exchange::Events, "#")
                    .with_message_ttl(Duration::from_secs(5))
                    .dead_letter_to("dlq.q"),
            )
            .await
            .unwrap();

        broker
            .publish(Exchange::Events, "x.y", envelope("x.y"))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(broker.depth("q").await.unwrap(), 0);
        let dead = broker.peek("dlq.q").unwrap();
        assert_eq!(dead[0].header(headers::DEATH_REASON), Some("expired"));
    }

    #[tokio::test]
    async fn dropped_deliveries_are_redelivered() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("q").bind(Exchange::Events, "#"))
            .await
            .unwrap();
        broker
            .publish(Exchange::Events, "x.y", envelope("x.y"))
            .await
            .unwrap();

        let first = broker.fetch("q").await.unwrap().unwrap();
        assert!(!first.redelivered());
        drop(first);

        let second = broker.fetch("q").await.unwrap().unwrap();
        assert!(second.redelivered());
        second.ack().await.unwrap();
        assert_eq!(broker.depth("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn consumers_wait_for_messages() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::durable("q").bind(Exchange::Commands, "book.journey"))
            .await
            .unwrap();
        let mut stream = broker.consume("q").await.unwrap();

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish(Exchange::Commands, "book.journey", envelope("book.journey"))
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.envelope().topic, "book.journey");
        delivery.ack().await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_queue_ends_its_stream() {
        let broker = InMemoryBroker::default();
        broker
            .declare_queue(QueueSpec::transient("rpc.reply.1"))
            .await
            .unwrap();
        let mut stream = broker.consume("rpc.reply.1").await.unwrap();

        let deleter = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            deleter.delete_queue("rpc.reply.1").await.unwrap();
        });

        let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap();
        assert!(matches!(item, Some(Err(BusError::QueueNotFound(_)))));
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::default();
        broker.declare_queue(QueueSpec::durable("direct")).await.unwrap();
        broker
            .publish(Exchange::Default, "direct", envelope("anything"))
            .await
            .unwrap();
        assert_eq!(broker.depth("direct").await.unwrap(), 1);
    }
}
