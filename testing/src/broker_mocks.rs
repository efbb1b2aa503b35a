//! Fault-injecting broker wrapper.

use courier_core::bus::{BoxFuture, Broker, BusError, Delivery, DeliveryStream, Exchange, QueueSpec};
use courier_core::envelope::Envelope;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Broker that forwards to another broker but can be taken offline, or made
/// to refuse the next N publishes.
///
/// # Example
///
/// ```ignore
/// let broker = FlakyBroker::new(Arc::new(InMemoryBroker::default()));
/// broker.fail_next_publishes(1);
/// assert!(broker.publish(Exchange::Events, "x", envelope).await.is_err());
/// ```
pub struct FlakyBroker {
    inner: Arc<dyn Broker>,
    online: AtomicBool,
    failing_publishes: AtomicUsize,
    published: AtomicUsize,
}

impl FlakyBroker {
    /// Wrap `inner`, initially healthy.
    #[must_use]
    pub fn new(inner: Arc<dyn Broker>) -> Self {
        Self {
            inner,
            online: AtomicBool::new(true),
            failing_publishes: AtomicUsize::new(0),
            published: AtomicUsize::new(0),
        }
    }

    /// Take the broker offline: every operation fails with
    /// [`BusError::Connection`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Refuse the next `n` publishes.
    pub fn fail_next_publishes(&self, n: usize) {
        self.failing_publishes.store(n, Ordering::SeqCst);
    }

    /// Number of publishes forwarded to the inner broker.
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), BusError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Connection("broker offline".to_string()))
        }
    }
}

impl std::fmt::Debug for FlakyBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlakyBroker")
            .field("online", &self.online.load(Ordering::SeqCst))
            .field("failing_publishes", &self.failing_publishes.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Broker for FlakyBroker {
    fn declare_queue(&self, spec: QueueSpec) -> BoxFuture<'_, Result<(), BusError>> {
        Box::pin(async move {
            self.check_online()?;
            self.inner.declare_queue(spec).await
        })
    }

    fn delete_queue<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.check_online()?;
            self.inner.delete_queue(name).await
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: Exchange,
        routing_key: &'a str,
        envelope: Envelope,
    ) -> BoxFuture<'a, Result<(), BusError>> {
        Box::pin(async move {
            self.check_online()?;
            let refused = self
                .failing_publishes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(BusError::Publish {
                    routing_key: routing_key.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            self.inner.publish(exchange, routing_key, envelope).await?;
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<DeliveryStream, BusError>> {
        Box::pin(async move {
            self.check_online()?;
            self.inner.consume(queue).await
        })
    }

    fn fetch<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<Option<Delivery>, BusError>> {
        Box::pin(async move {
            self.check_online()?;
            self.inner.fetch(queue).await
        })
    }

    fn depth<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, Result<usize, BusError>> {
        Box::pin(async move {
            self.check_online()?;
            self.inner.depth(queue).await
        })
    }
}
