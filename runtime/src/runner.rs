//! Thin runner executing pure decisions against a store and the broker.
//!
//! Choreographer handlers are pure functions of a message and the current
//! entity snapshot, returning a [`Decision`]. The runner does the I/O:
//!
//! 1. load the record
//! 2. if a previous run left messages in the record's outbox, publish them
//!    and clear the outbox
//! 3. evaluate the decision
//! 4. write the next state together with the emitted messages as the new
//!    outbox, compare-and-set on the version that was read
//! 5. publish the outbox and clear it
//!
//! A crash between 4 and 5 leaves the messages in the outbox, so they are
//! published by the next run for the same entity. A redelivered message
//! finds the state already changed and decides a no-op, so nothing is
//! emitted twice. On a version conflict the whole sequence is retried with
//! a fresh read, up to the configured conflict budget.

use crate::channel::publish_outgoing;
use crate::metrics::DomainMetrics;
use crate::retry::{RetryPolicy, retry_if};
use courier_core::bus::Broker;
use courier_core::decision::Decision;
use courier_core::environment::Clock;
use courier_core::error::CoordinationError;
use courier_core::store::{Entity, EntityStore, Outgoing, Record};
use std::sync::Arc;

/// Result of [`Runner::apply`].
#[derive(Clone, Debug, PartialEq)]
pub struct Applied<T> {
    /// Record before the decision.
    pub previous: Option<Record<T>>,
    /// Record after the decision.
    pub current: Option<Record<T>>,
    /// Whether a new state was stored.
    pub changed: bool,
}

impl<T> Applied<T> {
    /// The entity after the decision.
    #[must_use]
    pub fn entity(&self) -> Option<&T> {
        self.current.as_ref().map(|record| &record.entity)
    }
}

/// Runs decisions for one entity type.
pub struct Runner<T: Entity> {
    store: Arc<dyn EntityStore<T>>,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl<T: Entity> Clone for Runner<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
            policy: self.policy.clone(),
        }
    }
}

impl<T: Entity> Runner<T> {
    /// Create a runner. `policy` bounds the re-decide loop on conflicts.
    #[must_use]
    pub fn new(
        store: Arc<dyn EntityStore<T>>,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            policy,
        }
    }

    /// The underlying store, for reads.
    #[must_use]
    pub fn store(&self) -> &dyn EntityStore<T> {
        self.store.as_ref()
    }

    /// Load a record.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Transient`] if the store is unavailable.
    pub async fn load(&self, id: &str) -> Result<Option<Record<T>>, CoordinationError> {
        Ok(self.store.get(id).await?)
    }

    /// Load a record that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::NotFound`] if it does not.
    pub async fn require(&self, id: &str) -> Result<Record<T>, CoordinationError> {
        self.load(id)
            .await?
            .ok_or_else(|| CoordinationError::not_found(T::TYPE, id))
    }

    /// Decide and apply for entity `id`, retrying on version conflicts.
    ///
    /// # Errors
    ///
    /// Returns the decision's error, [`CoordinationError::Conflict`] when
    /// the conflict budget is exhausted, or
    /// [`CoordinationError::Transient`] if the store or broker failed.
    pub async fn apply<F>(&self, id: &str, decide: F) -> Result<Applied<T>, CoordinationError>
    where
        F: Fn(Option<&Record<T>>) -> Result<Decision<T>, CoordinationError> + Sync,
    {
        retry_if(
            &self.policy,
            T::TYPE.as_str(),
            || self.apply_once(id, &decide),
            |e: &CoordinationError| {
                if e.is_conflict() {
                    DomainMetrics::record_store_conflict(T::TYPE);
                }
                e.is_conflict()
            },
        )
        .await
    }

    async fn apply_once<F>(&self, id: &str, decide: &F) -> Result<Applied<T>, CoordinationError>
    where
        F: Fn(Option<&Record<T>>) -> Result<Decision<T>, CoordinationError> + Sync,
    {
        let mut record = self.store.get(id).await?;
        if let Some(pending) = record.take() {
            record = Some(self.flush(pending).await?);
        }

        let Decision { next, emit } = decide(record.as_ref())?;
        let emit: Vec<Outgoing> = emit.into_vec();

        let Some(next) = next else {
            for outgoing in &emit {
                publish_outgoing(self.broker.as_ref(), outgoing).await?;
            }
            return Ok(Applied {
                previous: record.clone(),
                current: record,
                changed: false,
            });
        };

        let expected = record.as_ref().map(|r| r.version);
        let stored = self.store.put(next, emit, expected, self.clock.now()).await?;
        tracing::debug!(
            entity = %T::TYPE,
            id,
            version = stored.version,
            outbox = stored.outbox.len(),
            "Stored"
        );
        let current = self.flush(stored).await?;

        Ok(Applied {
            previous: record,
            current: Some(current),
            changed: true,
        })
    }

    /// Publish a record's outbox and clear it.
    async fn flush(&self, record: Record<T>) -> Result<Record<T>, CoordinationError> {
        if record.outbox.is_empty() {
            return Ok(record);
        }
        for outgoing in &record.outbox {
            publish_outgoing(self.broker.as_ref(), outgoing).await?;
        }

        // Everything is out. A failed clear only means the next run
        // publishes the same messages again.
        match self
            .store
            .put(
                record.entity.clone(),
                Vec::new(),
                Some(record.version),
                self.clock.now(),
            )
            .await
        {
            Ok(cleared) => Ok(cleared),
            Err(e) => {
                tracing::warn!(entity = %T::TYPE, id = record.id(), error = %e, "Failed to clear outbox");
                Ok(record)
            }
        }
    }
}
