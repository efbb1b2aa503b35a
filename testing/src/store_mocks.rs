//! In-memory entity stores
//!
//! - [`InMemoryEntityStore`]: HashMap-backed store with compare-and-set writes
//! - [`ContendedStore`]: wrapper that simulates a concurrent writer winning
//!   the next N compare-and-set races

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use crate::mocks::test_clock;
use courier_core::bus::BoxFuture;
use courier_core::environment::Clock;
use courier_core::store::{Entity, EntityStore, Outgoing, Record, StoreError};
use courier_core::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory entity store for fast, deterministic testing.
///
/// # Example
///
/// ```
/// use courier_testing::InMemoryEntityStore;
/// use courier_testing::fixtures::shipment;
/// use courier_core::store::EntityStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEntityStore::new();
/// store.seed(shipment("s-1"));
///
/// let record = store.get("s-1").await?.unwrap();
/// assert_eq!(record.version, 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryEntityStore<T> {
    records: Arc<RwLock<HashMap<String, Record<T>>>>,
    available: Arc<AtomicBool>,
}

impl<T> Clone for InMemoryEntityStore<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            available: Arc::clone(&self.available),
        }
    }
}

impl<T> Default for InMemoryEntityStore<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }
}

impl<T: Entity> InMemoryEntityStore<T> {
    /// Create a new empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `entity` at the next version, bypassing the
    /// compare-and-set check.
    pub fn seed(&self, entity: T) {
        let mut records = self.records.write().unwrap();
        let id = entity.entity_id().to_string();
        let version = records.get(&id).map_or(0, |r| r.version) + 1;
        records.insert(
            id,
            Record {
                version,
                updated_at: test_clock().now(),
                entity,
                outbox: Vec::new(),
            },
        );
    }

    /// Current state of `id`.
    #[must_use]
    pub fn entity(&self, id: &str) -> Option<T> {
        self.records
            .read()
            .unwrap()
            .get(id)
            .map(|r| r.entity.clone())
    }

    /// Current record of `id`.
    #[must_use]
    pub fn record(&self, id: &str) -> Option<Record<T>> {
        self.records.read().unwrap().get(id).cloned()
    }

    /// Every entity, in no particular order.
    #[must_use]
    pub fn entities(&self) -> Vec<T> {
        self.records
            .read()
            .unwrap()
            .values()
            .map(|r| r.entity.clone())
            .collect()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until
    /// re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("{} store offline", T::TYPE)))
        }
    }

    fn compare_and_set(
        &self,
        entity: T,
        outbox: Vec<Outgoing>,
        expected_version: Option<u64>,
        updated_at: DateTime<Utc>,
    ) -> Result<Record<T>, StoreError> {
        self.check_available()?;
        let mut records = self.records.write().unwrap();
        let id = entity.entity_id().to_string();
        let actual = records.get(&id).map(|r| r.version);
        if actual != expected_version {
            return Err(StoreError::Conflict {
                entity: T::TYPE,
                id,
                expected: expected_version,
                actual,
            });
        }
        let record = Record {
            version: actual.unwrap_or(0) + 1,
            updated_at,
            entity,
            outbox,
        };
        records.insert(id, record.clone());
        Ok(record)
    }
}

impl<T: Entity> EntityStore<T> for InMemoryEntityStore<T> {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record<T>>, StoreError>> {
        let result = self
            .check_available()
            .map(|()| self.records.read().unwrap().get(id).cloned());
        Box::pin(futures::future::ready(result))
    }

    fn put(
        &self,
        entity: T,
        outbox: Vec<Outgoing>,
        expected_version: Option<u64>,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Record<T>, StoreError>> {
        let result = self.compare_and_set(entity, outbox, expected_version, updated_at);
        Box::pin(futures::future::ready(result))
    }

    fn all(&self) -> BoxFuture<'_, Result<Vec<Record<T>>, StoreError>> {
        let result = self
            .check_available()
            .map(|()| self.records.read().unwrap().values().cloned().collect());
        Box::pin(futures::future::ready(result))
    }
}

/// Store whose next `n` updates lose a race against a simulated concurrent
/// writer: the stored record is bumped to a new version and the caller's
/// compare-and-set fails.
#[derive(Debug)]
pub struct ContendedStore<T> {
    inner: InMemoryEntityStore<T>,
    pending_conflicts: AtomicUsize,
    puts: AtomicUsize,
}

impl<T: Entity> ContendedStore<T> {
    /// Wrap `inner`; the next `conflicts` updates of existing records fail.
    #[must_use]
    pub const fn new(inner: InMemoryEntityStore<T>, conflicts: usize) -> Self {
        Self {
            inner,
            pending_conflicts: AtomicUsize::new(conflicts),
            puts: AtomicUsize::new(0),
        }
    }

    /// Number of `put` calls received, successful or not.
    #[must_use]
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &InMemoryEntityStore<T> {
        &self.inner
    }
}

impl<T: Entity> EntityStore<T> for ContendedStore<T> {
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record<T>>, StoreError>> {
        self.inner.get(id)
    }

    fn put(
        &self,
        entity: T,
        outbox: Vec<Outgoing>,
        expected_version: Option<u64>,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Record<T>, StoreError>> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let contended = expected_version.is_some()
            && self
                .pending_conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if contended {
            let id = entity.entity_id().to_string();
            let current = self.inner.entity(&id);
            if let Some(current) = current {
                self.inner.seed(current);
            }
            return Box::pin(futures::future::ready(Err(StoreError::Conflict {
                entity: T::TYPE,
                actual: self.inner.record(&id).map(|r| r.version),
                id,
                expected: expected_version,
            })));
        }
        self.inner.put(entity, outbox, expected_version, updated_at)
    }

    fn all(&self) -> BoxFuture<'_, Result<Vec<Record<T>>, StoreError>> {
        self.inner.all()
    }
}
