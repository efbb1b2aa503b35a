//! Entity store contract.
//!
//! Each entity type lives in its own store keyed by id. Writes are
//! optimistic: [`EntityStore::put`] takes the version the caller read and
//! fails with [`StoreError::Conflict`] if someone else wrote in between.
//! Records also carry an outbox of messages that were decided together with
//! the state change but not yet confirmed as published.

use crate::bus::BoxFuture;
use crate::envelope::Envelope;
use crate::model::{Journey, Mission, Offer, Shipment, Step};
use crate::routing::EntityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record changed since it was read.
    #[error("version conflict on {entity} {id}: expected {expected:?}, found {actual:?}")]
    Conflict {
        /// Entity type.
        entity: EntityType,
        /// Entity id.
        id: String,
        /// Version the writer expected (`None`: expected absent).
        expected: Option<u64>,
        /// Version actually stored (`None`: absent).
        actual: Option<u64>,
    },

    /// The store is unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A stored entity type.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Entity type, for errors, logs and metrics.
    const TYPE: EntityType;

    /// The entity's id.
    fn entity_id(&self) -> &str;
}

impl Entity for Step {
    const TYPE: EntityType = EntityType::Step;

    fn entity_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Entity for Shipment {
    const TYPE: EntityType = EntityType::Shipment;

    fn entity_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Entity for Journey {
    const TYPE: EntityType = EntityType::Journey;

    fn entity_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Entity for Mission {
    const TYPE: EntityType = EntityType::Mission;

    fn entity_id(&self) -> &str {
        self.id.as_str()
    }
}

impl Entity for Offer {
    const TYPE: EntityType = EntityType::Offer;

    fn entity_id(&self) -> &str {
        self.id.as_str()
    }
}

/// A message decided by a handler, waiting to be published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outgoing {
    /// Publish on the events exchange.
    Event(Envelope),
    /// Send on the commands exchange.
    Command(Envelope),
}

impl Outgoing {
    /// The message.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        match self {
            Self::Event(envelope) | Self::Command(envelope) => envelope,
        }
    }
}

/// A stored entity with its concurrency metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct Record<T> {
    /// Version, starting at 1 and incremented on every write.
    pub version: u64,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
    /// The entity.
    pub entity: T,
    /// Messages not yet confirmed as published.
    pub outbox: Vec<Outgoing>,
}

impl<T: Entity> Record<T> {
    /// Id of the stored entity.
    #[must_use]
    pub fn id(&self) -> &str {
        self.entity.entity_id()
    }
}

/// Key-value store of one entity type with compare-and-set writes.
pub trait EntityStore<T: Entity>: Send + Sync {
    /// Load a record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store is unreachable.
    fn get<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Record<T>>, StoreError>>;

    /// Write `entity` with `outbox`.
    ///
    /// With `expected_version == None` the record must not exist yet; with
    /// `Some(v)` the stored version must be `v`. Returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the expectation does not hold.
    fn put(
        &self,
        entity: T,
        outbox: Vec<Outgoing>,
        expected_version: Option<u64>,
        updated_at: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<Record<T>, StoreError>>;

    /// Every record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store is unreachable.
    fn all(&self) -> BoxFuture<'_, Result<Vec<Record<T>>, StoreError>>;
}
