//! Message envelope.
//!
//! The wire shape is identical on every channel:
//!
//! ```json
//! {
//!   "topic": "step.state.changed",
//!   "data": { "...": "..." },
//!   "headers": {
//!     "x-event-version": "1.0",
//!     "x-entity-type": "step",
//!     "x-event-type": "state.changed",
//!     "x-step-id": "offer-1:0",
//!     "x-correlation-id": "2b0c..."
//!   }
//! }
//! ```

use crate::bus::BusError;
use crate::ids::CorrelationId;
use crate::messages::{DomainCommand, DomainEvent, RpcCall};
use crate::routing::EntityType;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current payload schema version.
pub const EVENT_VERSION: &str = "1.0";

/// Header names.
pub mod headers {
    /// Payload schema version.
    pub const EVENT_VERSION: &str = "x-event-version";
    /// Entity type (`step`, `journey`, ...).
    pub const ENTITY_TYPE: &str = "x-entity-type";
    /// Event type, command verb or RPC action.
    pub const EVENT_TYPE: &str = "x-event-type";
    /// Correlation id.
    pub const CORRELATION_ID: &str = "x-correlation-id";
    /// Caller-supplied idempotency key (commands).
    pub const IDEMPOTENCY_KEY: &str = "x-idempotency-key";
    /// Reply queue of an RPC request.
    pub const REPLY_TO: &str = "x-reply-to";
    /// RPC deadline in Unix milliseconds.
    pub const DEADLINE_MS: &str = "x-deadline-ms";
    /// Why the broker dead-lettered the message.
    pub const DEATH_REASON: &str = "x-death-reason";
    /// Queue the message was dead-lettered from.
    pub const DEATH_QUEUE: &str = "x-death-queue";
    /// How many times the message was dead-lettered.
    pub const DEATH_COUNT: &str = "x-death-count";
    /// When it was last dead-lettered (RFC 3339).
    pub const DEATH_AT: &str = "x-death-at";
    /// How many times it was redriven from its dead-letter queue.
    pub const REDRIVE_COUNT: &str = "x-redrive-count";
    /// Set on a dead-lettered message that exhausted its redrives.
    pub const PARKED: &str = "x-parked";
}

/// A routed message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing key the message was published with.
    pub topic: String,
    /// Versioned payload.
    pub data: serde_json::Value,
    /// Header set.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Envelope {
    /// A bare envelope without headers.
    #[must_use]
    pub fn new(topic: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            headers: BTreeMap::new(),
        }
    }

    /// Add or replace a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    fn typed<P: Serialize>(
        topic: &str,
        entity: EntityType,
        event_type: &str,
        entity_id: &str,
        payload: &P,
        correlation: &CorrelationId,
    ) -> Result<Self, BusError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| BusError::Serialization(format!("{topic}: {e}")))?;
        Ok(Self::new(topic, data)
            .with_header(headers::EVENT_VERSION, EVENT_VERSION)
            .with_header(headers::ENTITY_TYPE, entity.as_str())
            .with_header(headers::EVENT_TYPE, event_type)
            .with_header(entity.id_header(), entity_id)
            .with_header(headers::CORRELATION_ID, correlation.as_str()))
    }

    /// Envelope for a domain event.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the payload cannot be encoded.
    pub fn event<E: DomainEvent>(event: &E, correlation: &CorrelationId) -> Result<Self, BusError> {
        Self::typed(
            E::KIND.routing_key(),
            E::KIND.entity(),
            E::KIND.event_type(),
            event.entity_id(),
            event,
            correlation,
        )
    }

    /// Envelope for a command carrying `idempotency_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the payload cannot be encoded.
    pub fn command<C: DomainCommand>(
        command: &C,
        idempotency_key: &str,
        correlation: &CorrelationId,
    ) -> Result<Self, BusError> {
        Ok(Self::typed(
            C::KIND.routing_key(),
            C::KIND.entity(),
            C::KIND.verb(),
            command.entity_id(),
            command,
            correlation,
        )?
        .with_header(headers::IDEMPOTENCY_KEY, idempotency_key))
    }

    /// Envelope for an RPC request.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the payload cannot be encoded.
    pub fn rpc_request<C: RpcCall>(
        call: &C,
        correlation: &CorrelationId,
        reply_to: &str,
        deadline: DateTime<Utc>,
    ) -> Result<Self, BusError> {
        Ok(Self::typed(
            C::ACTION.routing_key(),
            C::ACTION.entity(),
            C::ACTION.name(),
            call.entity_id(),
            call,
            correlation,
        )?
        .with_header(headers::REPLY_TO, reply_to)
        .with_header(headers::DEADLINE_MS, deadline.timestamp_millis().to_string()))
    }

    /// Reply envelope routed to `reply_to`, echoing the request's correlation id.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the payload cannot be encoded.
    pub fn rpc_reply<R: Serialize>(
        reply: &R,
        reply_to: &str,
        correlation: &str,
    ) -> Result<Self, BusError> {
        let data = serde_json::to_value(reply)
            .map_err(|e| BusError::Serialization(format!("{reply_to}: {e}")))?;
        Ok(Self::new(reply_to, data)
            .with_header(headers::EVENT_VERSION, EVENT_VERSION)
            .with_header(headers::CORRELATION_ID, correlation))
    }

    /// Decode the payload.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        T::deserialize(&self.data)
            .map_err(|e| BusError::Serialization(format!("{}: {e}", self.topic)))
    }

    /// A header value.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// The correlation id, if present.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.header(headers::CORRELATION_ID).map(CorrelationId::from)
    }

    /// The idempotency key, if present.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.header(headers::IDEMPOTENCY_KEY)
    }

    /// The RPC reply queue, if present.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.header(headers::REPLY_TO)
    }

    /// The RPC deadline, if present and well-formed.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.header(headers::DEADLINE_MS)
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    /// How often the message was redriven from its dead-letter queue.
    #[must_use]
    pub fn redrive_count(&self) -> u32 {
        self.header(headers::REDRIVE_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }

    /// JSON wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, BusError> {
        serde_json::to_vec(self).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Decode the JSON wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] for malformed input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BusError> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))
    }
}
