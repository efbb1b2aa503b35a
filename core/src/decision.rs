//! Output of a pure handler decision.

use crate::bus::BusError;
use crate::envelope::Envelope;
use crate::ids::CorrelationId;
use crate::messages::{DomainCommand, DomainEvent};
use crate::store::Outgoing;
use smallvec::SmallVec;

/// What a handler decided for one entity: its next state and the messages
/// to publish once that state is stored.
///
/// `next == None` leaves the entity untouched. Emitting without a state
/// change is allowed but then nothing records that the messages went out,
/// so a redelivery emits them again.
#[derive(Clone, Debug, PartialEq)]
pub struct Decision<T> {
    /// New entity state.
    pub next: Option<T>,
    /// Messages to publish.
    pub emit: SmallVec<[Outgoing; 4]>,
}

impl<T> Decision<T> {
    /// Nothing to do.
    #[must_use]
    pub fn unchanged() -> Self {
        Self {
            next: None,
            emit: SmallVec::new(),
        }
    }

    /// Store `next`.
    #[must_use]
    pub fn update(next: T) -> Self {
        Self {
            next: Some(next),
            emit: SmallVec::new(),
        }
    }

    /// Also publish `event`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the event cannot be encoded.
    pub fn with_event<E: DomainEvent>(
        mut self,
        event: &E,
        correlation: &CorrelationId,
    ) -> Result<Self, BusError> {
        self.emit
            .push(Outgoing::Event(Envelope::event(event, correlation)?));
        Ok(self)
    }

    /// Also send `command`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Serialization`] if the command cannot be encoded.
    pub fn with_command<C: DomainCommand>(
        mut self,
        command: &C,
        idempotency_key: &str,
        correlation: &CorrelationId,
    ) -> Result<Self, BusError> {
        self.emit.push(Outgoing::Command(Envelope::command(
            command,
            idempotency_key,
            correlation,
        )?));
        Ok(self)
    }

    /// Whether the decision changes nothing and emits nothing.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.next.is_none() && self.emit.is_empty()
    }
}
