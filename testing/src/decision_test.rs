//! Given-When-Then testing of pure handler decisions
//!
//! Choreographer handlers are pure functions from an entity snapshot to a
//! [`Decision`]. This module runs one against a given record and checks
//! the next state and emitted messages without a broker or store.

#![allow(clippy::module_name_repetitions)] // DecisionTest is the natural name

use crate::mocks::test_clock;
use courier_core::decision::Decision;
use courier_core::environment::Clock;
use courier_core::error::CoordinationError;
use courier_core::store::{Outgoing, Record};

/// Type alias for next-state assertion functions
type NextAssertion<T> = Box<dyn FnOnce(Option<&T>)>;

/// Type alias for emitted-message assertion functions
type EmitAssertion = Box<dyn FnOnce(&[Outgoing])>;

/// Type alias for rejection assertion functions
type ErrorAssertion = Box<dyn FnOnce(&CoordinationError)>;

/// Fluent API for testing decisions with Given-When-Then syntax
///
/// # Example
///
/// ```ignore
/// use courier_testing::DecisionTest;
///
/// DecisionTest::given(Some(journey("j-1", "agent-1")))
///     .when(|record| decide_booking(record, &request, &correlation))
///     .then_next(|journey| {
///         assert_eq!(journey.unwrap().status, JourneyStatus::Booked);
///     })
///     .then_emitted(|emit| assert_eq!(emit.len(), 1))
///     .run();
/// ```
pub struct DecisionTest<T> {
    record: Option<Record<T>>,
    decide: Option<Box<dyn FnOnce(Option<&Record<T>>) -> Result<Decision<T>, CoordinationError>>>,
    next_assertions: Vec<NextAssertion<T>>,
    emit_assertions: Vec<EmitAssertion>,
    error_assertions: Vec<ErrorAssertion>,
}

impl<T: 'static> DecisionTest<T> {
    /// Start from `entity` stored at version 1, or from an absent record.
    #[must_use]
    pub fn given(entity: Option<T>) -> Self {
        let record = entity.map(|entity| Record {
            version: 1,
            updated_at: test_clock().now(),
            entity,
            outbox: Vec::new(),
        });
        Self::given_record(record)
    }

    /// Start from an explicit record.
    #[must_use]
    pub fn given_record(record: Option<Record<T>>) -> Self {
        Self {
            record,
            decide: None,
            next_assertions: Vec::new(),
            emit_assertions: Vec::new(),
            error_assertions: Vec::new(),
        }
    }

    /// Set the decision under test (When)
    #[must_use]
    pub fn when<F>(mut self, decide: F) -> Self
    where
        F: FnOnce(Option<&Record<T>>) -> Result<Decision<T>, CoordinationError> + 'static,
    {
        self.decide = Some(Box::new(decide));
        self
    }

    /// Assert on the next state; `None` means the entity is left untouched.
    #[must_use]
    pub fn then_next<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(Option<&T>) + 'static,
    {
        self.next_assertions.push(Box::new(assertion));
        self
    }

    /// Assert on the emitted messages.
    #[must_use]
    pub fn then_emitted<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&[Outgoing]) + 'static,
    {
        self.emit_assertions.push(Box::new(assertion));
        self
    }

    /// Expect the decision to fail, and assert on the error.
    #[must_use]
    pub fn then_rejected<F>(mut self, assertion: F) -> Self
    where
        F: FnOnce(&CoordinationError) + 'static,
    {
        self.error_assertions.push(Box::new(assertion));
        self
    }

    /// Run the decision and execute all assertions
    ///
    /// # Panics
    ///
    /// Panics if no decision was set, if the outcome (success or rejection)
    /// differs from what the assertions expect, or if any assertion fails.
    #[allow(clippy::panic)] // Test code can panic
    #[allow(clippy::expect_used)] // Test code can use expect
    pub fn run(self) {
        let decide = self.decide.expect("Decision must be set with when()");

        match decide(self.record.as_ref()) {
            Ok(decision) => {
                assert!(
                    self.error_assertions.is_empty(),
                    "Expected the decision to be rejected, but it succeeded"
                );
                for assertion in self.next_assertions {
                    assertion(decision.next.as_ref());
                }
                for assertion in self.emit_assertions {
                    assertion(&decision.emit);
                }
            }
            Err(error) => {
                assert!(
                    self.next_assertions.is_empty() && self.emit_assertions.is_empty(),
                    "Decision was rejected unexpectedly: {error}"
                );
                for assertion in self.error_assertions {
                    assertion(&error);
                }
            }
        }
    }
}

/// Helper assertions for emitted messages
pub mod assertions {
    use courier_core::store::Outgoing;

    /// Assert that nothing was emitted
    ///
    /// # Panics
    ///
    /// Panics if `emit` is not empty.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_nothing_emitted(emit: &[Outgoing]) {
        assert!(
            emit.is_empty(),
            "Expected no messages, but found {}: {:?}",
            emit.len(),
            topics(emit)
        );
    }

    /// Assert the topics of the emitted messages, in order
    ///
    /// # Panics
    ///
    /// Panics if the topics differ.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_topics(emit: &[Outgoing], expected: &[&str]) {
        assert_eq!(topics(emit), expected, "Emitted topics differ");
    }

    /// Assert that exactly one event with `topic` was emitted
    ///
    /// # Panics
    ///
    /// Panics if no such event, or more than one, was emitted.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_single_event(emit: &[Outgoing], topic: &str) {
        let count = emit
            .iter()
            .filter(|o| matches!(o, Outgoing::Event(e) if e.topic == topic))
            .count();
        assert_eq!(count, 1, "Expected exactly one '{topic}' event in {:?}", topics(emit));
    }

    /// Assert that a command with `topic` was emitted
    ///
    /// # Panics
    ///
    /// Panics if no such command was emitted.
    #[allow(clippy::panic)] // Test assertion
    pub fn assert_has_command(emit: &[Outgoing], topic: &str) {
        assert!(
            emit.iter()
                .any(|o| matches!(o, Outgoing::Command(e) if e.topic == topic)),
            "Expected a '{topic}' command in {:?}",
            topics(emit)
        );
    }

    fn topics(emit: &[Outgoing]) -> Vec<&str> {
        emit.iter().map(|o| o.envelope().topic.as_str()).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::assertions::*;
    use super::*;
    use crate::fixtures::journey;
    use courier_core::ids::{CorrelationId, JourneyId, UserId};
    use courier_core::messages::JourneyCancelled;
    use courier_core::model::{Journey, JourneyStatus};
    use courier_core::routing::EntityType;

    #[test]
    fn runs_successful_decision() {
        DecisionTest::given(Some(journey("j-1", "agent-1")))
            .when(|record| {
                let mut next = record.unwrap().entity.clone();
                next.cancel_if_available();
                let event = JourneyCancelled {
                    journey_id: JourneyId::new("j-1"),
                    agent_id: UserId::new("agent-1"),
                    reason: Some("agent unavailable".to_string()),
                };
                Ok(Decision::update(next).with_event(&event, &CorrelationId::new("c-1"))?)
            })
            .then_next(|next: Option<&Journey>| {
                assert_eq!(next.unwrap().status, JourneyStatus::Cancelled);
            })
            .then_emitted(|emit| assert_topics(emit, &["journey.cancelled"]))
            .run();
    }

    #[test]
    fn runs_rejected_decision() {
        DecisionTest::<Journey>::given(None)
            .when(|_| Err(CoordinationError::not_found(EntityType::Journey, "j-1")))
            .then_rejected(|error| assert!(error.to_string().contains("j-1")))
            .run();
    }
}
