//! # Courier Testing
//!
//! Testing utilities for the Courier coordination core.
//!
//! This crate provides:
//! - Mock implementations of the injected collaborators (clock, stores,
//!   step factory, broker faults)
//! - Entity fixtures
//! - A Given-When-Then harness for pure decisions
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use courier_testing::{InMemoryEntityStore, fixtures::journey, test_clock};
//!
//! #[tokio::test]
//! async fn books_journey() {
//!     let journeys = InMemoryEntityStore::new();
//!     journeys.seed(journey("j-1", "agent-1"));
//!     // ... run a choreographer against the store
//! }
//! ```

use chrono::{DateTime, Utc};
use courier_core::environment::Clock;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use courier_testing::mocks::FixedClock;
    /// use courier_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move forward by `by`.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Fault-injecting broker wrapper
pub mod broker_mocks;

/// Given-When-Then harness for decisions
pub mod decision_test;

/// Entity fixtures and step factory
pub mod fixtures;

/// In-memory entity stores
pub mod store_mocks;

/// Property-based testing utilities using proptest.
pub mod properties {
    use courier_core::model::StepState;
    use proptest::prelude::*;
    use proptest::sample::select;

    /// Any step state.
    pub fn any_step_state() -> impl Strategy<Value = StepState> {
        select(StepState::ALL.to_vec())
    }

    /// A non-empty list of step states.
    pub fn step_states(max_len: usize) -> impl Strategy<Value = Vec<StepState>> {
        prop::collection::vec(any_step_state(), 1..=max_len)
    }
}

/// Install a test tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use broker_mocks::FlakyBroker;
pub use decision_test::DecisionTest;
pub use fixtures::LegStepFactory;
pub use mocks::{FixedClock, ManualClock, test_clock};
pub use store_mocks::{ContendedStore, InMemoryEntityStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(test_clock().now());
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now() - test_clock().now(), chrono::Duration::seconds(5));
    }
}
