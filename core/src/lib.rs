//! # Courier Core
//!
//! Domain model and messaging contracts for the Courier coordination core.
//!
//! Five entities are coordinated across independently consumed queues:
//!
//! - **Step**: one custody leg, driven through a fixed transition table
//! - **Shipment**: a parcel movement whose status is derived from its steps
//! - **Journey**: an agent-offered transport slot
//! - **Mission**: a curated bundle of journeys
//! - **Offer**: a bid attaching a shipment to a mission or journey
//!
//! This crate holds no I/O. It defines the entities and their rules, the
//! [`aggregate`](aggregate::aggregate) status function, the message
//! [`Envelope`](envelope::Envelope), the typed [`routing`] table, the
//! payload types, and the [`Broker`](bus::Broker) and
//! [`EntityStore`](store::EntityStore) contracts implemented elsewhere.
//!
//! ## Architecture Principles
//!
//! - Handlers are pure decisions over an entity snapshot; I/O is done by a
//!   thin runner
//! - At-least-once delivery; every handler is idempotent
//! - Routing keys derived from types, never assembled at call sites
//! - Dependencies injected through traits

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod aggregate;
pub mod bus;
pub mod decision;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod messages;
pub mod model;
pub mod routing;
pub mod store;

/// Environment module - injected collaborators
///
/// All external dependencies of the choreographers are abstracted behind
/// traits and passed in at construction.
pub mod environment {
    use crate::bus::BoxFuture;
    use crate::error::CoordinationError;
    use crate::model::{Shipment, Step};
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Derives the legs a shipment needs.
    ///
    /// Returned steps only need `shipment_id`, `index`, the parties and the
    /// parameters filled in; the offer choreographer assigns ids, state,
    /// offer and journey before seeding them.
    pub trait StepFactory: Send + Sync {
        /// Build the ordered legs for `shipment`.
        ///
        /// # Errors
        ///
        /// Returns [`CoordinationError::Transient`] if the factory's own
        /// dependencies are unavailable.
        fn steps_for<'a>(
            &'a self,
            shipment: &'a Shipment,
        ) -> BoxFuture<'a, Result<Vec<Step>, CoordinationError>>;
    }
}
