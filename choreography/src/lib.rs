//! # Courier Choreography
//!
//! The coordinating services of the Courier core, each owning one entity
//! store and reacting to messages from the others:
//!
//! - **[`step_engine`]**: applies validated step transitions and announces
//!   them with the full set of sibling states
//! - **[`shipment`]**: derives shipment status from step states
//! - **[`journey`]**: books, cancels and settles journeys
//! - **[`mission`]**: maintains mission journey sets and curators
//! - **[`offer`]**: creates offers and seeds their steps
//! - **[`coordinator`]**: binds every service to its queue and runs the
//!   consumers
//!
//! Every handler is a pure decision over the current entity snapshot,
//! executed by [`Runner`](courier_runtime::runner::Runner) so that
//! redelivered messages neither change state twice nor publish twice.

pub mod coordinator;
pub mod environment;
pub mod journey;
pub mod mission;
pub mod offer;
pub mod shipment;
pub mod step_engine;

pub use coordinator::{Coordinator, CoordinatorBuilder, CoordinatorError, CoordinatorHandle, Services};
pub use environment::{Environment, Stores};
