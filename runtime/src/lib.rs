//! # Courier Runtime
//!
//! Async machinery for the Courier coordination core.
//!
//! This crate turns the pure contracts of `courier-core` into running
//! consumers: it declares the queue topology on a broker, drains each queue
//! with its own consumer loop, executes handler decisions against the
//! entity stores and publishes what they emit.
//!
//! ## Core Components
//!
//! - **[`config`]**: immutable configuration built once at start-up
//! - **[`broker`]**: in-process AMQP-style broker
//! - **[`topology`]**: queue and dead-letter declarations from the routing table
//! - **[`channel`]**: typed event and command publishers
//! - **[`consumer`]**: per-queue consume loop with dead-letter discipline
//! - **[`rpc`]**: deadline-bounded request/reply with typed fallbacks
//! - **[`runner`]**: compare-and-set + outbox execution of pure decisions
//! - **[`redrive`]**: dead-letter queue redrive
//!
//! ## Example
//!
//! ```ignore
//! use courier_runtime::{broker::InMemoryBroker, config::CourierConfig, topology::Topology};
//! use courier_core::routing::RoutingTable;
//!
//! let config = CourierConfig::from_env();
//! let broker = InMemoryBroker::new(config.broker.clone());
//! Topology::from_table(&RoutingTable::standard(), &config.broker, &config.rpc)
//!     .declare(&broker)
//!     .await?;
//! ```

/// In-process broker
pub mod broker;

/// Typed event and command channels
pub mod channel;

/// Immutable runtime configuration
pub mod config;

/// Queue consumer loop
pub mod consumer;

/// Prometheus metrics for observability
pub mod metrics;

/// Dead-letter queue redrive
pub mod redrive;

/// Retry logic with exponential backoff
pub mod retry;

/// RPC client and endpoint
pub mod rpc;

/// Decision runner with outbox
pub mod runner;

/// Queue topology
pub mod topology;
