//! Configuration for the coordination core.
//!
//! A [`CourierConfig`] is built once at process start, validated, and then
//! passed by value or `Arc` into every channel and service constructor.
//! Nothing reads the environment after startup.

use crate::retry::RetryPolicy;
use courier_core::bus::Exchange;
use courier_core::routing::RpcAction;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Shortest RPC deadline accepted by [`CourierConfig::validate`].
pub const MIN_RPC_DEADLINE: Duration = Duration::from_secs(1);
/// Longest RPC deadline accepted by [`CourierConfig::validate`].
pub const MAX_RPC_DEADLINE: Duration = Duration::from_secs(30);

/// Invalid configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An RPC deadline lies outside the accepted range.
    #[error("RPC deadline for {action} is {deadline_ms}ms, expected 1000..=30000ms")]
    RpcDeadlineOutOfRange {
        /// Action name.
        action: &'static str,
        /// Configured deadline.
        deadline_ms: u128,
    },

    /// A value that must be positive is zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// A required string is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Broker topology limits.
    pub broker: BrokerConfig,
    /// RPC deadlines.
    pub rpc: RpcConfig,
    /// Consumer loop settings.
    pub consumer: ConsumerConfig,
    /// Dead-letter redrive.
    pub redrive: RedriveConfig,
    /// Choreographer settings.
    pub choreography: ChoreographyConfig,
    /// Prometheus exporter.
    pub metrics: MetricsConfig,
}

/// Broker exchanges and queue limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Topic exchange for events.
    pub events_exchange: String,
    /// Direct exchange for commands.
    pub commands_exchange: String,
    /// Direct exchange for RPC requests.
    pub rpc_exchange: String,
    /// Dead-letter exchange.
    pub dead_letter_exchange: String,
    /// Maximum ready messages per queue.
    pub queue_max_length: usize,
    /// Maximum message age per queue.
    pub message_ttl: Duration,
    /// Maximum ready messages per dead-letter queue.
    pub dlq_max_length: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            events_exchange: "courier.events".to_string(),
            commands_exchange: "courier.commands".to_string(),
            rpc_exchange: "courier.rpc".to_string(),
            dead_letter_exchange: "courier.dlx".to_string(),
            queue_max_length: 10_000,
            message_ttl: Duration::from_secs(24 * 60 * 60),
            dlq_max_length: 100_000,
        }
    }
}

impl BrokerConfig {
    /// Configured name of `exchange`; the default exchange is nameless.
    #[must_use]
    pub fn exchange_name(&self, exchange: Exchange) -> &str {
        match exchange {
            Exchange::Events => &self.events_exchange,
            Exchange::Commands => &self.commands_exchange,
            Exchange::Rpc => &self.rpc_exchange,
            Exchange::DeadLetter => &self.dead_letter_exchange,
            Exchange::Default => "",
        }
    }
}

/// Per-action RPC deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// `rpc.validate.journey.booking`.
    pub validate_booking: Duration,
    /// `rpc.validate.step.transition`.
    pub validate_transition: Duration,
    /// `rpc.get.shipment.status`.
    pub shipment_status: Duration,
    /// `rpc.preview.offer.steps`.
    pub preview_steps: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            validate_booking: Duration::from_secs(3),
            validate_transition: Duration::from_secs(5),
            shipment_status: Duration::from_secs(3),
            preview_steps: Duration::from_secs(10),
        }
    }
}

impl RpcConfig {
    /// Deadline for `action`.
    #[must_use]
    pub const fn deadline_for(&self, action: RpcAction) -> Duration {
        match action {
            RpcAction::ValidateJourneyBooking => self.validate_booking,
            RpcAction::ValidateStepTransition => self.validate_transition,
            RpcAction::GetShipmentStatus => self.shipment_status,
            RpcAction::PreviewOfferSteps => self.preview_steps,
        }
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Delay before re-subscribing after a consume error.
    pub retry_delay: Duration,
    /// Re-decide attempts after an optimistic-concurrency conflict.
    pub conflict_retries: usize,
    /// Delay before the first conflict retry; doubles per attempt.
    pub conflict_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(5),
            conflict_retries: 5,
            conflict_backoff: Duration::from_millis(10),
        }
    }
}

impl ConsumerConfig {
    /// Retry policy for conflicting writes.
    #[must_use]
    pub fn conflict_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.conflict_retries)
            .initial_delay(self.conflict_backoff)
            .max_delay(self.conflict_backoff.saturating_mul(16))
            .build()
    }
}

/// Dead-letter redrive settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedriveConfig {
    /// Run the scheduled redriver.
    pub enabled: bool,
    /// Time between scans.
    pub interval: Duration,
    /// Redrives per message before it is parked.
    pub max_redrives: u32,
    /// Messages examined per queue per scan.
    pub batch_size: usize,
    /// Minimum age of a dead letter before its first redrive; doubles per redrive.
    pub initial_backoff: Duration,
    /// Cap on the backoff.
    pub max_backoff: Duration,
}

impl Default for RedriveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            max_redrives: 3,
            batch_size: 100,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30 * 60),
        }
    }
}

impl RedriveConfig {
    /// Backoff between redrives of the same message.
    #[must_use]
    pub fn backoff_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(usize::try_from(self.max_redrives).unwrap_or(usize::MAX))
            .initial_delay(self.initial_backoff)
            .max_delay(self.max_backoff)
            .build()
    }
}

/// Choreographer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoreographyConfig {
    /// Curator that inherits missions of deleted curators.
    pub system_curator_id: String,
}

impl Default for ChoreographyConfig {
    fn default() -> Self {
        Self {
            system_curator_id: "system".to_string(),
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Install the exporter.
    pub enabled: bool,
    /// Listen address.
    pub addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    parsed(lookup, key).map_or(default, Duration::from_millis)
}

impl CourierConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let lookup = &lookup;
        Self {
            broker: BrokerConfig {
                queue_max_length: parsed(lookup, "COURIER_QUEUE_MAX_LENGTH")
                    .unwrap_or(defaults.broker.queue_max_length),
                message_ttl: parsed(lookup, "COURIER_MESSAGE_TTL_SECS")
                    .map_or(defaults.broker.message_ttl, Duration::from_secs),
                dlq_max_length: parsed(lookup, "COURIER_DLQ_MAX_LENGTH")
                    .unwrap_or(defaults.broker.dlq_max_length),
                ..defaults.broker
            },
            rpc: RpcConfig {
                validate_booking: millis(
                    lookup,
                    "COURIER_RPC_VALIDATE_BOOKING_MS",
                    defaults.rpc.validate_booking,
                ),
                validate_transition: millis(
                    lookup,
                    "COURIER_RPC_VALIDATE_TRANSITION_MS",
                    defaults.rpc.validate_transition,
                ),
                shipment_status: millis(
                    lookup,
                    "COURIER_RPC_SHIPMENT_STATUS_MS",
                    defaults.rpc.shipment_status,
                ),
                preview_steps: millis(
                    lookup,
                    "COURIER_RPC_PREVIEW_STEPS_MS",
                    defaults.rpc.preview_steps,
                ),
            },
            consumer: ConsumerConfig {
                retry_delay: millis(
                    lookup,
                    "COURIER_CONSUMER_RETRY_DELAY_MS",
                    defaults.consumer.retry_delay,
                ),
                conflict_retries: parsed(lookup, "COURIER_CONFLICT_RETRIES")
                    .unwrap_or(defaults.consumer.conflict_retries),
                ..defaults.consumer
            },
            redrive: RedriveConfig {
                enabled: parsed(lookup, "COURIER_REDRIVE_ENABLED")
                    .unwrap_or(defaults.redrive.enabled),
                interval: millis(
                    lookup,
                    "COURIER_REDRIVE_INTERVAL_MS",
                    defaults.redrive.interval,
                ),
                max_redrives: parsed(lookup, "COURIER_MAX_REDRIVES")
                    .unwrap_or(defaults.redrive.max_redrives),
                ..defaults.redrive
            },
            choreography: ChoreographyConfig {
                system_curator_id: lookup("COURIER_SYSTEM_CURATOR_ID")
                    .unwrap_or(defaults.choreography.system_curator_id),
            },
            metrics: MetricsConfig {
                enabled: parsed(lookup, "COURIER_METRICS_ENABLED")
                    .unwrap_or(defaults.metrics.enabled),
                addr: parsed(lookup, "COURIER_METRICS_ADDR").unwrap_or(defaults.metrics.addr),
            },
        }
    }

    /// Check ranges and required values.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for action in RpcAction::ALL {
            let deadline = self.rpc.deadline_for(action);
            if !(MIN_RPC_DEADLINE..=MAX_RPC_DEADLINE).contains(&deadline) {
                return Err(ConfigError::RpcDeadlineOutOfRange {
                    action: action.name(),
                    deadline_ms: deadline.as_millis(),
                });
            }
        }
        if self.broker.queue_max_length == 0 {
            return Err(ConfigError::Zero("queue_max_length"));
        }
        if self.broker.dlq_max_length == 0 {
            return Err(ConfigError::Zero("dlq_max_length"));
        }
        if self.broker.message_ttl.is_zero() {
            return Err(ConfigError::Zero("message_ttl"));
        }
        if self.redrive.enabled && self.redrive.interval.is_zero() {
            return Err(ConfigError::Zero("redrive interval"));
        }
        if self.redrive.batch_size == 0 {
            return Err(ConfigError::Zero("redrive batch_size"));
        }
        if self.choreography.system_curator_id.trim().is_empty() {
            return Err(ConfigError::Empty("system_curator_id"));
        }
        Ok(())
    }
}
