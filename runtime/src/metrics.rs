//! Prometheus metrics for observability and monitoring.
//!
//! Metric families:
//! - Broker publishes and failures
//! - Consumer outcomes per queue
//! - Dead-lettering, redrive and parking
//! - RPC calls and latency
//! - Step transitions, shipment status changes and store conflicts
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed, so library code records unconditionally.
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use courier_core::routing::EntityType;
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter on the current
    /// Tokio runtime.
    ///
    /// If a recorder is already installed (e.g. by an earlier test), this
    /// logs a warning and leaves the existing recorder in place.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter cannot be configured.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        // ExporterError implements neither Debug nor Display.
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(%addr, "Metrics exporter stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics server started - available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Broker
    describe_counter!(
        "courier_bus_published_total",
        "Messages accepted by the broker"
    );
    describe_counter!(
        "courier_bus_publish_failures_total",
        "Publishes the broker refused"
    );

    // Consumers
    describe_counter!(
        "courier_consumer_messages_total",
        "Consumed messages by queue and outcome (ok, ignored, dead_lettered)"
    );

    // Dead letters
    describe_counter!(
        "courier_dlq_dead_lettered_total",
        "Messages dead-lettered by queue and reason"
    );
    describe_counter!(
        "courier_dlq_redriven_total",
        "Messages moved from a dead-letter queue back to its queue"
    );
    describe_counter!(
        "courier_dlq_parked_total",
        "Dead-lettered messages moved to the parked queue after exhausting redrives"
    );

    // RPC
    describe_counter!(
        "courier_rpc_calls_total",
        "RPC calls by action and outcome (ok, timeout, unavailable)"
    );
    describe_histogram!(
        "courier_rpc_duration_seconds",
        "RPC round-trip time by action"
    );

    // Domain
    describe_counter!(
        "courier_step_transitions_total",
        "Applied step transitions by target state"
    );
    describe_counter!(
        "courier_shipment_status_changes_total",
        "Shipment status changes by new status"
    );
    describe_counter!(
        "courier_store_conflicts_total",
        "Optimistic concurrency conflicts by entity"
    );
}

/// Broker metrics recorder.
pub struct BusMetrics;

impl BusMetrics {
    /// Record an accepted publish.
    pub fn record_publish(exchange: &'static str) {
        counter!("courier_bus_published_total", "exchange" => exchange).increment(1);
    }

    /// Record a refused publish.
    pub fn record_publish_failure(exchange: &'static str) {
        counter!("courier_bus_publish_failures_total", "exchange" => exchange).increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record the outcome of one message.
    pub fn record(queue: &str, outcome: &'static str) {
        counter!(
            "courier_consumer_messages_total",
            "queue" => queue.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Dead-letter metrics recorder.
pub struct DlqMetrics;

impl DlqMetrics {
    /// Record a dead-lettered message.
    pub fn record_dead_lettered(queue: &str, reason: &'static str) {
        counter!(
            "courier_dlq_dead_lettered_total",
            "queue" => queue.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    /// Record a redriven message.
    pub fn record_redriven(queue: &str) {
        counter!("courier_dlq_redriven_total", "queue" => queue.to_string()).increment(1);
    }

    /// Record a parked message.
    pub fn record_parked(queue: &str) {
        counter!("courier_dlq_parked_total", "queue" => queue.to_string()).increment(1);
    }
}

/// RPC metrics recorder.
pub struct RpcMetrics;

impl RpcMetrics {
    /// Record one call.
    pub fn record_call(action: &'static str, outcome: &'static str, duration: Duration) {
        counter!("courier_rpc_calls_total", "action" => action, "outcome" => outcome).increment(1);
        histogram!("courier_rpc_duration_seconds", "action" => action)
            .record(duration.as_secs_f64());
    }
}

/// Domain metrics recorder.
pub struct DomainMetrics;

impl DomainMetrics {
    /// Record an applied step transition.
    pub fn record_step_transition(to: &'static str) {
        counter!("courier_step_transitions_total", "to" => to).increment(1);
    }

    /// Record a shipment status change.
    pub fn record_shipment_status(status: &'static str) {
        counter!("courier_shipment_status_changes_total", "status" => status).increment(1);
    }

    /// Record an optimistic concurrency conflict.
    pub fn record_store_conflict(entity: EntityType) {
        counter!("courier_store_conflicts_total", "entity" => entity.as_str()).increment(1);
    }
}
