//! Dead-letter queue redrive.
//!
//! Dead-lettered messages are not redelivered automatically by the broker.
//! The [`Redriver`] moves them from `dlq.{queue}` back to `{queue}` through
//! the default exchange, counting attempts in `x-redrive-count`. A message
//! that has been redriven `max_redrives` times is parked: it moves to
//! `parked.{queue}`, marked `x-parked`, for an operator to inspect, and no
//! longer occupies the dead-letter queue.
//!
//! Manual mode is [`Redriver::redrive_once`]. Scheduled mode
//! ([`Redriver::spawn`]) sweeps every queue on an interval and only moves
//! messages whose backoff (`backoff_policy.delay_for_attempt(count)` since
//! `x-death-at`) has elapsed.

use crate::channel::publish_routed;
use crate::config::RedriveConfig;
use crate::metrics::DlqMetrics;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use courier_core::bus::{Broker, BusError, Delivery, Exchange, QueueSpec};
use courier_core::envelope::{Envelope, headers};
use courier_core::environment::Clock;
use courier_core::routing::{dead_letter_queue, parked_queue};
use std::sync::Arc;
use tokio::sync::broadcast;

/// What one pass over a dead-letter queue did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedriveReport {
    /// Messages moved back to their queue.
    pub redriven: usize,
    /// Messages newly parked.
    pub parked: usize,
    /// Messages left for a later pass (backoff pending).
    pub deferred: usize,
}

impl RedriveReport {
    fn merge(&mut self, other: Self) {
        self.redriven += other.redriven;
        self.parked += other.parked;
        self.deferred += other.deferred;
    }
}

enum Verdict {
    Redrive,
    Park,
    Defer,
}

/// Moves dead-lettered messages back to their queues.
pub struct Redriver {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    config: RedriveConfig,
    backoff: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Redriver {
    /// Create a redriver for `queues` (main queue names, not DLQ names).
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        queues: Vec<String>,
        config: RedriveConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backoff = config.backoff_policy();
        Self {
            broker,
            queues,
            config,
            backoff,
            clock,
        }
    }

    /// Redrive up to `limit` messages of `queue`'s dead-letter queue now,
    /// ignoring backoff. Exhausted messages met on the way are parked and
    /// do not count against `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError`] if the dead-letter queue cannot be read.
    pub async fn redrive_once(&self, queue: &str, limit: usize) -> Result<RedriveReport, BusError> {
        self.pass(queue, limit, false).await
    }

    /// One scheduled pass over every queue, honoring backoff.
    pub async fn sweep(&self) -> RedriveReport {
        let mut total = RedriveReport::default();
        for queue in &self.queues {
            match self.pass(queue, self.config.batch_size, true).await {
                Ok(report) => total.merge(report),
                Err(e) => tracing::warn!(queue = %queue, error = %e, "Redrive pass failed"),
            }
        }
        if total.redriven > 0 || total.parked > 0 {
            tracing::info!(
                redriven = total.redriven,
                parked = total.parked,
                deferred = total.deferred,
                "Redrive sweep finished"
            );
        }
        total
    }

    /// Spawn the scheduled sweep loop.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                queues = self.queues.len(),
                interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
                "Redriver started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            tracing::info!("Redriver stopped");
        })
    }

    async fn pass(
        &self,
        queue: &str,
        limit: usize,
        honor_backoff: bool,
    ) -> Result<RedriveReport, BusError> {
        let dlq = dead_letter_queue(queue);
        let depth = self.broker.depth(&dlq).await?;
        let mut report = RedriveReport::default();
        let mut held: Vec<Delivery> = Vec::new();

        // Deferred messages are held unacked, so each fetch reaches further
        // into the queue. Only redrives count against `limit`.
        for _ in 0..depth {
            if report.redriven >= limit {
                break;
            }
            let Some(delivery) = self.broker.fetch(&dlq).await? else {
                break;
            };
            match self.verdict(delivery.envelope(), honor_backoff) {
                Verdict::Defer => {
                    report.deferred += 1;
                    held.push(delivery);
                }
                Verdict::Park => {
                    let parked = parked_queue(queue);
                    self.broker.declare_queue(QueueSpec::durable(&parked)).await?;
                    let envelope = delivery.envelope().clone().with_header(headers::PARKED, "true");
                    publish_routed(self.broker.as_ref(), Exchange::Default, &parked, envelope).await?;
                    delivery.ack().await?;
                    DlqMetrics::record_parked(queue);
                    tracing::warn!(queue, parked = %parked, max_redrives = self.config.max_redrives, "Message parked after exhausting redrives");
                    report.parked += 1;
                }
                Verdict::Redrive => {
                    let count = delivery.envelope().redrive_count() + 1;
                    let envelope = delivery
                        .envelope()
                        .clone()
                        .with_header(headers::REDRIVE_COUNT, count.to_string());
                    publish_routed(self.broker.as_ref(), Exchange::Default, queue, envelope).await?;
                    delivery.ack().await?;
                    DlqMetrics::record_redriven(queue);
                    tracing::info!(queue, redrive_count = count, "Message redriven");
                    report.redriven += 1;
                }
            }
        }

        // Return held messages to the head of the DLQ in their original order.
        for delivery in held.into_iter().rev() {
            delivery.nack(true).await?;
        }
        Ok(report)
    }

    fn verdict(&self, envelope: &Envelope, honor_backoff: bool) -> Verdict {
        let count = envelope.redrive_count();
        if envelope.header(headers::PARKED).is_some() || count >= self.config.max_redrives {
            return Verdict::Park;
        }
        if honor_backoff && !self.backoff_elapsed(envelope, count) {
            return Verdict::Defer;
        }
        Verdict::Redrive
    }

    fn backoff_elapsed(&self, envelope: &Envelope, count: u32) -> bool {
        let Some(dead_at) = envelope
            .header(headers::DEATH_AT)
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .map(|at| at.with_timezone(&Utc))
        else {
            return true;
        };
        let attempt = usize::try_from(count).unwrap_or(usize::MAX);
        let wait = self.backoff.delay_for_attempt(attempt);
        chrono::TimeDelta::from_std(wait)
            .ok()
            .and_then(|wait| dead_at.checked_add_signed(wait))
            .is_some_and(|due| self.clock.now() >= due)
    }
}
