//! Request/reply over the broker, bounded by a deadline.
//!
//! ```text
//! RpcClient                     broker                      RpcEndpoint
//!    │ declare rpc.reply.{corr}   │                              │
//!    │ publish rpc.{action} ─────►│─────► {entities}.rpc.*.queue ─►│
//!    │                            │                              │ respond
//!    │◄──── rpc.reply.{corr} ◄────│◄──── default exchange ◄───────│
//!    │ delete rpc.reply.{corr}    │                              │
//! ```
//!
//! The client never returns a transport error. On timeout or broker
//! failure it returns the reply type's [`RpcReply::failure`] value with
//! reason `"service unavailable"`. The endpoint never lets a handler error
//! escape either: it becomes a failure reply.

use crate::channel::publish_envelope;
use crate::config::RpcConfig;
use crate::consumer::MessageHandler;
use crate::metrics::RpcMetrics;
use async_trait::async_trait;
use courier_core::bus::{Broker, BusError, Exchange, QueueSpec};
use courier_core::envelope::Envelope;
use courier_core::environment::Clock;
use courier_core::error::CoordinationError;
use courier_core::ids::CorrelationId;
use courier_core::messages::{RpcCall, RpcReply};
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reason carried by fallback replies.
pub const UNAVAILABLE: &str = "service unavailable";

/// Name of the reply queue for `correlation`.
#[must_use]
pub fn reply_queue(correlation: &CorrelationId) -> String {
    format!("rpc.reply.{correlation}")
}

/// Caller side of the RPC channel.
#[derive(Clone)]
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    config: RpcConfig,
    clock: Arc<dyn Clock>,
}

impl RpcClient {
    /// Create a client with per-action deadlines from `config`.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, config: RpcConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            broker,
            config,
            clock,
        }
    }

    /// Call with a fresh correlation id.
    pub async fn call<C: RpcCall>(&self, call: &C) -> C::Reply {
        self.call_correlated(call, &CorrelationId::generate()).await
    }

    /// Call with `correlation`. Returns within the action's deadline plus
    /// the time to delete the reply queue.
    pub async fn call_correlated<C: RpcCall>(
        &self,
        call: &C,
        correlation: &CorrelationId,
    ) -> C::Reply {
        let action = C::ACTION.name();
        let deadline = self.config.deadline_for(C::ACTION);
        let reply_to = reply_queue(correlation);
        let started = Instant::now();

        let outcome = tokio::time::timeout(
            deadline,
            self.round_trip(call, correlation, &reply_to, deadline),
        )
        .await;

        if let Err(e) = self.broker.delete_queue(&reply_to).await {
            tracing::warn!(action, queue = %reply_to, error = %e, "Failed to delete reply queue");
        }

        let (reply, label) = match outcome {
            Ok(Ok(reply)) => (reply, "ok"),
            Ok(Err(e)) => {
                tracing::warn!(action, correlation_id = %correlation, error = %e, "RPC failed, returning fallback");
                (C::Reply::failure(UNAVAILABLE), "unavailable")
            }
            Err(_) => {
                tracing::warn!(
                    action,
                    correlation_id = %correlation,
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "RPC deadline exceeded, returning fallback"
                );
                (C::Reply::failure(UNAVAILABLE), "timeout")
            }
        };
        RpcMetrics::record_call(action, label, started.elapsed());
        reply
    }

    async fn round_trip<C: RpcCall>(
        &self,
        call: &C,
        correlation: &CorrelationId,
        reply_to: &str,
        deadline: Duration,
    ) -> Result<C::Reply, BusError> {
        self.broker
            .declare_queue(QueueSpec::transient(reply_to))
            .await?;
        let mut replies = self.broker.consume(reply_to).await?;

        let now = self.clock.now();
        let expires = chrono::TimeDelta::from_std(deadline).map_or(now, |delta| now + delta);
        let request = Envelope::rpc_request(call, correlation, reply_to, expires)?;
        publish_envelope(self.broker.as_ref(), Exchange::Rpc, request).await?;

        while let Some(delivery) = replies.next().await {
            let delivery = delivery?;
            let matches = delivery
                .envelope()
                .correlation_id()
                .is_some_and(|id| &id == correlation);
            if !matches {
                tracing::debug!(queue = reply_to, "Discarding reply with foreign correlation id");
                delivery.ack().await?;
                continue;
            }
            let reply = delivery.envelope().decode::<C::Reply>();
            delivery.ack().await?;
            return reply;
        }

        Err(BusError::Consume {
            queue: reply_to.to_string(),
            reason: "reply queue closed".to_string(),
        })
    }
}

/// Responder logic for one RPC action.
#[async_trait]
pub trait RpcHandler<C: RpcCall>: Send + Sync + 'static {
    /// Compute the reply.
    ///
    /// # Errors
    ///
    /// Any error is turned into [`RpcReply::failure`] with the error's
    /// message; it never reaches the caller as an error.
    async fn respond(&self, call: C) -> Result<C::Reply, CoordinationError>;
}

#[async_trait]
impl<C, H> RpcHandler<C> for Arc<H>
where
    C: RpcCall,
    H: RpcHandler<C>,
{
    async fn respond(&self, call: C) -> Result<C::Reply, CoordinationError> {
        self.as_ref().respond(call).await
    }
}

/// Serves an [`RpcHandler`] from its request queue.
pub struct RpcEndpoint<C, H> {
    handler: H,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    _call: PhantomData<fn() -> C>,
}

impl<C, H> RpcEndpoint<C, H> {
    /// Serve `handler`, replying through `broker`.
    #[must_use]
    pub fn new(handler: H, broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        Self {
            handler,
            broker,
            clock,
            _call: PhantomData,
        }
    }
}

#[async_trait]
impl<C, H> MessageHandler for RpcEndpoint<C, H>
where
    C: RpcCall,
    H: RpcHandler<C>,
{
    async fn handle(&self, envelope: &Envelope) -> Result<(), CoordinationError> {
        let action = C::ACTION.name();
        let Some(reply_to) = envelope.reply_to() else {
            tracing::warn!(action, "RPC request without reply queue, dropping");
            return Ok(());
        };
        if envelope
            .deadline()
            .is_some_and(|deadline| deadline < self.clock.now())
        {
            tracing::debug!(action, reply_to, "RPC request past its deadline, dropping");
            return Ok(());
        }

        let reply = match envelope.decode::<C>() {
            Ok(call) => match self.handler.respond(call).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::debug!(action, error = %e, "RPC handler failed, replying with failure");
                    C::Reply::failure(e.to_string())
                }
            },
            Err(e) => C::Reply::failure(e.to_string()),
        };

        let correlation = envelope
            .correlation_id()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default();
        let published = match Envelope::rpc_reply(&reply, reply_to, &correlation) {
            Ok(reply) => publish_envelope(self.broker.as_ref(), Exchange::Default, reply).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            tracing::warn!(action, reply_to, error = %e, "Failed to send RPC reply");
        }
        Ok(())
    }
}
