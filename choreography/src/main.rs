//! Courier coordination node.
//!
//! Runs every choreographer against an in-process broker and in-memory
//! stores until Ctrl-C or SIGTERM.

use anyhow::Context;
use courier_choreography::{Coordinator, Stores};
use courier_core::environment::SystemClock;
use courier_runtime::broker::InMemoryBroker;
use courier_runtime::config::CourierConfig;
use courier_runtime::metrics::MetricsServer;
use courier_testing::LegStepFactory;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "courier=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Courier node");

    let config = CourierConfig::from_env();
    config.validate().context("invalid configuration")?;
    info!(
        queue_max_length = config.broker.queue_max_length,
        redrive = config.redrive.enabled,
        system_curator = %config.choreography.system_curator_id,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics.addr);
    if config.metrics.enabled {
        metrics.start().context("failed to start metrics server")?;
    }

    let clock = Arc::new(SystemClock);
    let broker = Arc::new(InMemoryBroker::new(config.broker.clone()).with_clock(clock.clone()));
    let handle = Coordinator::builder()
        .config(config)
        .broker(broker)
        .stores(Stores::in_memory())
        .step_factory(Arc::new(LegStepFactory::default()))
        .clock(clock)
        .start()
        .await
        .context("failed to start coordinator")?;
    info!(tasks = handle.task_count(), "Courier node running");

    shutdown_signal().await?;
    handle.shutdown().await;

    info!("Courier node stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C signal");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
