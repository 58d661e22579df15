//! Resource allocation broker.
//!
//! Starts the broker against the configured resource-manager backend.
//! Notifications are delivered over HTTP from a dedicated runtime.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rmb_broker::config::Config;
use rmb_broker::connector::build_backend;
use rmb_broker::dispatcher::HttpNotificationSink;
use rmb_broker::BrokerService;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting resource allocation broker");

    let config = Config::from_env()?;
    info!(
        queue = %config.queue,
        backend = config.backend.name(),
        cache_enabled = config.cache.enabled,
        cache_capacity = config.cache.capacity,
        notifier_threads = config.dispatcher.workers,
        heartbeat_ms = config.dispatcher.heartbeat.as_millis() as u64,
        "Configuration loaded"
    );

    // Notification delivery gets its own runtime
    let notifier = runtime::Builder::new_multi_thread()
        .worker_threads(config.dispatcher.workers)
        .thread_name("broker-notifier")
        .enable_all()
        .build()
        .context("failed to build notifier runtime")?;

    // The notifier runtime cannot be dropped here, so it is shut down on
    // every path before the result propagates.
    let result = run(&config, notifier.handle().clone()).await;
    notifier.shutdown_background();

    match &result {
        Ok(()) => info!("Broker shutdown complete"),
        Err(e) => error!(error = %e, "Broker exited with error"),
    }
    result
}

async fn run(config: &Config, notifier: runtime::Handle) -> Result<()> {
    let backend = build_backend(&config.backend);
    let sink = Arc::new(HttpNotificationSink::new(config.delivery_timeout)?);

    BrokerService::serve(config, backend, sink, notifier, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await?;
    Ok(())
}
