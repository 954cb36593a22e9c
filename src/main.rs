//! Ledger Feed Relay - Entry Point
//!
//! Initializes configuration, logging, metrics and the feed pipeline,
//! then serves the client feed socket until SIGINT.
//!
//! Wiring sequence:
//! 1. Load config.toml + validate
//! 2. Init tracing (JSON structured logging)
//! 3. Create Prometheus registry
//! 4. Build FeedRegistry with the AdapterSupervisor as its activation hook
//! 5. Spawn metrics server (/metrics) and health server (/live + /ready)
//! 6. Spawn feed socket server (/ws)
//! 7. Wait for SIGINT → graceful shutdown (stop accepting → stop sources → exit)

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

use ledger_feed_relay::adapters::metrics::{HealthServer, HealthState, MetricsRegistry, ReadinessCheck};
use ledger_feed_relay::adapters::transport::FeedServer;
use ledger_feed_relay::adapters::upstream::NodeSourceFactory;
use ledger_feed_relay::config::{self, NetworkCatalog};
use ledger_feed_relay::ports::feed_source::FeedActivation;
use ledger_feed_relay::usecases::{AdapterSupervisor, FeedRegistry, RegistryOptions, SessionOptions};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration from config.toml ──────────────
    let config = config::loader::load_config("config.toml")
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.service.log_level)),
        )
        .json()
        .init();

    info!(
        name = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        networks = config.networks.len(),
        duplicate_policy = ?config.feeds.duplicate_policy,
        "Starting ledger feed relay"
    );

    // ── 3. Shutdown channel + metrics ───────────────────────
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to register metrics")?);

    // ── 4. Registry + lazily started feed sources ───────────
    let networks = NetworkCatalog::new(config.networks.clone());
    let factory = Arc::new(NodeSourceFactory::new(config.upstream.connect_timeout()));

    let mut supervisor = None;
    let registry = FeedRegistry::new_cyclic(
        networks.clone(),
        RegistryOptions::from(&config.feeds),
        Arc::clone(&metrics),
        |publisher| {
            let built = Arc::new(AdapterSupervisor::new(
                factory,
                networks.clone(),
                publisher,
                config.upstream.clone(),
                config.feeds.causal_window,
                Arc::clone(&metrics),
            ));
            supervisor = Some(Arc::clone(&built));
            let activation: Arc<dyn FeedActivation> = built;
            activation
        },
    );
    let supervisor = supervisor.context("Feed source supervisor was not constructed")?;

    // ── 5. Metrics and health servers ───────────────────────
    let metrics_handle = if config.metrics.enabled {
        let metrics_ref = Arc::clone(&metrics);
        let bind_address = config.metrics.bind_address.clone();
        let metrics_shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_ref.serve(bind_address, metrics_shutdown).await {
                error!(error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    let upstreams: Arc<dyn ReadinessCheck> = supervisor.clone();
    let health = Arc::new(HealthState::new(Some(upstreams)));
    let health_server = HealthServer::new(Arc::clone(&health), config.metrics.health_port);
    let health_shutdown = shutdown_tx.subscribe();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health_server.run(health_shutdown).await {
            error!(error = %e, "Health server failed");
        }
    });

    // ── 6. Client feed socket ───────────────────────────────
    let feed_server = FeedServer::new(
        Arc::clone(&registry),
        SessionOptions::from(&config.feeds),
        Arc::clone(&metrics),
        Arc::clone(&health),
        config.server.bind_address.clone(),
    );
    let server_shutdown = shutdown_tx.subscribe();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = feed_server.run(server_shutdown).await {
            error!(error = %e, "Feed socket server failed");
        }
    });

    info!("All tasks spawned, relay is running");

    // ── 7. Wait for SIGINT ──────────────────────────────────
    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("SIGINT received, initiating graceful shutdown");

    // 1. Stop accepting clients; open sockets drain and close their sessions
    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(10), server_handle).await;

    // 2. Stop every upstream connection
    supervisor.shutdown_all().await;
    info!(
        open_subscriptions = registry.subscription_count(),
        "Feed sources stopped"
    );

    // 3. Stop health and metrics servers
    health_handle.abort();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}
