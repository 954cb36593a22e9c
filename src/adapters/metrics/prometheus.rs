//! Prometheus Metrics Registry - Feed Observability
//!
//! Registers and exposes Prometheus metrics for Grafana dashboards.
//! Covers subscription counts, envelope fan-out and drops, and upstream
//! connection health per network.

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// Why an envelope never reached a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Session outbox was full.
    OutboxFull,
    /// Session outbox was already gone.
    SessionGone,
    /// Subscription retired while the envelope was queued.
    Stale,
    /// Transport refused the push.
    Transport,
}

impl DropReason {
    const fn label(self) -> &'static str {
        match self {
            Self::OutboxFull => "outbox_full",
            Self::SessionGone => "session_gone",
            Self::Stale => "stale",
            Self::Transport => "transport",
        }
    }
}

/// Centralized Prometheus metrics for the relay.
///
/// All metrics follow the naming convention `feed_relay_*`. Each instance
/// owns its own registry, so tests can build as many as they like.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Live subscriptions per feed.
    pub active_subscriptions: IntGaugeVec,
    /// Open client sessions.
    pub active_sessions: IntGauge,
    /// Envelopes handed to session outboxes.
    pub envelopes_published: IntCounterVec,
    /// Envelopes pushed to a transport.
    pub envelopes_delivered: IntCounter,
    /// Envelopes dropped before delivery.
    pub envelopes_dropped: IntCounterVec,
    /// Upstream connection status (1 = connected, 0 = disconnected).
    pub upstream_connected: IntGaugeVec,
    /// Upstream reconnect attempts.
    pub upstream_reconnects: IntCounterVec,
    /// Upstream frames dropped as unparseable or out of schema.
    pub malformed_events: IntCounterVec,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let active_subscriptions = IntGaugeVec::new(
            Opts::new(
                "feed_relay_active_subscriptions",
                "Live subscriptions per network and feed kind",
            ),
            &["network", "feed"],
        )?;

        let active_sessions = IntGauge::new(
            "feed_relay_active_sessions",
            "Open client sessions",
        )?;

        let envelopes_published = IntCounterVec::new(
            Opts::new(
                "feed_relay_envelopes_published_total",
                "Envelopes handed to session outboxes",
            ),
            &["network", "feed"],
        )?;

        let envelopes_delivered = IntCounter::new(
            "feed_relay_envelopes_delivered_total",
            "Envelopes pushed to client transports",
        )?;

        let envelopes_dropped = IntCounterVec::new(
            Opts::new(
                "feed_relay_envelopes_dropped_total",
                "Envelopes dropped before delivery",
            ),
            &["reason"],
        )?;

        let upstream_connected = IntGaugeVec::new(
            Opts::new(
                "feed_relay_upstream_connected",
                "Upstream connection status (1=connected, 0=disconnected)",
            ),
            &["network"],
        )?;

        let upstream_reconnects = IntCounterVec::new(
            Opts::new(
                "feed_relay_upstream_reconnects_total",
                "Upstream reconnect attempts",
            ),
            &["network"],
        )?;

        let malformed_events = IntCounterVec::new(
            Opts::new(
                "feed_relay_malformed_events_total",
                "Upstream frames dropped as malformed",
            ),
            &["network"],
        )?;

        // Register all metrics
        registry.register(Box::new(active_subscriptions.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(envelopes_published.clone()))?;
        registry.register(Box::new(envelopes_delivered.clone()))?;
        registry.register(Box::new(envelopes_dropped.clone()))?;
        registry.register(Box::new(upstream_connected.clone()))?;
        registry.register(Box::new(upstream_reconnects.clone()))?;
        registry.register(Box::new(malformed_events.clone()))?;

        Ok(Self {
            registry,
            active_subscriptions,
            active_sessions,
            envelopes_published,
            envelopes_delivered,
            envelopes_dropped,
            upstream_connected,
            upstream_reconnects,
            malformed_events,
        })
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.envelopes_dropped
            .with_label_values(&[reason.label()])
            .inc();
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.envelopes_dropped
            .with_label_values(&[reason.label()])
            .get()
    }

    /// Render all metrics in the Prometheus text format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Serve Prometheus metrics on the configured bind address.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new().route(
            "/metrics",
            get(move || {
                let metrics = Arc::clone(&metrics_self);
                async move {
                    metrics.render().map_err(|e| {
                        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
                    })
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Prometheus metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
