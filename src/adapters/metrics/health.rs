//! Health Check Server - Liveness and Readiness Endpoints
//!
//! Exposes /live and /ready endpoints via axum 0.7 for container
//! health checks. Readiness requires the feed socket to be accepting
//! clients and every running upstream to be connected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio::sync::broadcast;
use tracing::{info, instrument};

/// Something the readiness check has to ask.
pub trait ReadinessCheck: Send + Sync + 'static {
    fn is_ready(&self) -> bool;
}

/// Shared health state polled by the readiness endpoint.
#[derive(Clone)]
pub struct HealthState {
    /// Whether the feed socket is bound and accepting clients.
    pub accepting: Arc<AtomicBool>,
    /// Upstream connectivity.
    upstreams: Option<Arc<dyn ReadinessCheck>>,
}

impl HealthState {
    /// Not ready until the feed socket reports in.
    pub fn new(upstreams: Option<Arc<dyn ReadinessCheck>>) -> Self {
        Self {
            accepting: Arc::new(AtomicBool::new(false)),
            upstreams,
        }
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::Relaxed);
    }

    /// Check if the relay is ready to serve traffic.
    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
            && self
                .upstreams
                .as_ref()
                .is_none_or(|upstreams| upstreams.is_ready())
    }
}

/// Axum-based health check HTTP server.
pub struct HealthServer {
    /// Health state shared with the feed server.
    state: Arc<HealthState>,
    /// Bind port (default 8080 from config).
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Serve until shutdown.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(address = %addr, "Health server started");

        axum::serve(listener, router(Arc::clone(&self.state)))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
        .with_state(state)
}

/// Liveness check: always returns 200 if the process is running.
async fn liveness() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}
