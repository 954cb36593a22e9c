//! Metrics and Monitoring Adapters
//!
//! Provides Prometheus metrics export on :9090 and health check
//! endpoints (/live, /ready) via axum 0.7.

pub mod health;
pub mod prometheus;

pub use health::{HealthServer, HealthState, ReadinessCheck};
pub use prometheus::{DropReason, MetricsRegistry};
