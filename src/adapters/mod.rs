//! Adapters Layer - Hexagonal Architecture Outer Ring
//!
//! Implements the port traits defined in `crate::ports` with concrete
//! external dependencies (WebSockets, HTTP polling, axum servers).
//! Each sub-module groups adapters by infrastructure concern.
//!
//! Adapter categories:
//! - `protocols`: per-generation frame classification (og, Chrysalis, Stardust, Nova)
//! - `upstream`: node event source connectors (WebSocket, HTTP polling)
//! - `transport`: client-facing feed socket
//! - `metrics`: Prometheus metrics export and health checks

pub mod metrics;
pub mod protocols;
pub mod transport;
pub mod upstream;
