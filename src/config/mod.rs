//! Configuration Module - TOML-based Relay Configuration
//!
//! Loads and validates configuration from `config.toml`. The network
//! table is read once at startup and is immutable afterwards; the rest
//! of the crate receives it by injection (`NetworkCatalog`), never
//! through a global.

pub mod loader;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::{DuplicatePolicy, NetworkId, ProtocolVersion};

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Service identity and logging.
  pub service: ServiceConfig,
  /// Subscription policy and buffering.
  #[serde(default)]
  pub feeds: FeedsConfig,
  /// Upstream reconnect behaviour.
  #[serde(default)]
  pub upstream: UpstreamConfig,
  /// Client-facing feed socket.
  #[serde(default)]
  pub server: ServerConfig,
  /// Metrics and monitoring.
  #[serde(default)]
  pub metrics: MetricsConfig,
  /// Configured networks.
  pub networks: Vec<NetworkConfig>,
}

/// Service identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
  /// Human-readable instance name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
}

/// Subscription policy.
///
/// Limits are operational parameters; `None` means unlimited.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedsConfig {
  /// Behaviour for a repeated subscribe to the same pair in one session.
  #[serde(default)]
  pub duplicate_policy: DuplicatePolicy,
  /// Envelopes buffered per session before new ones are dropped.
  #[serde(default = "default_outbox_capacity")]
  pub outbox_capacity: usize,
  /// Maximum live subscriptions per session.
  #[serde(default)]
  pub max_subscriptions_per_session: Option<usize>,
  /// Maximum subscribers per (network, feed kind).
  #[serde(default)]
  pub max_subscribers_per_feed: Option<usize>,
  /// Subscribe requests allowed per session per minute.
  #[serde(default)]
  pub subscribe_rate_per_minute: Option<u32>,
  /// Items remembered by the causal gate per feed.
  #[serde(default = "default_causal_window")]
  pub causal_window: usize,
}

impl Default for FeedsConfig {
  fn default() -> Self {
    Self {
      duplicate_policy: DuplicatePolicy::default(),
      outbox_capacity: default_outbox_capacity(),
      max_subscriptions_per_session: None,
      max_subscribers_per_feed: None,
      subscribe_rate_per_minute: None,
      causal_window: default_causal_window(),
    }
  }
}

/// Upstream reconnect configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
  /// First reconnect delay (milliseconds).
  #[serde(default = "default_backoff_base")]
  pub backoff_base_ms: u64,
  /// Reconnect delay ceiling (milliseconds).
  #[serde(default = "default_backoff_cap")]
  pub backoff_cap_ms: u64,
  /// Per-attempt connect timeout (milliseconds).
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout_ms: u64,
}

impl UpstreamConfig {
  pub const fn backoff_base(&self) -> Duration {
    Duration::from_millis(self.backoff_base_ms)
  }

  pub const fn backoff_cap(&self) -> Duration {
    Duration::from_millis(self.backoff_cap_ms)
  }

  pub const fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      backoff_base_ms: default_backoff_base(),
      backoff_cap_ms: default_backoff_cap(),
      connect_timeout_ms: default_connect_timeout(),
    }
  }
}

/// Feed socket server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Bind address for `/ws`.
  #[serde(default = "default_server_addr")]
  pub bind_address: String,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_address: default_server_addr(),
    }
  }
}

/// Metrics and monitoring configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
  /// Enable Prometheus metrics export.
  #[serde(default = "default_true")]
  pub enabled: bool,
  /// Metrics server bind address.
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
  /// Health check endpoint port.
  #[serde(default = "default_health_port")]
  pub health_port: u16,
}

impl Default for MetricsConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      bind_address: default_metrics_addr(),
      health_port: default_health_port(),
    }
  }
}

/// One configured network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkConfig {
  /// Network name clients subscribe with.
  pub name: NetworkId,
  /// Protocol generation of the node group.
  pub protocol: ProtocolVersion,
  /// Where the node's event stream lives.
  pub upstream: UpstreamEndpoint,
}

/// Upstream event source of a network.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpstreamEndpoint {
  /// Push stream over WebSocket (node event bridge).
  Websocket { url: String },
  /// HTTP endpoint polled for new frames.
  Polling {
    url: String,
    #[serde(default = "default_poll_interval")]
    interval_ms: u64,
  },
}

impl UpstreamEndpoint {
  pub fn url(&self) -> &str {
    match self {
      Self::Websocket { url } | Self::Polling { url, .. } => url,
    }
  }
}

/// Read-only lookup of configured networks, injected into the registry.
#[derive(Debug, Clone, Default)]
pub struct NetworkCatalog {
  networks: Arc<HashMap<NetworkId, NetworkConfig>>,
}

impl NetworkCatalog {
  pub fn new(networks: impl IntoIterator<Item = NetworkConfig>) -> Self {
    let networks = networks
      .into_iter()
      .map(|network| (network.name.clone(), network))
      .collect();
    Self {
      networks: Arc::new(networks),
    }
  }

  pub fn get(&self, name: &str) -> Option<&NetworkConfig> {
    self.networks.get(name)
  }

  pub fn protocol(&self, name: &str) -> Option<ProtocolVersion> {
    self.get(name).map(|network| network.protocol)
  }

  pub fn len(&self) -> usize {
    self.networks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.networks.is_empty()
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_true() -> bool {
  true
}

fn default_outbox_capacity() -> usize {
  1024
}

fn default_causal_window() -> usize {
  4096
}

fn default_backoff_base() -> u64 {
  1_000
}

fn default_backoff_cap() -> u64 {
  30_000
}

fn default_connect_timeout() -> u64 {
  10_000
}

fn default_poll_interval() -> u64 {
  2_000
}

fn default_server_addr() -> String {
  "0.0.0.0:4000".to_string()
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}

fn default_health_port() -> u16 {
  8080
}
