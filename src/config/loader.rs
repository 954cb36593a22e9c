//! Configuration Loader - File Loading and Validation
//!
//! Handles loading `config.toml`, validating all parameters,
//! and providing clear error messages for misconfiguration.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use super::{AppConfig, UpstreamEndpoint};

/// Load and validate configuration from a TOML file.
///
/// # Errors
/// Returns detailed error if:
/// - File doesn't exist or can't be read
/// - TOML parsing fails
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let content = std::fs::read_to_string(path)
    .with_context(|| format!("Failed to read config file: {}", path.display()))?;

  let config = parse_config(&content)?;

  info!(
    networks = config.networks.len(),
    duplicate_policy = ?config.feeds.duplicate_policy,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<AppConfig> {
  let config: AppConfig = toml::from_str(content)
    .with_context(|| "Failed to parse config.toml")?;

  validate_config(&config)?;
  Ok(config)
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - At least one network, unique non-empty names
/// - Non-empty upstream URLs with a matching scheme
/// - Sane backoff and buffer sizes
/// - Limits, when present, are non-zero
fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(
    !config.networks.is_empty(),
    "At least one network must be configured"
  );

  let mut seen = HashSet::new();
  for (i, network) in config.networks.iter().enumerate() {
    anyhow::ensure!(
      !network.name.is_empty(),
      "Network {} has an empty name",
      i
    );
    anyhow::ensure!(
      seen.insert(network.name.as_str()),
      "Network {} is configured twice",
      network.name
    );

    let url = network.upstream.url();
    anyhow::ensure!(
      !url.is_empty(),
      "Network {} has an empty upstream url",
      network.name
    );
    match &network.upstream {
      UpstreamEndpoint::Websocket { url } => anyhow::ensure!(
        url.starts_with("ws://") || url.starts_with("wss://"),
        "Network {} websocket upstream must use ws:// or wss://, got {}",
        network.name,
        url
      ),
      UpstreamEndpoint::Polling { url, interval_ms } => {
        anyhow::ensure!(
          url.starts_with("http://") || url.starts_with("https://"),
          "Network {} polling upstream must use http:// or https://, got {}",
          network.name,
          url
        );
        anyhow::ensure!(
          *interval_ms > 0,
          "Network {} polling interval must be positive",
          network.name
        );
      }
    }
  }

  // Upstream validation
  anyhow::ensure!(
    config.upstream.backoff_base_ms > 0,
    "backoff_base_ms must be positive"
  );
  anyhow::ensure!(
    config.upstream.backoff_cap_ms >= config.upstream.backoff_base_ms,
    "backoff_cap_ms ({}) must be >= backoff_base_ms ({})",
    config.upstream.backoff_cap_ms,
    config.upstream.backoff_base_ms
  );
  anyhow::ensure!(
    config.upstream.connect_timeout_ms > 0,
    "connect_timeout_ms must be positive"
  );

  // Feed policy validation
  anyhow::ensure!(
    config.feeds.outbox_capacity > 0,
    "outbox_capacity must be positive"
  );
  anyhow::ensure!(
    config.feeds.causal_window > 0,
    "causal_window must be positive"
  );
  anyhow::ensure!(
    config.feeds.max_subscriptions_per_session != Some(0),
    "max_subscriptions_per_session must be positive when set"
  );
  anyhow::ensure!(
    config.feeds.max_subscribers_per_feed != Some(0),
    "max_subscribers_per_feed must be positive when set"
  );
  anyhow::ensure!(
    config.feeds.subscribe_rate_per_minute != Some(0),
    "subscribe_rate_per_minute must be positive when set"
  );

  Ok(())
}
