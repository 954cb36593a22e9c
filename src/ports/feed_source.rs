//! Feed Source Port - Upstream Event Interfaces
//!
//! Splits an adapter into two capabilities: the connector owns raw I/O
//! with the node's event source, the protocol adapter turns raw frames
//! into normalized events. The generic feed source runner in
//! `usecases::feed_source` glues them to the registry through
//! `FeedPublisher`, so registry and session logic exist once for all
//! protocol generations.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::config::NetworkConfig;
use crate::domain::{FeedError, FeedKey, FeedKind, FeedPayload, ProtocolVersion};

/// One raw message from a node event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFrame {
  Text(String),
  Binary(Vec<u8>),
}

impl UpstreamFrame {
  /// Frame body as UTF-8.
  ///
  /// # Errors
  /// `MalformedUpstreamEvent` when a binary frame is not valid UTF-8.
  pub fn as_text(&self) -> Result<&str, FeedError> {
    match self {
      Self::Text(text) => Ok(text),
      Self::Binary(bytes) => std::str::from_utf8(bytes)
        .map_err(|e| FeedError::malformed(format!("binary frame is not utf-8: {e}"))),
    }
  }
}

/// Live stream of frames. Ends (or yields an error) on disconnect.
pub type FrameStream = BoxStream<'static, anyhow::Result<UpstreamFrame>>;

/// Opens connections to one network's node event source.
#[async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
  /// Connect and subscribe to `topics`.
  ///
  /// Called again after every disconnect; each call is one attempt.
  async fn connect(&self, topics: &[&'static str]) -> anyhow::Result<FrameStream>;
}

/// A normalized event bound for one feed kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEvent {
  pub kind: FeedKind,
  pub payload: FeedPayload,
}

impl SourceEvent {
  pub const fn new(kind: FeedKind, payload: FeedPayload) -> Self {
    Self { kind, payload }
  }
}

/// Per-generation classification of raw frames.
pub trait ProtocolAdapter: Send + Sync + 'static {
  fn protocol(&self) -> ProtocolVersion;

  /// Upstream topics this generation listens on.
  fn topics(&self) -> &'static [&'static str];

  /// Classify one frame into zero or more events, in causal order.
  ///
  /// # Errors
  /// `MalformedUpstreamEvent` for unparseable or out-of-schema frames.
  fn classify(&self, frame: &UpstreamFrame) -> Result<Vec<SourceEvent>, FeedError>;
}

/// Builds the adapter pair for a configured network.
pub trait SourceFactory: Send + Sync + 'static {
  fn protocol_adapter(&self, network: &NetworkConfig) -> Arc<dyn ProtocolAdapter>;

  fn connector(&self, network: &NetworkConfig) -> anyhow::Result<Arc<dyn UpstreamConnector>>;
}

/// Lazy start/stop hook the registry drives per (network, feed kind).
///
/// `acquire` is called for every new subscription of a pair and must be
/// idempotent; `release` when the pair loses its last subscriber. Both
/// run under the registry's map lock and must not block.
pub trait FeedActivation: Send + Sync + 'static {
  fn acquire(&self, key: &FeedKey);

  fn release(&self, key: &FeedKey);
}

/// Activation that never starts anything; for registries fed by hand.
#[derive(Debug, Default)]
pub struct NoActivation;

impl FeedActivation for NoActivation {
  fn acquire(&self, _key: &FeedKey) {}

  fn release(&self, _key: &FeedKey) {}
}

/// Fan-out entry point used by feed sources.
pub trait FeedPublisher: Send + Sync + 'static {
  /// Deliver `payload` to every live subscriber of (network, kind).
  ///
  /// Returns the number of envelopes handed to sessions.
  fn publish(&self, network: &str, kind: FeedKind, payload: FeedPayload) -> usize;
}
