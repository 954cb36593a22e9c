//! Transport Port - Client Channel Interface
//!
//! The bidirectional client channel is an outside collaborator: inbound
//! subscribe/unsubscribe requests tagged with a request id, outbound
//! update envelopes tagged with a subscription id, and a disconnect
//! notification that drives session teardown. The core only depends on
//! the `Transport` trait and the wire shapes below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{FeedError, FeedKind, NetworkId, SubscriptionId, UpdateEnvelope};

/// Failure pushing to a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
  /// Peer is gone; the session must close.
  #[error("transport disconnected")]
  Disconnected,
  /// Peer is still there but this push failed.
  #[error("transport send failed: {0}")]
  Send(String),
}

/// Outbound half of a client connection.
///
/// Implementors must preserve call order across both methods: whatever
/// is handed over in sequence reaches the client in that sequence.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  /// Deliver one envelope to the client.
  async fn push(&self, envelope: &UpdateEnvelope) -> Result<(), TransportError>;

  /// Answer one client request.
  async fn respond(&self, response: &ResponseMessage) -> Result<(), TransportError>;
}

/// `{ network, feedSelect? }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
  pub network: NetworkId,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub feed_select: Option<FeedKind>,
}

/// `{ network, subscriptionId, feedSelect }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
  pub network: NetworkId,
  pub subscription_id: SubscriptionId,
  pub feed_select: FeedKind,
}

/// Inbound client frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
  /// Echoed back in the matching response.
  pub request_id: u64,
  #[serde(flatten)]
  pub action: ClientAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientAction {
  Subscribe(SubscribeRequest),
  Unsubscribe(UnsubscribeRequest),
}

/// Answer to one client request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ResponseMessage {
  Subscribed {
    request_id: u64,
    subscription_id: SubscriptionId,
  },
  /// Always sent, even for unknown ids.
  Unsubscribed {
    request_id: u64,
    subscription_id: SubscriptionId,
  },
  Error {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<u64>,
    code: String,
    message: String,
  },
}

impl ResponseMessage {
  /// Error answer for a request that failed validation.
  pub fn rejected(request_id: u64, error: &FeedError) -> Self {
    Self::Error {
      request_id: Some(request_id),
      code: error.code().to_string(),
      message: error.to_string(),
    }
  }

  /// Error answer for a frame that could not be parsed as a request.
  pub fn invalid_request(reason: impl Into<String>) -> Self {
    Self::Error {
      request_id: None,
      code: "invalid_request".to_string(),
      message: reason.into(),
    }
  }
}

/// Outbound client frame. Updates go out as bare envelopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
  Response(ResponseMessage),
  Update(UpdateEnvelope),
}
