//! Error taxonomy for the feed pipeline.

use thiserror::Error;

use super::feed::{FeedKind, NetworkId, ProtocolVersion};

/// Errors raised by the registry, sessions and feed sources.
///
/// Only request-validation variants ever reach a client; upstream faults
/// are retried or dropped inside the feed source.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("network not configured: {0}")]
    UnknownNetwork(NetworkId),

    #[error("feed kind {kind} is not served by {protocol} network {network}")]
    UnsupportedFeedKind {
        network: NetworkId,
        protocol: ProtocolVersion,
        kind: FeedKind,
    },

    #[error("already subscribed to {network}/{kind}")]
    DuplicateSubscription { network: NetworkId, kind: FeedKind },

    #[error("subscriber limit of {limit} reached for {network}/{kind}")]
    SubscriberLimit {
        network: NetworkId,
        kind: FeedKind,
        limit: usize,
    },

    #[error("session subscription limit of {0} reached")]
    SessionLimit(usize),

    #[error("subscribe rate limit exceeded")]
    RateLimited,

    #[error("session is closed")]
    SessionClosed,

    #[error("upstream unavailable for {network}: {reason}")]
    UpstreamUnavailable { network: NetworkId, reason: String },

    #[error("malformed upstream event: {0}")]
    MalformedUpstreamEvent(String),
}

impl FeedError {
    /// Stable machine-readable code sent in error responses.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::UnknownNetwork(_) => "unknown_network",
            Self::UnsupportedFeedKind { .. } => "unsupported_feed_kind",
            Self::DuplicateSubscription { .. } => "duplicate_subscription",
            Self::SubscriberLimit { .. } => "subscriber_limit",
            Self::SessionLimit(_) => "session_limit",
            Self::RateLimited => "rate_limited",
            Self::SessionClosed => "session_closed",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::MalformedUpstreamEvent(_) => "malformed_upstream_event",
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedUpstreamEvent(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offending_pair() {
        let err = FeedError::UnsupportedFeedKind {
            network: "testnet".to_string(),
            protocol: ProtocolVersion::Nova,
            kind: FeedKind::Milestone,
        };
        assert_eq!(
            err.to_string(),
            "feed kind milestone is not served by nova network testnet"
        );
        assert_eq!(err.code(), "unsupported_feed_kind");
    }
}
