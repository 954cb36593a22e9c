//! Subscription identity and lifecycle types.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::feed::{FeedKey, FeedKind, NetworkId};

/// Opaque routing token handed to the client at subscribe time.
///
/// Generated from 122 random bits, never from a counter, so a client
/// cannot guess ids belonging to other sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SubscriptionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client's interest in one (network, feed kind) pair.
///
/// Fields are private: network and feed kind are fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    key: FeedKey,
    session: SessionId,
}

impl Subscription {
    pub const fn new(id: SubscriptionId, key: FeedKey, session: SessionId) -> Self {
        Self { id, key, session }
    }

    pub const fn id(&self) -> &SubscriptionId {
        &self.id
    }

    pub const fn key(&self) -> &FeedKey {
        &self.key
    }

    pub fn network(&self) -> &NetworkId {
        &self.key.network
    }

    pub const fn feed_kind(&self) -> FeedKind {
        self.key.kind
    }

    pub const fn session(&self) -> SessionId {
        self.session
    }
}

/// What a session does with a second subscribe for a pair it already holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Fail with `DuplicateSubscription`.
    Reject,
    /// Answer with the id of the live subscription.
    #[default]
    ReturnExisting,
}
