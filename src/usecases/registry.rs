//! Feed Registry - Subscription Directory and Fan-out
//!
//! Maps `SubscriptionId → entry` and `(network, feed kind) → ids` behind
//! one lock. Mutations happen under the write guard; `publish` takes a
//! read snapshot and hands envelopes to session outboxes after the guard
//! is gone. The guards are `parking_lot` guards (`!Send`), so holding one
//! across an `.await` does not compile.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::adapters::metrics::{DropReason, MetricsRegistry};
use crate::config::{FeedsConfig, NetworkCatalog};
use crate::domain::{
    FeedError, FeedKey, FeedKind, FeedPayload, SessionId, Subscription, SubscriptionId,
    UpdateEnvelope,
};
use crate::ports::feed_source::{FeedActivation, FeedPublisher};

/// Write half of a session outbox.
pub type EnvelopeSink = mpsc::Sender<UpdateEnvelope>;

/// Registry-wide limits.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryOptions {
    pub max_subscribers_per_feed: Option<usize>,
}

impl From<&FeedsConfig> for RegistryOptions {
    fn from(config: &FeedsConfig) -> Self {
        Self {
            max_subscribers_per_feed: config.max_subscribers_per_feed,
        }
    }
}

struct Entry {
    subscription: Subscription,
    sink: EnvelopeSink,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<SubscriptionId, Entry>,
    by_feed: HashMap<FeedKey, HashSet<SubscriptionId>>,
}

impl RegistryState {
    /// Remove one entry from both maps. Returns the key and whether its
    /// subscriber set is now empty.
    fn remove(&mut self, id: &SubscriptionId) -> Option<(FeedKey, bool)> {
        let entry = self.subscriptions.remove(id)?;
        let key = entry.subscription.key().clone();
        let emptied = match self.by_feed.get_mut(&key) {
            Some(ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if emptied {
            self.by_feed.remove(&key);
        }
        Some((key, emptied))
    }
}

/// Central subscription directory.
pub struct FeedRegistry {
    networks: NetworkCatalog,
    options: RegistryOptions,
    state: RwLock<RegistryState>,
    activation: Arc<dyn FeedActivation>,
    metrics: Arc<MetricsRegistry>,
}

impl FeedRegistry {
    /// Registry with a fixed activation hook.
    pub fn new(
        networks: NetworkCatalog,
        options: RegistryOptions,
        activation: Arc<dyn FeedActivation>,
        metrics: Arc<MetricsRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            networks,
            options,
            state: RwLock::new(RegistryState::default()),
            activation,
            metrics,
        })
    }

    /// Registry whose activation hook publishes back into it.
    ///
    /// `make_activation` receives a weak publisher handle (the registry
    /// itself) so feed sources never keep the registry alive.
    pub fn new_cyclic<F>(
        networks: NetworkCatalog,
        options: RegistryOptions,
        metrics: Arc<MetricsRegistry>,
        make_activation: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn FeedPublisher>) -> Arc<dyn FeedActivation>,
    {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let publisher: Weak<dyn FeedPublisher> = weak.clone();
            Self {
                networks,
                options,
                state: RwLock::new(RegistryState::default()),
                activation: make_activation(publisher),
                metrics,
            }
        })
    }

    pub const fn networks(&self) -> &NetworkCatalog {
        &self.networks
    }

    /// Resolve `feedSelect` against the network's protocol.
    ///
    /// # Errors
    /// `UnknownNetwork` or `UnsupportedFeedKind`.
    pub fn resolve_feed(
        &self,
        network: &str,
        feed_select: Option<FeedKind>,
    ) -> Result<FeedKind, FeedError> {
        let protocol = self
            .networks
            .protocol(network)
            .ok_or_else(|| FeedError::UnknownNetwork(network.to_string()))?;

        let kind = feed_select.unwrap_or_else(|| protocol.default_feed());
        if !protocol.supports(kind) {
            return Err(FeedError::UnsupportedFeedKind {
                network: network.to_string(),
                protocol,
                kind,
            });
        }
        Ok(kind)
    }

    /// Register a subscription for `session`, delivering into `sink`.
    ///
    /// Validation happens before any map is touched, so a failed call
    /// leaves the registry unchanged. Every new subscription re-asserts
    /// activation of its pair, so a source that failed to start is retried.
    ///
    /// # Errors
    /// `UnknownNetwork`, `UnsupportedFeedKind` or `SubscriberLimit`.
    pub fn subscribe(
        &self,
        network: &str,
        kind: FeedKind,
        session: SessionId,
        sink: EnvelopeSink,
    ) -> Result<SubscriptionId, FeedError> {
        let kind = self.resolve_feed(network, Some(kind))?;
        let key = FeedKey::new(network, kind);

        let id = {
            let mut state = self.state.write();

            let current = state.by_feed.get(&key).map_or(0, HashSet::len);
            if let Some(limit) = self.options.max_subscribers_per_feed {
                if current >= limit {
                    return Err(FeedError::SubscriberLimit {
                        network: key.network,
                        kind,
                        limit,
                    });
                }
            }

            let id = loop {
                let candidate = SubscriptionId::generate();
                if !state.subscriptions.contains_key(&candidate) {
                    break candidate;
                }
            };

            state.subscriptions.insert(
                id.clone(),
                Entry {
                    subscription: Subscription::new(id.clone(), key.clone(), session),
                    sink,
                },
            );
            state.by_feed.entry(key.clone()).or_default().insert(id.clone());
            self.activation.acquire(&key);
            id
        };

        self.metrics
            .active_subscriptions
            .with_label_values(&[network, kind.as_str()])
            .inc();
        info!(%session, subscription = %id, feed = %key, "Subscribed");
        Ok(id)
    }

    /// Retire a subscription. Unknown or already-retired ids are a no-op.
    ///
    /// Returns whether anything was removed. Once this returns, no new
    /// envelope is built for `id`.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.remove(id);
            if let Some((key, true)) = &removed {
                self.activation.release(key);
            }
            removed
        };

        match removed {
            Some((key, _)) => {
                self.metrics
                    .active_subscriptions
                    .with_label_values(&[key.network.as_str(), key.kind.as_str()])
                    .dec();
                info!(subscription = %id, feed = %key, "Unsubscribed");
                true
            }
            None => {
                debug!(subscription = %id, "Unsubscribe for unknown id acknowledged");
                false
            }
        }
    }

    /// Retire every subscription owned by `session`.
    pub fn unsubscribe_session(&self, session: SessionId) -> Vec<SubscriptionId> {
        let ids: Vec<SubscriptionId> = {
            let state = self.state.read();
            state
                .subscriptions
                .values()
                .filter(|entry| entry.subscription.session() == session)
                .map(|entry| entry.subscription.id().clone())
                .collect()
        };

        ids.into_iter().filter(|id| self.unsubscribe(id)).collect()
    }

    /// Fan `payload` out to every current subscriber of (network, kind).
    ///
    /// One envelope per subscriber. A full outbox drops the envelope for
    /// that subscriber only; the feed is a live tail, not a durable log.
    pub fn publish(&self, network: &str, kind: FeedKind, payload: FeedPayload) -> usize {
        let key = FeedKey::new(network, kind);

        let targets: Vec<(SubscriptionId, EnvelopeSink)> = {
            let state = self.state.read();
            let Some(ids) = state.by_feed.get(&key) else {
                return 0;
            };
            ids.iter()
                .filter_map(|id| {
                    state
                        .subscriptions
                        .get(id)
                        .map(|entry| (id.clone(), entry.sink.clone()))
                })
                .collect()
        };

        let mut delivered = 0;
        for (id, sink) in targets {
            match sink.try_send(UpdateEnvelope::new(id, payload.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(envelope)) => {
                    self.metrics.record_drop(DropReason::OutboxFull);
                    warn!(
                        subscription = %envelope.subscription_id,
                        feed = %key,
                        "Session outbox full, dropping envelope"
                    );
                }
                Err(TrySendError::Closed(envelope)) => {
                    self.metrics.record_drop(DropReason::SessionGone);
                    debug!(
                        subscription = %envelope.subscription_id,
                        "Session outbox closed, dropping envelope"
                    );
                }
            }
        }

        if delivered > 0 {
            self.metrics
                .envelopes_published
                .with_label_values(&[network, kind.as_str()])
                .inc_by(delivered as u64);
        }
        delivered
    }

    pub fn is_live(&self, id: &SubscriptionId) -> bool {
        self.state.read().subscriptions.contains_key(id)
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.state
            .read()
            .subscriptions
            .get(id)
            .map(|entry| entry.subscription.clone())
    }

    pub fn subscriber_count(&self, network: &str, kind: FeedKind) -> usize {
        self.state
            .read()
            .by_feed
            .get(&FeedKey::new(network, kind))
            .map_or(0, HashSet::len)
    }

    pub fn subscription_count(&self) -> usize {
        self.state.read().subscriptions.len()
    }

    /// Number of (network, feed kind) pairs with at least one subscriber.
    pub fn active_feed_count(&self) -> usize {
        self.state.read().by_feed.len()
    }
}

impl FeedPublisher for FeedRegistry {
    fn publish(&self, network: &str, kind: FeedKind, payload: FeedPayload) -> usize {
        Self::publish(self, network, kind, payload)
    }
}
