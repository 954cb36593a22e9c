//! Subscription Session - Per-connection State Machine
//!
//! `Idle → Subscribed → Closed`. A session owns its subscriptions, a
//! bounded outbox the registry publishes into, and one delivery task that
//! drains the outbox into the client's `Transport`.
//!
//! The delivery task checks the live-id gate under the gate lock before
//! every push. `unsubscribe` and `close` take the same lock, so once
//! either returns no envelope for the retired ids reaches the transport,
//! even if it was already queued.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::registry::{EnvelopeSink, FeedRegistry};
use crate::adapters::metrics::{DropReason, MetricsRegistry};
use crate::config::FeedsConfig;
use crate::domain::{
    DuplicatePolicy, FeedError, FeedKey, SessionId, SubscriptionId, UpdateEnvelope,
};
use crate::ports::transport::{
    ClientAction, ClientMessage, ResponseMessage, SubscribeRequest, Transport, TransportError,
    UnsubscribeRequest,
};

/// Per-session policy.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub duplicate_policy: DuplicatePolicy,
    pub max_subscriptions: Option<usize>,
    pub subscribe_rate_per_minute: Option<u32>,
    pub outbox_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&FeedsConfig::default())
    }
}

impl From<&FeedsConfig> for SessionOptions {
    fn from(config: &FeedsConfig) -> Self {
        Self {
            duplicate_policy: config.duplicate_policy,
            max_subscriptions: config.max_subscriptions_per_session,
            subscribe_rate_per_minute: config.subscribe_rate_per_minute,
            outbox_capacity: config.outbox_capacity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No live subscriptions.
    Idle,
    /// At least one live subscription.
    Subscribed,
    /// Terminal.
    Closed,
}

#[derive(Debug, Default)]
struct DeliveryGate {
    live: HashSet<SubscriptionId>,
    closed: bool,
}

/// One client's subscriptions and delivery pipeline.
pub struct SubscriptionSession {
    id: SessionId,
    state: SessionState,
    registry: Arc<FeedRegistry>,
    options: SessionOptions,
    owned: HashMap<FeedKey, SubscriptionId>,
    transport: Arc<dyn Transport>,
    gate: Arc<Mutex<DeliveryGate>>,
    outbox: EnvelopeSink,
    delivery: JoinHandle<()>,
    limiter: Option<DefaultDirectRateLimiter>,
    metrics: Arc<MetricsRegistry>,
}

impl SubscriptionSession {
    /// Open a session and spawn its delivery task.
    pub fn open(
        registry: Arc<FeedRegistry>,
        transport: Arc<dyn Transport>,
        options: SessionOptions,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let id = SessionId::generate();
        let (outbox, outbox_rx) = mpsc::channel(options.outbox_capacity.max(1));
        let gate = Arc::new(Mutex::new(DeliveryGate::default()));

        let delivery = tokio::spawn(deliver(
            id,
            outbox_rx,
            Arc::clone(&gate),
            Arc::clone(&transport),
            Arc::clone(&metrics),
        ));

        let limiter = options
            .subscribe_rate_per_minute
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_minute(rate)));

        metrics.active_sessions.inc();
        info!(session = %id, "Session opened");

        Self {
            id,
            state: SessionState::Idle,
            registry,
            options,
            owned: HashMap::new(),
            transport,
            gate,
            outbox,
            delivery,
            limiter,
            metrics,
        }
    }

    pub const fn id(&self) -> SessionId {
        self.id
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.owned.values().cloned().collect()
    }

    /// Subscribe to one (network, feed kind) pair.
    ///
    /// Any error leaves the session exactly as it was.
    ///
    /// # Errors
    /// `SessionClosed`, `RateLimited`, `UnknownNetwork`,
    /// `UnsupportedFeedKind`, `DuplicateSubscription`, `SessionLimit`,
    /// `SubscriberLimit`.
    pub async fn subscribe(
        &mut self,
        request: &SubscribeRequest,
    ) -> Result<SubscriptionId, FeedError> {
        self.subscribe_with(request, None).await
    }

    /// Subscribe, optionally acknowledging request `ack` through the
    /// transport. A new subscription's ack is sent before its id is
    /// released to the delivery task, so the client always learns the
    /// id before the first envelope carrying it.
    #[instrument(skip(self), fields(session = %self.id))]
    async fn subscribe_with(
        &mut self,
        request: &SubscribeRequest,
        ack: Option<u64>,
    ) -> Result<SubscriptionId, FeedError> {
        if self.state == SessionState::Closed {
            return Err(FeedError::SessionClosed);
        }

        let kind = self
            .registry
            .resolve_feed(&request.network, request.feed_select)?;
        let key = FeedKey::new(request.network.clone(), kind);

        if let Some(existing) = self.owned.get(&key).cloned() {
            return match self.options.duplicate_policy {
                DuplicatePolicy::ReturnExisting => {
                    debug!(subscription = %existing, "Duplicate subscribe, returning existing id");
                    if let Some(request_id) = ack {
                        self.acknowledge(request_id, &existing).await;
                    }
                    Ok(existing)
                }
                DuplicatePolicy::Reject => Err(FeedError::DuplicateSubscription {
                    network: key.network,
                    kind,
                }),
            };
        }

        if let Some(max) = self.options.max_subscriptions {
            if self.owned.len() >= max {
                return Err(FeedError::SessionLimit(max));
            }
        }

        // Validated requests only; rejected ones leave the quota alone.
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                warn!("Subscribe rate limit exceeded");
                return Err(FeedError::RateLimited);
            }
        }

        let id = {
            let mut gate = self.gate.lock().await;
            if gate.closed {
                return Err(FeedError::SessionClosed);
            }
            let id = self
                .registry
                .subscribe(&key.network, kind, self.id, self.outbox.clone())?;
            if let Some(request_id) = ack {
                let response = ResponseMessage::Subscribed {
                    request_id,
                    subscription_id: id.clone(),
                };
                if let Err(e) = self.transport.respond(&response).await {
                    debug!(error = %e, "Subscribe ack not delivered");
                    if e == TransportError::Disconnected {
                        gate.closed = true;
                    }
                }
            }
            gate.live.insert(id.clone());
            id
        };

        self.owned.insert(key, id.clone());
        self.state = SessionState::Subscribed;
        Ok(id)
    }

    async fn acknowledge(&self, request_id: u64, subscription_id: &SubscriptionId) {
        let response = ResponseMessage::Subscribed {
            request_id,
            subscription_id: subscription_id.clone(),
        };
        if let Err(e) = self.transport.respond(&response).await {
            debug!(error = %e, "Subscribe ack not delivered");
        }
    }

    /// Retire one of this session's subscriptions.
    ///
    /// Always an acknowledgement: ids this session does not own (unknown,
    /// retired, or another session's) are ignored. Returns whether a
    /// subscription was actually retired.
    #[instrument(skip(self), fields(session = %self.id))]
    pub async fn unsubscribe(&mut self, request: &UnsubscribeRequest) -> bool {
        let owned_key = self
            .owned
            .iter()
            .find(|(_, id)| **id == request.subscription_id)
            .map(|(key, _)| key.clone());

        let Some(key) = owned_key else {
            debug!(subscription = %request.subscription_id, "Unsubscribe for id not owned here");
            return false;
        };

        if key.network != request.network || key.kind != request.feed_select {
            debug!(
                subscription = %request.subscription_id,
                feed = %key,
                "Unsubscribe parameters differ from subscription, retiring by id"
            );
        }

        if let Some(id) = self.owned.remove(&key) {
            self.gate.lock().await.live.remove(&id);
            self.registry.unsubscribe(&id);
        }

        if self.owned.is_empty() && self.state == SessionState::Subscribed {
            self.state = SessionState::Idle;
        }
        true
    }

    /// Tear the session down: retire every subscription and stop delivery.
    ///
    /// Idempotent. Nothing is pushed to the transport after this returns.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }

        {
            let mut gate = self.gate.lock().await;
            gate.closed = true;
            gate.live.clear();
        }

        let retired = self.owned.len();
        for (_, id) in self.owned.drain() {
            self.registry.unsubscribe(&id);
        }

        let swept = self.registry.unsubscribe_session(self.id);
        if !swept.is_empty() {
            warn!(session = %self.id, count = swept.len(), "Swept untracked subscriptions");
        }

        self.delivery.abort();
        self.state = SessionState::Closed;
        self.metrics.active_sessions.dec();
        info!(session = %self.id, retired, "Session closed");
    }

    /// Execute one client request and answer it through the transport.
    ///
    /// # Errors
    /// The transport failure, if the answer could not be sent.
    pub async fn handle(&mut self, message: ClientMessage) -> Result<(), TransportError> {
        let request_id = message.request_id;
        match message.action {
            ClientAction::Subscribe(request) => {
                match self.subscribe_with(&request, Some(request_id)).await {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.transport
                            .respond(&ResponseMessage::rejected(request_id, &e))
                            .await
                    }
                }
            }
            ClientAction::Unsubscribe(request) => {
                self.unsubscribe(&request).await;
                self.transport
                    .respond(&ResponseMessage::Unsubscribed {
                        request_id,
                        subscription_id: request.subscription_id,
                    })
                    .await
            }
        }
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.delivery.abort();
        // Busy gate: delivery is parked in a push, which the abort cancels.
        if let Ok(mut gate) = self.gate.try_lock() {
            gate.closed = true;
            gate.live.clear();
        }
        for id in self.owned.values() {
            self.registry.unsubscribe(id);
        }
        self.metrics.active_sessions.dec();
        debug!(session = %self.id, "Session dropped without close");
    }
}

/// Drain the outbox into the transport, one envelope at a time.
async fn deliver(
    session: SessionId,
    mut outbox: mpsc::Receiver<UpdateEnvelope>,
    gate: Arc<Mutex<DeliveryGate>>,
    transport: Arc<dyn Transport>,
    metrics: Arc<MetricsRegistry>,
) {
    while let Some(envelope) = outbox.recv().await {
        let mut guard = gate.lock().await;
        if guard.closed {
            break;
        }
        if !guard.live.contains(&envelope.subscription_id) {
            metrics.record_drop(DropReason::Stale);
            debug!(%session, subscription = %envelope.subscription_id, "Dropping envelope for retired subscription");
            continue;
        }

        match transport.push(&envelope).await {
            Ok(()) => metrics.envelopes_delivered.inc(),
            Err(TransportError::Disconnected) => {
                guard.closed = true;
                metrics.record_drop(DropReason::Transport);
                warn!(%session, "Transport disconnected, stopping delivery");
                break;
            }
            Err(e) => {
                metrics.record_drop(DropReason::Transport);
                warn!(%session, error = %e, "Push failed, envelope dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkCatalog, NetworkConfig, UpstreamEndpoint};
    use crate::domain::{FeedKind, FeedPayload, ProtocolVersion, SlotFinalized};
    use crate::ports::feed_source::NoActivation;
    use crate::ports::transport::ServerMessage;
    use crate::usecases::registry::RegistryOptions;
    use async_trait::async_trait;
    use std::time::Duration;

    struct ChannelTransport(mpsc::UnboundedSender<ServerMessage>);

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn push(&self, envelope: &UpdateEnvelope) -> Result<(), TransportError> {
            self.0
                .send(ServerMessage::Update(envelope.clone()))
                .map_err(|_| TransportError::Disconnected)
        }

        async fn respond(&self, response: &ResponseMessage) -> Result<(), TransportError> {
            self.0
                .send(ServerMessage::Response(response.clone()))
                .map_err(|_| TransportError::Disconnected)
        }
    }

    type Outbound = mpsc::UnboundedReceiver<ServerMessage>;

    fn setup(
        options: SessionOptions,
    ) -> (Arc<FeedRegistry>, SubscriptionSession, Outbound, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let catalog = NetworkCatalog::new([NetworkConfig {
            name: "testnet".to_string(),
            protocol: ProtocolVersion::Nova,
            upstream: UpstreamEndpoint::Websocket {
                url: "ws://localhost:1".to_string(),
            },
        }]);
        let registry = FeedRegistry::new(
            catalog,
            RegistryOptions::default(),
            Arc::new(NoActivation),
            Arc::clone(&metrics),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let session = SubscriptionSession::open(
            Arc::clone(&registry),
            Arc::new(ChannelTransport(tx)),
            options,
            Arc::clone(&metrics),
        );
        (registry, session, rx, metrics)
    }

    fn request(feed: Option<FeedKind>) -> SubscribeRequest {
        SubscribeRequest {
            network: "testnet".to_string(),
            feed_select: feed,
        }
    }

    fn unsubscribe(id: SubscriptionId, feed: FeedKind) -> UnsubscribeRequest {
        UnsubscribeRequest {
            network: "testnet".to_string(),
            subscription_id: id,
            feed_select: feed,
        }
    }

    fn slot(index: u64) -> FeedPayload {
        FeedPayload::SlotFinalized(SlotFinalized {
            slot_index: index,
            commitment_id: None,
        })
    }

    async fn next(rx: &mut Outbound) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (registry, mut session, _rx, _) = setup(SessionOptions::default());
        assert_eq!(session.state(), SessionState::Idle);

        let id = session.subscribe(&request(None)).await.unwrap();
        assert_eq!(session.state(), SessionState::Subscribed);
        assert_eq!(registry.subscriber_count("testnet", FeedKind::Block), 1);

        assert!(session.unsubscribe(&unsubscribe(id, FeedKind::Block)).await);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_request_leaves_session_untouched() {
        let (registry, mut session, _rx, _) = setup(SessionOptions::default());

        let err = session
            .subscribe(&request(Some(FeedKind::Milestone)))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::UnsupportedFeedKind { .. }));

        let err = session
            .subscribe(&SubscribeRequest {
                network: "unknown".to_string(),
                feed_select: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, FeedError::UnknownNetwork("unknown".to_string()));

        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.subscription_ids().is_empty());
        assert_eq!(registry.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_policy_return_existing() {
        let (registry, mut session, _rx, _) = setup(SessionOptions::default());
        let first = session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        let second = session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_policy_reject() {
        let options = SessionOptions {
            duplicate_policy: DuplicatePolicy::Reject,
            ..SessionOptions::default()
        };
        let (registry, mut session, _rx, _) = setup(options);
        session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        let err = session
            .subscribe(&request(Some(FeedKind::Block)))
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::DuplicateSubscription { .. }));
        assert_eq!(registry.subscription_count(), 1);

        session
            .subscribe(&request(Some(FeedKind::SlotBlocks)))
            .await
            .unwrap();
        assert_eq!(registry.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_envelopes_reach_transport_in_order() {
        let (registry, mut session, mut rx, _) = setup(SessionOptions::default());
        let id = session
            .subscribe(&request(Some(FeedKind::CommitmentsLatest)))
            .await
            .unwrap();

        for index in 1..=5 {
            registry.publish("testnet", FeedKind::CommitmentsLatest, slot(index));
        }

        for index in 1..=5 {
            let ServerMessage::Update(envelope) = next(&mut rx).await else {
                panic!("expected an update");
            };
            assert_eq!(envelope.subscription_id, id);
            assert_eq!(envelope.payload, slot(index));
        }
    }

    #[tokio::test]
    async fn test_ack_precedes_first_envelope() {
        let (registry, mut session, mut rx, _) = setup(SessionOptions::default());
        session
            .handle(ClientMessage {
                request_id: 1,
                action: ClientAction::Subscribe(request(Some(FeedKind::SlotBlocks))),
            })
            .await
            .unwrap();
        registry.publish("testnet", FeedKind::SlotBlocks, slot(1));

        let ServerMessage::Response(ResponseMessage::Subscribed { subscription_id, .. }) =
            next(&mut rx).await
        else {
            panic!("expected the subscribe ack first");
        };
        let ServerMessage::Update(envelope) = next(&mut rx).await else {
            panic!("expected an update");
        };
        assert_eq!(envelope.subscription_id, subscription_id);
    }

    #[tokio::test]
    async fn test_queued_envelope_dropped_after_unsubscribe() {
        let (registry, mut session, mut rx, metrics) = setup(SessionOptions::default());
        let id = session.subscribe(&request(None)).await.unwrap();

        // Queued in the outbox but not yet delivered.
        assert_eq!(registry.publish("testnet", FeedKind::Block, slot(1)), 1);
        session.unsubscribe(&unsubscribe(id, FeedKind::Block)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.dropped(DropReason::Stale), 1);
    }

    #[tokio::test]
    async fn test_close_retires_everything() {
        let (registry, mut session, _rx, metrics) = setup(SessionOptions::default());
        session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        session
            .subscribe(&request(Some(FeedKind::SlotBlocks)))
            .await
            .unwrap();
        assert_eq!(metrics.active_sessions.get(), 1);

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(metrics.active_sessions.get(), 0);
        assert_eq!(
            session.subscribe(&request(None)).await,
            Err(FeedError::SessionClosed)
        );
    }

    #[tokio::test]
    async fn test_drop_without_close_retires_subscriptions() {
        let (registry, mut session, mut rx, _) = setup(SessionOptions::default());
        session.subscribe(&request(None)).await.unwrap();
        drop(session);
        assert_eq!(registry.subscription_count(), 0);

        assert_eq!(registry.publish("testnet", FeedKind::Block, slot(1)), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let options = SessionOptions {
            max_subscriptions: Some(1),
            ..SessionOptions::default()
        };
        let (_registry, mut session, _rx, _) = setup(options);
        session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        assert_eq!(
            session.subscribe(&request(Some(FeedKind::SlotBlocks))).await,
            Err(FeedError::SessionLimit(1))
        );
    }

    #[tokio::test]
    async fn test_subscribe_rate_limit() {
        let options = SessionOptions {
            subscribe_rate_per_minute: Some(1),
            ..SessionOptions::default()
        };
        let (_registry, mut session, _rx, _) = setup(options);
        session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        assert_eq!(
            session.subscribe(&request(Some(FeedKind::SlotBlocks))).await,
            Err(FeedError::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_rejected_request_does_not_use_quota() {
        let options = SessionOptions {
            subscribe_rate_per_minute: Some(1),
            ..SessionOptions::default()
        };
        let (registry, mut session, _rx, _) = setup(options);

        assert!(matches!(
            session.subscribe(&request(Some(FeedKind::Milestone))).await,
            Err(FeedError::UnsupportedFeedKind { .. })
        ));
        let unknown = SubscribeRequest {
            network: "devnet".to_string(),
            feed_select: None,
        };
        assert!(matches!(
            session.subscribe(&unknown).await,
            Err(FeedError::UnknownNetwork(_))
        ));

        let id = session.subscribe(&request(Some(FeedKind::Block))).await.unwrap();
        assert!(registry.is_live(&id));
        assert_eq!(
            session.subscribe(&request(Some(FeedKind::SlotBlocks))).await,
            Err(FeedError::RateLimited)
        );
    }

    #[tokio::test]
    async fn test_handle_answers_every_request() {
        let (_registry, mut session, mut rx, _) = setup(SessionOptions::default());
        session
            .handle(ClientMessage {
                request_id: 9,
                action: ClientAction::Subscribe(SubscribeRequest {
                    network: "nowhere".to_string(),
                    feed_select: None,
                }),
            })
            .await
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            ServerMessage::Response(ResponseMessage::Error {
                request_id: Some(9),
                code: "unknown_network".to_string(),
                message: "network not configured: nowhere".to_string(),
            })
        );

        session
            .handle(ClientMessage {
                request_id: 10,
                action: ClientAction::Unsubscribe(unsubscribe(
                    SubscriptionId::from("stale"),
                    FeedKind::Block,
                )),
            })
            .await
            .unwrap();
        assert!(matches!(
            next(&mut rx).await,
            ServerMessage::Response(ResponseMessage::Unsubscribed { request_id: 10, .. })
        ));
    }
}
