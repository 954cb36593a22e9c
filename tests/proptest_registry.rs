//! Property-Based Tests - Registry, Backoff and Causal Ordering
//!
//! Uses `proptest` to drive the registry with random subscribe /
//! unsubscribe / publish sequences and check it against a plain model,
//! and to check the reconnect schedule and the causal gate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::mpsc;

use ledger_feed_relay::adapters::metrics::MetricsRegistry;
use ledger_feed_relay::config::{NetworkCatalog, NetworkConfig, UpstreamEndpoint};
use ledger_feed_relay::domain::{
    BlockMetadataUpdate, BlockUpdate, FeedKey, FeedKind, FeedPayload, ItemMetadata,
    MilestoneUpdate, ProtocolVersion, SessionId, SubscriptionId, UpdateEnvelope,
};
use ledger_feed_relay::ports::feed_source::{NoActivation, SourceEvent};
use ledger_feed_relay::usecases::{Backoff, CausalGate, FeedRegistry, RegistryOptions};

const NETWORKS: [(&str, ProtocolVersion); 3] = [
    ("legacy", ProtocolVersion::Og),
    ("mainnet", ProtocolVersion::Stardust),
    ("testnet", ProtocolVersion::Nova),
];

fn registry() -> Arc<FeedRegistry> {
    let catalog = NetworkCatalog::new(NETWORKS.iter().map(|(name, protocol)| NetworkConfig {
        name: (*name).to_string(),
        protocol: *protocol,
        upstream: UpstreamEndpoint::Websocket {
            url: format!("ws://{name}.invalid"),
        },
    }));
    FeedRegistry::new(
        catalog,
        RegistryOptions::default(),
        Arc::new(NoActivation),
        Arc::new(MetricsRegistry::new().unwrap()),
    )
}

fn milestone(index: u32) -> FeedPayload {
    FeedPayload::MilestoneUpdate(MilestoneUpdate {
        milestone_id: None,
        milestone_index: index,
        timestamp: 0,
    })
}

#[derive(Debug, Clone)]
enum Op {
    /// Network index (3 = unconfigured) and feed kind.
    Subscribe(usize, FeedKind),
    /// Index into the ids handed out so far, or an id never issued.
    Unsubscribe(Option<usize>),
    Publish(usize, FeedKind),
}

fn feed_kind() -> impl Strategy<Value = FeedKind> {
    prop::sample::select(FeedKind::ALL.to_vec())
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0usize..4, feed_kind()).prop_map(|(net, kind)| Op::Subscribe(net, kind)),
        2 => prop::option::of(0usize..32).prop_map(Op::Unsubscribe),
        2 => (0usize..3, feed_kind()).prop_map(|(net, kind)| Op::Publish(net, kind)),
    ]
}

fn network_name(index: usize) -> &'static str {
    NETWORKS.get(index).map_or("ghost", |(name, _)| *name)
}

struct Issued {
    id: SubscriptionId,
    key: FeedKey,
    rx: mpsc::Receiver<UpdateEnvelope>,
    live: bool,
}

// ── Registry Properties ─────────────────────────────────────

proptest! {
    /// Registry state always matches a simple model, retired ids never
    /// receive envelopes, and every live subscriber gets exactly one
    /// envelope per publish.
    #[test]
    fn registry_matches_model(ops in prop::collection::vec(op(), 1..64)) {
        let registry = registry();
        let session = SessionId::generate();
        let mut issued: Vec<Issued> = Vec::new();
        let mut tick = 0u32;

        for op in ops {
            match op {
                Op::Subscribe(net, kind) => {
                    let network = network_name(net);
                    let before = registry.subscription_count();
                    let (tx, rx) = mpsc::channel(128);
                    let supported = NETWORKS
                        .get(net)
                        .is_some_and(|(_, protocol)| protocol.supports(kind));

                    match registry.subscribe(network, kind, session, tx) {
                        Ok(id) => {
                            prop_assert!(supported);
                            prop_assert!(issued.iter().all(|i| i.id != id));
                            issued.push(Issued {
                                id,
                                key: FeedKey::new(network, kind),
                                rx,
                                live: true,
                            });
                        }
                        Err(_) => {
                            prop_assert!(!supported);
                            prop_assert_eq!(registry.subscription_count(), before);
                        }
                    }
                }
                Op::Unsubscribe(target) => {
                    let id = match target.and_then(|i| issued.get(i)) {
                        Some(entry) => entry.id.clone(),
                        None => SubscriptionId::generate(),
                    };
                    let was_live = issued.iter().any(|i| i.id == id && i.live);
                    prop_assert_eq!(registry.unsubscribe(&id), was_live);
                    for entry in issued.iter_mut().filter(|i| i.id == id) {
                        entry.live = false;
                    }
                }
                Op::Publish(net, kind) => {
                    tick += 1;
                    let key = FeedKey::new(network_name(net), kind);
                    let expected = issued.iter().filter(|i| i.live && i.key == key).count();
                    let delivered = registry.publish(&key.network, kind, milestone(tick));
                    prop_assert_eq!(delivered, expected);

                    for entry in &mut issued {
                        let received = entry.rx.try_recv();
                        if entry.live && entry.key == key {
                            let envelope = received.unwrap();
                            prop_assert_eq!(&envelope.subscription_id, &entry.id);
                            prop_assert_eq!(envelope.payload, milestone(tick));
                        } else {
                            prop_assert!(received.is_err(), "unexpected envelope for {}", entry.id);
                        }
                    }
                }
            }

            let live = issued.iter().filter(|i| i.live).count();
            prop_assert_eq!(registry.subscription_count(), live);
            let feeds: HashSet<&FeedKey> = issued.iter().filter(|i| i.live).map(|i| &i.key).collect();
            prop_assert_eq!(registry.active_feed_count(), feeds.len());
            for key in feeds {
                let expected = issued.iter().filter(|i| i.live && &i.key == key).count();
                prop_assert_eq!(registry.subscriber_count(&key.network, key.kind), expected);
            }
        }
    }

    /// Closing a session leaves nothing of it behind.
    #[test]
    fn unsubscribe_session_clears_everything(kinds in prop::collection::vec(feed_kind(), 0..16)) {
        let registry = registry();
        let session = SessionId::generate();
        let other = SessionId::generate();
        let (tx, _rx) = mpsc::channel(8);
        let kept = registry.subscribe("mainnet", FeedKind::Block, other, tx.clone()).unwrap();

        let mut ours = 0;
        for kind in kinds {
            if registry.subscribe("testnet", kind, session, tx.clone()).is_ok() {
                ours += 1;
            }
        }

        prop_assert_eq!(registry.unsubscribe_session(session).len(), ours);
        prop_assert_eq!(registry.subscription_count(), 1);
        prop_assert!(registry.is_live(&kept));
    }
}

// ── Reconnect Backoff Properties ────────────────────────────

proptest! {
    /// Delays never exceed the cap and never fall below half the
    /// current ceiling.
    #[test]
    fn backoff_delay_within_bounds(
        base_ms in 1u64..2_000,
        cap_factor in 1u64..64,
        attempts in 1usize..40,
    ) {
        let base = Duration::from_millis(base_ms);
        let cap = Duration::from_millis(base_ms * cap_factor);
        let mut backoff = Backoff::new(base, cap);

        for attempt in 0..attempts {
            let ceiling = base
                .saturating_mul(2u32.saturating_pow(u32::try_from(attempt).unwrap()))
                .min(cap);
            let delay = backoff.next_delay();
            prop_assert!(delay <= cap, "delay {delay:?} above cap {cap:?}");
            prop_assert!(
                delay.as_millis() >= ceiling.as_millis() / 2,
                "delay {delay:?} below half of {ceiling:?}"
            );
        }

        backoff.reset();
        prop_assert_eq!(backoff.attempt(), 0);
        prop_assert!(backoff.next_delay() <= base);
    }
}

// ── Causal Gate Properties ──────────────────────────────────

#[derive(Debug, Clone)]
enum NodeEvent {
    Block(u8),
    Metadata(u8, u32),
}

fn node_event() -> impl Strategy<Value = NodeEvent> {
    prop_oneof![
        (0u8..12).prop_map(NodeEvent::Block),
        (0u8..12, 0u32..3).prop_map(|(id, ms)| NodeEvent::Metadata(id, ms)),
    ]
}

fn to_source_event(event: &NodeEvent) -> SourceEvent {
    let payload = match event {
        NodeEvent::Block(id) => FeedPayload::BlockUpdate(BlockUpdate {
            block_id: format!("0x{id:02x}"),
            block: serde_json::Value::Null,
        }),
        NodeEvent::Metadata(id, milestone) => FeedPayload::BlockMetadataUpdate(BlockMetadataUpdate {
            block_id: format!("0x{id:02x}"),
            metadata: ItemMetadata {
                referenced: true,
                solid: true,
                milestone_index: Some(*milestone),
                ..ItemMetadata::default()
            },
        }),
    };
    SourceEvent::new(FeedKind::Block, payload)
}

proptest! {
    /// Whatever the arrival order (including replays after reconnect),
    /// each block passes once, metadata only after its block, and no
    /// snapshot repeats back to back.
    #[test]
    fn causal_gate_orders_and_dedups(events in prop::collection::vec(node_event(), 0..80)) {
        let mut gate = CausalGate::new(1024);
        let mut blocks_seen: HashSet<String> = HashSet::new();
        let mut last_snapshot: HashMap<String, ItemMetadata> = HashMap::new();

        for event in &events {
            for out in gate.admit(to_source_event(event)) {
                match out.payload {
                    FeedPayload::BlockUpdate(update) => {
                        prop_assert!(blocks_seen.insert(update.block_id.clone()), "block {} twice", update.block_id);
                    }
                    FeedPayload::BlockMetadataUpdate(update) => {
                        prop_assert!(blocks_seen.contains(&update.block_id), "metadata before block {}", update.block_id);
                        prop_assert_ne!(last_snapshot.get(&update.block_id), Some(&update.metadata));
                        last_snapshot.insert(update.block_id.clone(), update.metadata);
                    }
                    other => prop_assert!(false, "unexpected payload {other:?}"),
                }
            }
        }

        let distinct_blocks: HashSet<u8> = events
            .iter()
            .filter_map(|e| match e {
                NodeEvent::Block(id) => Some(*id),
                NodeEvent::Metadata(..) => None,
            })
            .collect();
        prop_assert_eq!(blocks_seen.len(), distinct_blocks.len());
    }
}
