//! Feed Source - Generic Upstream Runner
//!
//! Owns one network's upstream connection. Connects through the
//! network's `UpstreamConnector`, classifies frames with the protocol
//! adapter, orders them through the causal gate and publishes into the
//! registry.
//!
//! Features:
//! - Per-attempt connect timeout
//! - Exponential reconnect backoff with jitter, reset on success
//! - Malformed frames counted and dropped, never fatal
//! - Event-driven via tokio::select! with shutdown first

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures_util::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::config::UpstreamConfig;
use crate::domain::{BlockId, FeedError, FeedKind, FeedPayload, ItemMetadata, NetworkId};
use crate::ports::feed_source::{
    FeedPublisher, ProtocolAdapter, SourceEvent, UpstreamConnector, UpstreamFrame,
};

/// Metadata snapshots parked per block while its arrival is pending.
const MAX_PARKED_PER_BLOCK: usize = 16;

/// Reconnect delay schedule.
///
/// The ceiling doubles per failed attempt from `base` up to `cap`; each
/// delay is drawn uniformly from `[ceiling / 2, ceiling]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Insertion-ordered map that forgets its oldest keys past `capacity`.
#[derive(Debug)]
struct BoundedMap<V> {
    capacity: usize,
    entries: HashMap<BlockId, V>,
    order: VecDeque<BlockId>,
}

impl<V> BoundedMap<V> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, key: &str, value: V) {
        if self.entries.insert(key.to_string(), value).is_none() {
            self.order.push_back(key.to_string());
            while self.entries.len() > self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.entries.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }
}

/// Causal bookkeeping for one feed kind.
#[derive(Debug)]
struct FeedWindow {
    /// Blocks whose arrival was published.
    seen: BoundedMap<()>,
    /// Last metadata snapshot published per block.
    last_metadata: BoundedMap<ItemMetadata>,
    /// Metadata waiting for its block's arrival.
    parked: BoundedMap<Vec<FeedPayload>>,
}

impl FeedWindow {
    fn new(window: usize) -> Self {
        Self {
            seen: BoundedMap::new(window),
            last_metadata: BoundedMap::new(window),
            parked: BoundedMap::new(window),
        }
    }

    /// Admit a metadata snapshot unless it repeats the last one.
    fn admit_metadata(&mut self, block_id: &str, metadata: &ItemMetadata) -> bool {
        if self.last_metadata.get(block_id) == Some(metadata) {
            return false;
        }
        self.last_metadata.insert(block_id, metadata.clone());
        true
    }
}

/// Orders one network's events so each feed sees a block before any of
/// its metadata, never sees a block twice, and never sees the same
/// metadata snapshot twice in a row.
///
/// Memory is bounded by `window` items per feed; items older than that
/// are forgotten.
#[derive(Debug)]
pub struct CausalGate {
    window: usize,
    feeds: HashMap<FeedKind, FeedWindow>,
}

impl CausalGate {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            feeds: HashMap::new(),
        }
    }

    /// Pass one event through the gate. Returns what may be published
    /// now, in order.
    pub fn admit(&mut self, event: SourceEvent) -> Vec<SourceEvent> {
        let window = self.window;
        let feed = self
            .feeds
            .entry(event.kind)
            .or_insert_with(|| FeedWindow::new(window));

        match &event.payload {
            FeedPayload::BlockUpdate(update) => {
                if feed.seen.contains(&update.block_id) {
                    debug!(feed = %event.kind, block = %update.block_id, "Dropping replayed block");
                    return Vec::new();
                }
                let block_id = update.block_id.clone();
                feed.seen.insert(&block_id, ());

                let mut released = Vec::new();
                for parked in feed.parked.remove(&block_id).unwrap_or_default() {
                    if let FeedPayload::BlockMetadataUpdate(meta) = &parked {
                        if feed.admit_metadata(&meta.block_id, &meta.metadata) {
                            released.push(SourceEvent::new(event.kind, parked));
                        }
                    }
                }

                let mut out = Vec::with_capacity(released.len() + 1);
                out.push(event);
                out.extend(released);
                out
            }
            FeedPayload::BlockMetadataUpdate(meta) => {
                if !feed.seen.contains(&meta.block_id) {
                    let block_id = meta.block_id.clone();
                    match feed.parked.get_mut(&block_id) {
                        Some(queue) => {
                            if queue.len() >= MAX_PARKED_PER_BLOCK {
                                queue.remove(0);
                            }
                            queue.push(event.payload);
                        }
                        None => feed.parked.insert(&block_id, vec![event.payload]),
                    }
                    return Vec::new();
                }
                if feed.admit_metadata(&meta.block_id, &meta.metadata) {
                    vec![event]
                } else {
                    Vec::new()
                }
            }
            FeedPayload::MilestoneUpdate(_) | FeedPayload::SlotFinalized(_) => vec![event],
        }
    }

    /// Metadata snapshots currently waiting for their block.
    pub fn parked_count(&self) -> usize {
        self.feeds
            .values()
            .flat_map(|feed| feed.parked.entries.values())
            .map(Vec::len)
            .sum()
    }
}

/// Connection state of one feed source, read by health checks.
#[derive(Debug, Default)]
pub struct FeedHealth {
    connected: AtomicBool,
    reconnects: AtomicU32,
    /// Why the upstream is down; cleared on the next successful connect.
    last_error: Mutex<Option<FeedError>>,
}

impl FeedHealth {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// `UpstreamUnavailable` from the latest failed session, if still down.
    pub fn last_error(&self) -> Option<FeedError> {
        self.last_error.lock().clone()
    }
}

/// Upstream runner for one network.
pub struct FeedSource {
    network: NetworkId,
    adapter: Arc<dyn ProtocolAdapter>,
    connector: Arc<dyn UpstreamConnector>,
    /// Registry handle; the source stops once the registry is gone.
    publisher: Weak<dyn FeedPublisher>,
    upstream: UpstreamConfig,
    causal_window: usize,
    metrics: Arc<MetricsRegistry>,
    health: Arc<FeedHealth>,
}

impl FeedSource {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        network: NetworkId,
        adapter: Arc<dyn ProtocolAdapter>,
        connector: Arc<dyn UpstreamConnector>,
        publisher: Weak<dyn FeedPublisher>,
        upstream: UpstreamConfig,
        causal_window: usize,
        metrics: Arc<MetricsRegistry>,
        health: Arc<FeedHealth>,
    ) -> Self {
        Self {
            network,
            adapter,
            connector,
            publisher,
            upstream,
            causal_window,
            metrics,
            health,
        }
    }

    /// Run the connection loop with auto-reconnect until shutdown.
    ///
    /// Upstream failures never end the loop; it returns when the shutdown
    /// channel fires or closes, or when the registry has been dropped.
    #[instrument(skip(self, shutdown_rx), fields(network = %self.network, protocol = %self.adapter.protocol()))]
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut gate = CausalGate::new(self.causal_window);
        let mut backoff = Backoff::new(self.upstream.backoff_base(), self.upstream.backoff_cap());

        loop {
            let outcome = self
                .connect_and_stream(&mut gate, &mut backoff, &mut shutdown_rx)
                .await;
            self.set_connected(false);

            match outcome {
                Ok(()) => {
                    info!("Feed source stopped");
                    return Ok(());
                }
                Err(e) => {
                    let unavailable = FeedError::UpstreamUnavailable {
                        network: self.network.clone(),
                        reason: format!("{e:#}"),
                    };
                    self.health.reconnects.fetch_add(1, Ordering::Relaxed);
                    self.metrics
                        .upstream_reconnects
                        .with_label_values(&[self.network.as_str()])
                        .inc();

                    let delay = backoff.next_delay();
                    warn!(
                        error = %unavailable,
                        attempt = backoff.attempt(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Upstream unavailable, reconnecting"
                    );
                    *self.health.last_error.lock() = Some(unavailable);

                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => {
                            info!("Feed source stopped during backoff");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Single upstream session: connect, stream until error or shutdown.
    async fn connect_and_stream(
        &self,
        gate: &mut CausalGate,
        backoff: &mut Backoff,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> Result<()> {
        let timeout = self.upstream.connect_timeout();
        let mut frames = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            attempt = tokio::time::timeout(timeout, self.connector.connect(self.adapter.topics())) => {
                attempt
                    .map_err(|_| anyhow!("connect timed out after {timeout:?}"))?
                    .context("upstream connect failed")?
            }
        };

        self.set_connected(true);
        self.health.last_error.lock().take();
        backoff.reset();
        info!(topics = ?self.adapter.topics(), "Upstream connected");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return Ok(()),
                frame = frames.next() => {
                    let Some(publisher) = self.publisher.upgrade() else {
                        info!("Registry dropped, stopping feed source");
                        return Ok(());
                    };
                    match frame {
                        Some(Ok(frame)) => self.handle_frame(publisher.as_ref(), gate, &frame),
                        Some(Err(e)) => return Err(e.context("upstream stream error")),
                        None => bail!("upstream stream ended"),
                    }
                }
            }
        }
    }

    /// Classify, gate and publish one frame.
    fn handle_frame(&self, publisher: &dyn FeedPublisher, gate: &mut CausalGate, frame: &UpstreamFrame) {
        match self.adapter.classify(frame) {
            Ok(events) => {
                for event in events.into_iter().flat_map(|event| gate.admit(event)) {
                    let delivered = publisher.publish(&self.network, event.kind, event.payload);
                    debug!(feed = %event.kind, delivered, "Published upstream event");
                }
            }
            Err(e) => {
                self.metrics
                    .malformed_events
                    .with_label_values(&[self.network.as_str()])
                    .inc();
                debug!(error = %e, "Dropping malformed upstream frame");
            }
        }
    }

    fn set_connected(&self, connected: bool) {
        self.health.connected.store(connected, Ordering::Relaxed);
        self.metrics
            .upstream_connected
            .with_label_values(&[self.network.as_str()])
            .set(i64::from(connected));
    }
}
