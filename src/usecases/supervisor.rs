//! Adapter Supervisor - Lazy Lifecycle for Feed Sources
//!
//! Runs at most one `FeedSource` per network and only while some feed
//! kind of that network has subscribers. The registry drives it through
//! `FeedActivation`; health is aggregated for the /ready endpoint.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use super::feed_source::{FeedHealth, FeedSource};
use crate::adapters::metrics::{MetricsRegistry, ReadinessCheck};
use crate::config::{NetworkCatalog, UpstreamConfig};
use crate::domain::{FeedKey, FeedKind, NetworkId};
use crate::ports::feed_source::{FeedActivation, FeedPublisher, SourceFactory};

/// Grace period for feed sources to wind down on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// One live feed source and the feed kinds keeping it alive.
struct RunningSource {
    feeds: BTreeSet<FeedKind>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    health: Arc<FeedHealth>,
}

/// Starts and stops feed sources on demand.
pub struct AdapterSupervisor {
    /// Builds protocol adapter and connector per network.
    factory: Arc<dyn SourceFactory>,
    networks: NetworkCatalog,
    /// Where sources publish; normally the registry.
    publisher: Weak<dyn FeedPublisher>,
    upstream: UpstreamConfig,
    causal_window: usize,
    metrics: Arc<MetricsRegistry>,
    running: Mutex<HashMap<NetworkId, RunningSource>>,
    /// Acquired kinds of networks whose source could not be started.
    stalled: Mutex<HashMap<NetworkId, BTreeSet<FeedKind>>>,
}

impl AdapterSupervisor {
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        networks: NetworkCatalog,
        publisher: Weak<dyn FeedPublisher>,
        upstream: UpstreamConfig,
        causal_window: usize,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            factory,
            networks,
            publisher,
            upstream,
            causal_window,
            metrics,
            running: Mutex::new(HashMap::new()),
            stalled: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the feed source for `network`.
    fn spawn_source(&self, network: &str) -> Option<RunningSource> {
        let Some(config) = self.networks.get(network) else {
            warn!(network, "Activation for unconfigured network ignored");
            return None;
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(network, error = %e, "No runtime to start feed source on");
                return None;
            }
        };

        let connector = match self.factory.connector(config) {
            Ok(connector) => connector,
            Err(e) => {
                error!(network, error = %e, "Failed to build upstream connector");
                return None;
            }
        };

        let health = Arc::new(FeedHealth::default());
        let source = FeedSource::new(
            config.name.clone(),
            self.factory.protocol_adapter(config),
            connector,
            self.publisher.clone(),
            self.upstream.clone(),
            self.causal_window,
            Arc::clone(&self.metrics),
            Arc::clone(&health),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let name = config.name.clone();
        let handle = runtime.spawn(async move {
            match source.run(shutdown_rx).await {
                Ok(()) => info!(network = %name, "Feed source exited normally"),
                Err(e) => error!(network = %name, error = %e, "Feed source crashed"),
            }
        });

        info!(network, protocol = %config.protocol, "Feed source started");
        Some(RunningSource {
            feeds: BTreeSet::new(),
            shutdown_tx,
            handle,
            health,
        })
    }

    pub fn is_running(&self, network: &str) -> bool {
        self.running.lock().contains_key(network)
    }

    /// Feed kinds currently keeping `network`'s source alive.
    pub fn running_feeds(&self, network: &str) -> Vec<FeedKind> {
        self.running
            .lock()
            .get(network)
            .map(|source| source.feeds.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Acquired feed kinds of `network` still waiting for a source.
    pub fn stalled_feeds(&self, network: &str) -> Vec<FeedKind> {
        self.stalled
            .lock()
            .get(network)
            .map(|kinds| kinds.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every acquired network has a source with a live upstream connection.
    ///
    /// Vacuously true when nothing is subscribed.
    pub fn is_healthy(&self) -> bool {
        let running = self.running.lock();
        if !self.stalled.lock().is_empty() {
            return false;
        }
        running.values().all(|source| source.health.is_connected())
    }

    /// Stop every feed source and wait for them to finish.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self) {
        let sources: Vec<(NetworkId, RunningSource)> = self.running.lock().drain().collect();

        for (network, source) in sources {
            let _ = source.shutdown_tx.send(());
            if tokio::time::timeout(SHUTDOWN_GRACE, source.handle).await.is_err() {
                warn!(%network, "Feed source did not stop within grace period");
            }
        }
        info!("All feed sources stopped");
    }
}

impl FeedActivation for AdapterSupervisor {
    fn acquire(&self, key: &FeedKey) {
        let mut running = self.running.lock();

        let restart = running
            .get(&key.network)
            .is_some_and(|source| source.handle.is_finished());
        if restart {
            warn!(feed = %key, "Feed source had exited, restarting");
            if let Some(exited) = running.remove(&key.network) {
                self.stalled
                    .lock()
                    .entry(key.network.clone())
                    .or_default()
                    .extend(exited.feeds);
            }
        }

        if !running.contains_key(&key.network) {
            let Some(mut source) = self.spawn_source(&key.network) else {
                if self.networks.get(&key.network).is_some() {
                    self.stalled
                        .lock()
                        .entry(key.network.clone())
                        .or_default()
                        .insert(key.kind);
                    error!(feed = %key, "Feed source not started, retrying on next subscribe");
                }
                return;
            };
            if let Some(kinds) = self.stalled.lock().remove(&key.network) {
                source.feeds.extend(kinds);
            }
            running.insert(key.network.clone(), source);
        }

        if let Some(source) = running.get_mut(&key.network) {
            source.feeds.insert(key.kind);
        }
    }

    fn release(&self, key: &FeedKey) {
        let mut running = self.running.lock();

        let Some(source) = running.get_mut(&key.network) else {
            let mut stalled = self.stalled.lock();
            if let Some(kinds) = stalled.get_mut(&key.network) {
                kinds.remove(&key.kind);
                if kinds.is_empty() {
                    stalled.remove(&key.network);
                }
            }
            return;
        };
        source.feeds.remove(&key.kind);
        if !source.feeds.is_empty() {
            return;
        }

        if let Some(source) = running.remove(&key.network) {
            let _ = source.shutdown_tx.send(());
            info!(network = %key.network, "Last feed released, stopping feed source");
        }
    }
}

impl ReadinessCheck for AdapterSupervisor {
    fn is_ready(&self) -> bool {
        self.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::protocols::adapter_for;
    use crate::config::{NetworkConfig, UpstreamEndpoint};
    use crate::domain::{FeedPayload, ProtocolVersion};
    use crate::ports::feed_source::{FrameStream, ProtocolAdapter, UpstreamConnector};
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use futures_util::stream;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct SilentConnector {
        connects: AtomicU32,
    }

    #[async_trait]
    impl UpstreamConnector for SilentConnector {
        async fn connect(&self, _topics: &[&'static str]) -> anyhow::Result<FrameStream> {
            self.connects.fetch_add(1, Ordering::Relaxed);
            Ok(stream::pending().boxed())
        }
    }

    /// Hands out the shared connector after `failures` refused builds.
    struct SilentFactory {
        connector: Arc<SilentConnector>,
        failures: AtomicU32,
    }

    impl SourceFactory for SilentFactory {
        fn protocol_adapter(&self, network: &NetworkConfig) -> Arc<dyn ProtocolAdapter> {
            adapter_for(network.protocol)
        }

        fn connector(&self, _network: &NetworkConfig) -> anyhow::Result<Arc<dyn UpstreamConnector>> {
            let refused = self
                .failures
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                anyhow::bail!("connector unavailable");
            }
            let connector: Arc<dyn UpstreamConnector> = self.connector.clone();
            Ok(connector)
        }
    }

    struct NullPublisher;

    impl FeedPublisher for NullPublisher {
        fn publish(&self, _network: &str, _kind: FeedKind, _payload: FeedPayload) -> usize {
            0
        }
    }

    fn supervisor(connector: Arc<SilentConnector>, publisher: &Arc<dyn FeedPublisher>) -> AdapterSupervisor {
        flaky_supervisor(connector, publisher, 0)
    }

    fn flaky_supervisor(
        connector: Arc<SilentConnector>,
        publisher: &Arc<dyn FeedPublisher>,
        failures: u32,
    ) -> AdapterSupervisor {
        let networks = NetworkCatalog::new([NetworkConfig {
            name: "mainnet".to_string(),
            protocol: ProtocolVersion::Chrysalis,
            upstream: UpstreamEndpoint::Websocket {
                url: "ws://localhost:1".to_string(),
            },
        }]);
        AdapterSupervisor::new(
            Arc::new(SilentFactory {
                connector,
                failures: AtomicU32::new(failures),
            }),
            networks,
            Arc::downgrade(publisher),
            UpstreamConfig::default(),
            64,
            Arc::new(MetricsRegistry::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_one_source_per_network_until_last_release() {
        let connector = Arc::new(SilentConnector::default());
        let publisher: Arc<dyn FeedPublisher> = Arc::new(NullPublisher);
        let supervisor = supervisor(Arc::clone(&connector), &publisher);

        let block = FeedKey::new("mainnet", FeedKind::Block);
        let milestone = FeedKey::new("mainnet", FeedKind::Milestone);

        supervisor.acquire(&block);
        supervisor.acquire(&milestone);
        assert!(supervisor.is_running("mainnet"));
        assert_eq!(
            supervisor.running_feeds("mainnet"),
            vec![FeedKind::Block, FeedKind::Milestone]
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);
        assert!(supervisor.is_healthy());

        supervisor.release(&block);
        assert!(supervisor.is_running("mainnet"));
        supervisor.release(&milestone);
        assert!(!supervisor.is_running("mainnet"));
    }

    #[tokio::test]
    async fn test_unknown_network_is_ignored() {
        let connector = Arc::new(SilentConnector::default());
        let publisher: Arc<dyn FeedPublisher> = Arc::new(NullPublisher);
        let supervisor = supervisor(connector, &publisher);

        supervisor.acquire(&FeedKey::new("devnet", FeedKind::Block));
        assert!(!supervisor.is_running("devnet"));
        supervisor.release(&FeedKey::new("devnet", FeedKind::Block));
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_sources() {
        let connector = Arc::new(SilentConnector::default());
        let publisher: Arc<dyn FeedPublisher> = Arc::new(NullPublisher);
        let supervisor = supervisor(connector, &publisher);

        supervisor.acquire(&FeedKey::new("mainnet", FeedKind::Block));
        supervisor.shutdown_all().await;
        assert!(!supervisor.is_running("mainnet"));
        assert!(supervisor.is_healthy());
    }

    #[tokio::test]
    async fn test_failed_start_is_retried_on_next_acquire() {
        let connector = Arc::new(SilentConnector::default());
        let publisher: Arc<dyn FeedPublisher> = Arc::new(NullPublisher);
        let supervisor = flaky_supervisor(Arc::clone(&connector), &publisher, 1);
        let block = FeedKey::new("mainnet", FeedKind::Block);
        let milestone = FeedKey::new("mainnet", FeedKind::Milestone);

        supervisor.acquire(&block);
        assert!(!supervisor.is_running("mainnet"));
        assert_eq!(supervisor.stalled_feeds("mainnet"), vec![FeedKind::Block]);
        assert!(!supervisor.is_healthy());

        supervisor.acquire(&milestone);
        assert!(supervisor.is_running("mainnet"));
        assert!(supervisor.stalled_feeds("mainnet").is_empty());
        assert_eq!(
            supervisor.running_feeds("mainnet"),
            vec![FeedKind::Block, FeedKind::Milestone]
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connector.connects.load(Ordering::Relaxed), 1);

        supervisor.release(&milestone);
        assert!(supervisor.is_running("mainnet"));
        supervisor.release(&block);
        assert!(!supervisor.is_running("mainnet"));
    }

    #[tokio::test]
    async fn test_release_clears_stalled_kind() {
        let connector = Arc::new(SilentConnector::default());
        let publisher: Arc<dyn FeedPublisher> = Arc::new(NullPublisher);
        let supervisor = flaky_supervisor(connector, &publisher, 1);
        let block = FeedKey::new("mainnet", FeedKind::Block);

        supervisor.acquire(&block);
        assert_eq!(supervisor.stalled_feeds("mainnet"), vec![FeedKind::Block]);
        supervisor.release(&block);
        assert!(supervisor.stalled_feeds("mainnet").is_empty());
        assert!(supervisor.is_healthy());
    }
}
