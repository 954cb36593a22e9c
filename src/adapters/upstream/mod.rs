//! Upstream Connectors
//!
//! Raw I/O with node event sources: WebSocket push streams and HTTP
//! polling. `NodeSourceFactory` pairs the connector named by a network's
//! `upstream.kind` with the adapter for its protocol generation.

pub mod polling;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::adapters::protocols::adapter_for;
use crate::config::{NetworkConfig, UpstreamEndpoint};
use crate::ports::feed_source::{ProtocolAdapter, SourceFactory, UpstreamConnector};

pub use polling::PollingConnector;
pub use websocket::WebSocketConnector;

/// Production source factory.
#[derive(Debug, Clone)]
pub struct NodeSourceFactory {
    /// HTTP timeout for each poll request.
    request_timeout: Duration,
}

impl NodeSourceFactory {
    pub const fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl SourceFactory for NodeSourceFactory {
    fn protocol_adapter(&self, network: &NetworkConfig) -> Arc<dyn ProtocolAdapter> {
        adapter_for(network.protocol)
    }

    fn connector(&self, network: &NetworkConfig) -> Result<Arc<dyn UpstreamConnector>> {
        let connector: Arc<dyn UpstreamConnector> = match &network.upstream {
            UpstreamEndpoint::Websocket { url } => Arc::new(WebSocketConnector::new(url.clone())),
            UpstreamEndpoint::Polling { url, interval_ms } => Arc::new(PollingConnector::new(
                url.clone(),
                Duration::from_millis(*interval_ms),
                self.request_timeout,
            )?),
        };
        Ok(connector)
    }
}
