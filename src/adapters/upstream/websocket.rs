//! WebSocket Upstream - Node Event Bridge Connector
//!
//! Connects to a node's event bridge, subscribes to the adapter's topics
//! with `{"subscribe": [..]}` and exposes the incoming text and binary
//! messages as frames. Control messages are handled by tungstenite; a
//! close frame or transport error ends the stream so the feed source
//! reconnects.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument};

use crate::ports::feed_source::{FrameStream, UpstreamConnector, UpstreamFrame};

/// Topic subscription sent right after connecting.
#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    subscribe: &'a [&'static str],
}

/// Upstream connector for push-style node event sources.
pub struct WebSocketConnector {
    /// Event bridge URL (`ws://` or `wss://`).
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamConnector for WebSocketConnector {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self, topics: &[&'static str]) -> Result<FrameStream> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .context("upstream WebSocket connection failed")?;

        let (mut write, read) = ws_stream.split();

        let subscribe = serde_json::to_string(&SubscribeFrame { subscribe: topics })?;
        write
            .send(Message::Text(subscribe))
            .await
            .context("Failed to send topic subscription")?;

        info!(topic_count = topics.len(), "Upstream WebSocket subscribed");

        let frames = read.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(UpstreamFrame::Text(text))),
                Ok(Message::Binary(bytes)) => Some(Ok(UpstreamFrame::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    Some(Err(anyhow!("upstream closed the connection: {frame:?}")))
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {
                    debug!("Upstream control frame");
                    None
                }
                Err(e) => Some(Err(anyhow::Error::new(e).context("upstream WebSocket error"))),
            }
        });

        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_shape() {
        let text = serde_json::to_string(&SubscribeFrame {
            subscribe: &["blocks", "milestone-info/latest"],
        })
        .unwrap();
        assert_eq!(text, r#"{"subscribe":["blocks","milestone-info/latest"]}"#);
    }

    #[tokio::test]
    async fn test_connect_failure_is_an_error() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1/events");
        assert!(connector.connect(&["blocks"]).await.is_err());
    }
}
