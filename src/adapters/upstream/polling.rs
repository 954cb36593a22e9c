//! Polling Upstream - HTTP Event Log Connector
//!
//! For nodes that only expose their event log over HTTP. Each poll is a
//! `GET <url>?topics=a,b&cursor=..` answered with
//! `{"cursor": "..", "frames": [..]}`; string frames are passed through
//! as text lines, object frames as JSON text. Any failed poll ends the
//! stream so the feed source backs off and reconnects.

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::ports::feed_source::{FrameStream, UpstreamConnector, UpstreamFrame};

/// One page of the upstream event log.
#[derive(Debug, Default, Deserialize)]
struct PollResponse {
  /// Resume token for the next poll.
  #[serde(default)]
  cursor: Option<String>,
  #[serde(default)]
  frames: Vec<serde_json::Value>,
}

/// Upstream connector that polls an HTTP endpoint on a fixed interval.
pub struct PollingConnector {
  /// Underlying HTTP client.
  http: Client,
  /// Event log endpoint.
  url: String,
  /// Delay between polls.
  interval: Duration,
}

impl PollingConnector {
  /// Create a new polling connector.
  pub fn new(url: impl Into<String>, interval: Duration, request_timeout: Duration) -> Result<Self> {
    let http = Client::builder()
      .timeout(request_timeout)
      .pool_max_idle_per_host(2)
      .build()
      .context("Failed to build HTTP client")?;

    Ok(Self {
      http,
      url: url.into(),
      interval,
    })
  }
}

/// State threaded through the frame stream.
struct PollState {
  http: Client,
  url: String,
  topics: String,
  interval: Duration,
  cursor: Option<String>,
  pending: VecDeque<UpstreamFrame>,
  failed: bool,
}

impl PollState {
  async fn poll(&mut self) -> Result<()> {
    let mut request = self
      .http
      .get(&self.url)
      .query(&[("topics", self.topics.as_str())]);
    if let Some(cursor) = &self.cursor {
      request = request.query(&[("cursor", cursor.as_str())]);
    }

    let page: PollResponse = request
      .send()
      .await
      .context("poll request failed")?
      .error_for_status()
      .context("poll rejected by upstream")?
      .json()
      .await
      .context("invalid poll response")?;

    debug!(frames = page.frames.len(), "Polled upstream");
    if page.cursor.is_some() {
      self.cursor = page.cursor;
    }
    self.pending.extend(page.frames.into_iter().map(into_frame));
    Ok(())
  }
}

fn into_frame(value: serde_json::Value) -> UpstreamFrame {
  match value {
    serde_json::Value::String(line) => UpstreamFrame::Text(line),
    other => UpstreamFrame::Text(other.to_string()),
  }
}

#[async_trait]
impl UpstreamConnector for PollingConnector {
  #[instrument(skip(self), fields(url = %self.url))]
  async fn connect(&self, topics: &[&'static str]) -> Result<FrameStream> {
    let mut state = PollState {
      http: self.http.clone(),
      url: self.url.clone(),
      topics: topics.join(","),
      interval: self.interval,
      cursor: None,
      pending: VecDeque::new(),
      failed: false,
    };

    // The first poll doubles as the connection check.
    state.poll().await?;

    let frames = stream::unfold(state, |mut state| async move {
      if state.failed {
        return None;
      }
      loop {
        if let Some(frame) = state.pending.pop_front() {
          return Some((Ok(frame), state));
        }
        tokio::time::sleep(state.interval).await;
        if let Err(e) = state.poll().await {
          state.failed = true;
          return Some((Err(e), state));
        }
      }
    });

    Ok(frames.boxed())
  }
}
