//! Feed Socket Server - WebSocket Transport Boundary
//!
//! Serves `GET /ws` via axum 0.7. Every socket gets one
//! `SubscriptionSession`; text frames are parsed as `ClientMessage`s and
//! answered in order. A single writer task owns the socket sink, so
//! responses and updates leave in the order the session hands them over.
//! Socket close (or any read error) closes the session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, instrument, warn};

use crate::adapters::metrics::{HealthState, MetricsRegistry};
use crate::domain::UpdateEnvelope;
use crate::ports::transport::{
    ClientMessage, ResponseMessage, ServerMessage, Transport, TransportError,
};
use crate::usecases::registry::FeedRegistry;
use crate::usecases::session::{SessionOptions, SubscriptionSession};

/// Frames buffered per socket between the session and the writer task.
const OUTBOUND_CAPACITY: usize = 256;

/// How long queued responses get to flush after the session closes.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// `Transport` backed by a socket's writer task.
pub struct SocketTransport {
    tx: mpsc::Sender<ServerMessage>,
}

impl SocketTransport {
    pub const fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self { tx }
    }

    async fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn push(&self, envelope: &UpdateEnvelope) -> Result<(), TransportError> {
        self.send(ServerMessage::Update(envelope.clone())).await
    }

    async fn respond(&self, response: &ResponseMessage) -> Result<(), TransportError> {
        self.send(ServerMessage::Response(response.clone())).await
    }
}

/// Shared state handed to every socket.
#[derive(Clone)]
struct ServerState {
    registry: Arc<FeedRegistry>,
    options: SessionOptions,
    metrics: Arc<MetricsRegistry>,
}

/// Client-facing feed socket server.
pub struct FeedServer {
    registry: Arc<FeedRegistry>,
    options: SessionOptions,
    metrics: Arc<MetricsRegistry>,
    /// Flipped to accepting once the listener is bound.
    health: Arc<HealthState>,
    bind_address: String,
}

impl FeedServer {
    pub fn new(
        registry: Arc<FeedRegistry>,
        options: SessionOptions,
        metrics: Arc<MetricsRegistry>,
        health: Arc<HealthState>,
        bind_address: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            options,
            metrics,
            health,
            bind_address: bind_address.into(),
        }
    }

    /// Router serving `/ws`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(ServerState {
                registry: Arc::clone(&self.registry),
                options: self.options,
                metrics: Arc::clone(&self.metrics),
            })
    }

    /// Serve until shutdown.
    #[instrument(skip(self, shutdown_rx), fields(address = %self.bind_address))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        self.health.set_accepting(true);
        info!("Feed socket server started");

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await;

        self.health.set_accepting(false);
        info!("Feed socket server stopped");
        Ok(result?)
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let transport = Arc::new(SocketTransport::new(out_tx.clone()));
    let mut session = SubscriptionSession::open(
        state.registry,
        transport,
        state.options,
        state.metrics,
    );
    let session_id = session.id();
    debug!(session = %session_id, "Client connected");

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    let response = ResponseMessage::invalid_request("binary frame is not utf-8");
                    if out_tx.send(ServerMessage::Response(response)).await.is_err() {
                        break;
                    }
                    continue;
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
        };

        let outcome = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(request) => session.handle(request).await,
            Err(e) => out_tx
                .send(ServerMessage::Response(ResponseMessage::invalid_request(e.to_string())))
                .await
                .map_err(|_| TransportError::Disconnected),
        };
        if outcome.is_err() {
            break;
        }
    }

    session.close().await;
    drop(session);
    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        debug!(session = %session_id, "Writer did not drain in time");
    }
    debug!(session = %session_id, "Client disconnected");
}
