//! Client Transport Adapters
//!
//! Concrete `Transport` implementations. The relay ships a WebSocket
//! server; other channels only need to implement the port.

pub mod ws_server;

pub use ws_server::{FeedServer, SocketTransport};
