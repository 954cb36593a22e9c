//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the usecases layer requires
//! from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `FeedSource`: upstream connectors, protocol classification, publishing
//! - `Transport`: client request/response/push channel

pub mod feed_source;
pub mod transport;
