//! Use Cases Layer - Feed Pipeline Logic
//!
//! Protocol-independent core of the relay. Everything here talks to the
//! outside world through `crate::ports`.
//!
//! Use cases:
//! - `FeedRegistry`: subscription directory and fan-out
//! - `SubscriptionSession`: per-client state machine and delivery
//! - `FeedSource`: upstream runner with reconnect and causal ordering
//! - `AdapterSupervisor`: starts and stops feed sources on demand

pub mod feed_source;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use feed_source::{Backoff, CausalGate, FeedHealth, FeedSource};
pub use registry::{EnvelopeSink, FeedRegistry, RegistryOptions};
pub use session::{SessionOptions, SessionState, SubscriptionSession};
pub use supervisor::AdapterSupervisor;
