//! Domain layer - Feed model, envelopes and error taxonomy.
//!
//! Pure types shared by every other layer (hexagonal architecture inner
//! ring). No I/O and no async here.

pub mod envelope;
pub mod error;
pub mod feed;
pub mod subscription;

pub use envelope::{
    BlockMetadataUpdate, BlockUpdate, FeedPayload, ItemMetadata, MilestoneUpdate, SlotFinalized,
    UpdateEnvelope,
};
pub use error::FeedError;
pub use feed::{BlockId, FeedKey, FeedKind, NetworkId, ProtocolVersion};
pub use subscription::{DuplicatePolicy, SessionId, Subscription, SubscriptionId};
