//! Update envelopes pushed to subscribers.
//!
//! `FeedPayload` is a tagged union: an envelope carries exactly one of
//! block arrival, metadata transition, milestone or slot finalization.
//! On the wire the variant name becomes the field name next to
//! `subscriptionId`, e.g. `{"subscriptionId": "..", "blockUpdate": {..}}`.

use serde::{Deserialize, Serialize};

use super::feed::BlockId;
use super::subscription::SubscriptionId;

/// Per-item state snapshot (block, message or transaction).
///
/// Items start unreferenced and move towards referenced / included or
/// conflicting; every distinct snapshot is re-emitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    #[serde(default)]
    pub referenced: bool,
    #[serde(default)]
    pub solid: bool,
    #[serde(default)]
    pub conflicting: bool,
    #[serde(default)]
    pub included: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockUpdate {
    pub block_id: BlockId,
    /// Raw block as delivered by the node.
    pub block: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMetadataUpdate {
    pub block_id: BlockId,
    pub metadata: ItemMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_id: Option<String>,
    pub milestone_index: u32,
    /// Unix seconds; zero when the upstream does not report one.
    #[serde(default)]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotFinalized {
    pub slot_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment_id: Option<String>,
}

/// Normalized event content, independent of protocol generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FeedPayload {
    BlockUpdate(BlockUpdate),
    BlockMetadataUpdate(BlockMetadataUpdate),
    MilestoneUpdate(MilestoneUpdate),
    SlotFinalized(SlotFinalized),
}

impl FeedPayload {
    /// Item the payload is about, for block and metadata variants.
    pub fn block_id(&self) -> Option<&str> {
        match self {
            Self::BlockUpdate(update) => Some(&update.block_id),
            Self::BlockMetadataUpdate(update) => Some(&update.block_id),
            Self::MilestoneUpdate(_) | Self::SlotFinalized(_) => None,
        }
    }

    /// Variant name, used as a metric label.
    pub const fn variant(&self) -> &'static str {
        match self {
            Self::BlockUpdate(_) => "blockUpdate",
            Self::BlockMetadataUpdate(_) => "blockMetadataUpdate",
            Self::MilestoneUpdate(_) => "milestoneUpdate",
            Self::SlotFinalized(_) => "slotFinalized",
        }
    }
}

/// One pushed update, addressed to exactly one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    pub subscription_id: SubscriptionId,
    #[serde(flatten)]
    pub payload: FeedPayload,
}

impl UpdateEnvelope {
    pub const fn new(subscription_id: SubscriptionId, payload: FeedPayload) -> Self {
        Self {
            subscription_id,
            payload,
        }
    }
}
