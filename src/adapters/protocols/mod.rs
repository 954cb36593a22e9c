//! Protocol Adapters - Per-generation Frame Classification
//!
//! One `ProtocolAdapter` per node generation. Chrysalis, Stardust and
//! Nova nodes publish JSON frames `{"topic": .., "payload": ..}` through
//! their event bridge; legacy (og) nodes publish space-separated text
//! lines. Adapters only classify; connection handling lives in
//! `adapters::upstream`.

pub mod chrysalis;
pub mod nova;
pub mod og;
pub mod stardust;

use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::domain::{BlockMetadataUpdate, BlockUpdate, FeedError, ItemMetadata, MilestoneUpdate, ProtocolVersion};
use crate::ports::feed_source::{ProtocolAdapter, UpstreamFrame};

pub use chrysalis::ChrysalisAdapter;
pub use nova::NovaAdapter;
pub use og::OgAdapter;
pub use stardust::StardustAdapter;

/// Adapter for a protocol generation.
pub fn adapter_for(protocol: ProtocolVersion) -> Arc<dyn ProtocolAdapter> {
    match protocol {
        ProtocolVersion::Og => Arc::new(OgAdapter),
        ProtocolVersion::Chrysalis => Arc::new(ChrysalisAdapter),
        ProtocolVersion::Stardust => Arc::new(StardustAdapter),
        ProtocolVersion::Nova => Arc::new(NovaAdapter),
    }
}

/// JSON frame of the node event bridge.
#[derive(Debug, Deserialize)]
pub(crate) struct TopicFrame {
    pub topic: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

pub(crate) fn topic_frame(frame: &UpstreamFrame) -> Result<TopicFrame, FeedError> {
    serde_json::from_str(frame.as_text()?)
        .map_err(|e| FeedError::malformed(format!("invalid frame json: {e}")))
}

pub(crate) fn decode_payload<T: DeserializeOwned>(
    topic: &str,
    payload: serde_json::Value,
) -> Result<T, FeedError> {
    serde_json::from_value(payload).map_err(|e| FeedError::malformed(format!("{topic}: {e}")))
}

pub(crate) fn unknown_topic(protocol: ProtocolVersion, topic: &str) -> FeedError {
    FeedError::malformed(format!("unexpected {protocol} topic: {topic}"))
}

/// Block arrival payload. Chrysalis calls blocks messages.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NodeBlock {
    #[serde(alias = "messageId")]
    pub block_id: String,
    #[serde(alias = "message")]
    pub block: serde_json::Value,
}

impl NodeBlock {
    pub fn into_update(self) -> Result<BlockUpdate, FeedError> {
        if self.block_id.is_empty() {
            return Err(FeedError::malformed("block without id"));
        }
        Ok(BlockUpdate {
            block_id: self.block_id,
            block: self.block,
        })
    }
}

/// Milestone payload shared by Chrysalis and Stardust.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NodeMilestone {
    pub index: u32,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub milestone_id: Option<String>,
}

impl From<NodeMilestone> for MilestoneUpdate {
    fn from(milestone: NodeMilestone) -> Self {
        Self {
            milestone_id: milestone.milestone_id,
            milestone_index: milestone.index,
            timestamp: milestone.timestamp,
        }
    }
}

/// Milestone-era metadata as reported by Chrysalis and Stardust nodes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NodeMetadata {
    #[serde(alias = "messageId")]
    pub block_id: String,
    #[serde(default)]
    pub is_solid: bool,
    #[serde(default)]
    pub referenced_by_milestone_index: Option<u32>,
    /// Set when the item is itself a milestone.
    #[serde(default)]
    pub milestone_index: Option<u32>,
    #[serde(default)]
    pub milestone_timestamp: Option<u64>,
    /// `included`, `conflicting` or `noTransaction`.
    #[serde(default)]
    pub ledger_inclusion_state: Option<String>,
    #[serde(default)]
    pub conflict_reason: Option<u8>,
}

impl NodeMetadata {
    pub fn into_update(self) -> Result<BlockMetadataUpdate, FeedError> {
        if self.block_id.is_empty() {
            return Err(FeedError::malformed("metadata without block id"));
        }
        let state = self.ledger_inclusion_state.as_deref();
        let milestone_index = self.referenced_by_milestone_index.or(self.milestone_index);
        Ok(BlockMetadataUpdate {
            block_id: self.block_id,
            metadata: ItemMetadata {
                referenced: milestone_index.is_some(),
                solid: self.is_solid,
                conflicting: state == Some("conflicting"),
                included: state == Some("included"),
                milestone_index,
                milestone_timestamp: self.milestone_timestamp,
                conflict_reason: self.conflict_reason.filter(|reason| *reason != 0),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_for_matches_protocol() {
        for protocol in [
            ProtocolVersion::Og,
            ProtocolVersion::Chrysalis,
            ProtocolVersion::Stardust,
            ProtocolVersion::Nova,
        ] {
            assert_eq!(adapter_for(protocol).protocol(), protocol);
            assert!(!adapter_for(protocol).topics().is_empty());
        }
    }

    #[test]
    fn test_metadata_mapping() {
        let raw: NodeMetadata = serde_json::from_str(
            r#"{"messageId":"0xaa","isSolid":true,"referencedByMilestoneIndex":12,
                "ledgerInclusionState":"conflicting","conflictReason":2}"#,
        )
        .unwrap();
        let update = raw.into_update().unwrap();
        assert_eq!(update.block_id, "0xaa");
        assert!(update.metadata.referenced);
        assert!(update.metadata.conflicting);
        assert!(!update.metadata.included);
        assert_eq!(update.metadata.milestone_index, Some(12));
        assert_eq!(update.metadata.conflict_reason, Some(2));
    }

    #[test]
    fn test_non_json_frame_is_malformed() {
        let err = topic_frame(&UpstreamFrame::Text("not json".to_string())).unwrap_err();
        assert_eq!(err.code(), "malformed_upstream_event");
    }
}
