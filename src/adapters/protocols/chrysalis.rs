//! Chrysalis node events: messages, referenced message metadata and
//! latest milestones.

use crate::domain::{FeedError, FeedKind, FeedPayload, ProtocolVersion};
use crate::ports::feed_source::{ProtocolAdapter, SourceEvent, UpstreamFrame};

use super::{NodeBlock, NodeMetadata, NodeMilestone, decode_payload, topic_frame, unknown_topic};

const MESSAGES: &str = "messages";
const MESSAGES_REFERENCED: &str = "messages/referenced";
const MILESTONES_LATEST: &str = "milestones/latest";

#[derive(Debug, Default, Clone, Copy)]
pub struct ChrysalisAdapter;

impl ProtocolAdapter for ChrysalisAdapter {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Chrysalis
    }

    fn topics(&self) -> &'static [&'static str] {
        &[MESSAGES, MESSAGES_REFERENCED, MILESTONES_LATEST]
    }

    fn classify(&self, frame: &UpstreamFrame) -> Result<Vec<SourceEvent>, FeedError> {
        let frame = topic_frame(frame)?;
        let event = match frame.topic.as_str() {
            MESSAGES => {
                let message: NodeBlock = decode_payload(MESSAGES, frame.payload)?;
                SourceEvent::new(FeedKind::Block, FeedPayload::BlockUpdate(message.into_update()?))
            }
            MESSAGES_REFERENCED => {
                let metadata: NodeMetadata = decode_payload(MESSAGES_REFERENCED, frame.payload)?;
                SourceEvent::new(
                    FeedKind::Block,
                    FeedPayload::BlockMetadataUpdate(metadata.into_update()?),
                )
            }
            MILESTONES_LATEST => {
                let milestone: NodeMilestone = decode_payload(MILESTONES_LATEST, frame.payload)?;
                SourceEvent::new(FeedKind::Milestone, FeedPayload::MilestoneUpdate(milestone.into()))
            }
            other => return Err(unknown_topic(self.protocol(), other)),
        };
        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Result<Vec<SourceEvent>, FeedError> {
        ChrysalisAdapter.classify(&UpstreamFrame::Text(text.to_string()))
    }

    #[test]
    fn test_message_becomes_block_update() {
        let events = classify(
            r#"{"topic":"messages","payload":{"messageId":"0x01","message":{"networkId":"1"}}}"#,
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, FeedKind::Block);
        assert_eq!(events[0].payload.block_id(), Some("0x01"));
    }

    #[test]
    fn test_latest_milestone() {
        let events = classify(
            r#"{"topic":"milestones/latest","payload":{"index":42,"timestamp":1609459200}}"#,
        )
        .unwrap();
        match &events[0].payload {
            FeedPayload::MilestoneUpdate(update) => {
                assert_eq!(update.milestone_index, 42);
                assert_eq!(update.timestamp, 1_609_459_200);
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(events[0].kind, FeedKind::Milestone);
    }

    #[test]
    fn test_out_of_schema_frames_are_malformed() {
        assert!(classify(r#"{"topic":"messages","payload":{"message":{}}}"#).is_err());
        assert!(classify(r#"{"topic":"outputs/abc","payload":{}}"#).is_err());
        assert!(classify(r#"{"topic":"messages","payload":{"messageId":"","message":{}}}"#).is_err());
    }
}
