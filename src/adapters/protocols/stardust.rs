//! Stardust node events: blocks, referenced block metadata and latest
//! milestone info.

use crate::domain::{FeedError, FeedKind, FeedPayload, ProtocolVersion};
use crate::ports::feed_source::{ProtocolAdapter, SourceEvent, UpstreamFrame};

use super::{NodeBlock, NodeMetadata, NodeMilestone, decode_payload, topic_frame, unknown_topic};

const BLOCKS: &str = "blocks";
const BLOCK_METADATA_REFERENCED: &str = "block-metadata/referenced";
const MILESTONE_INFO_LATEST: &str = "milestone-info/latest";

#[derive(Debug, Default, Clone, Copy)]
pub struct StardustAdapter;

impl ProtocolAdapter for StardustAdapter {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Stardust
    }

    fn topics(&self) -> &'static [&'static str] {
        &[BLOCKS, BLOCK_METADATA_REFERENCED, MILESTONE_INFO_LATEST]
    }

    fn classify(&self, frame: &UpstreamFrame) -> Result<Vec<SourceEvent>, FeedError> {
        let frame = topic_frame(frame)?;
        let event = match frame.topic.as_str() {
            BLOCKS => {
                let block: NodeBlock = decode_payload(BLOCKS, frame.payload)?;
                SourceEvent::new(FeedKind::Block, FeedPayload::BlockUpdate(block.into_update()?))
            }
            BLOCK_METADATA_REFERENCED => {
                let metadata: NodeMetadata =
                    decode_payload(BLOCK_METADATA_REFERENCED, frame.payload)?;
                SourceEvent::new(
                    FeedKind::Block,
                    FeedPayload::BlockMetadataUpdate(metadata.into_update()?),
                )
            }
            MILESTONE_INFO_LATEST => {
                let milestone: NodeMilestone =
                    decode_payload(MILESTONE_INFO_LATEST, frame.payload)?;
                SourceEvent::new(FeedKind::Milestone, FeedPayload::MilestoneUpdate(milestone.into()))
            }
            other => return Err(unknown_topic(self.protocol(), other)),
        };
        Ok(vec![event])
    }
}
