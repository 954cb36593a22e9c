//! Nova node events.
//!
//! Nova has no milestones. Blocks are grouped into slots, and a slot is
//! final once its commitment is finalized. Blocks feed both `block` and
//! `slot-blocks`; finalized commitments close a slot on `slot-blocks`
//! and advance `commitments/latest`.

use serde::Deserialize;

use crate::domain::{
    BlockMetadataUpdate, FeedError, FeedKind, FeedPayload, ItemMetadata, ProtocolVersion,
    SlotFinalized,
};
use crate::ports::feed_source::{ProtocolAdapter, SourceEvent, UpstreamFrame};

use super::{NodeBlock, decode_payload, topic_frame, unknown_topic};

const BLOCKS: &str = "blocks";
const BLOCK_METADATA_ACCEPTED: &str = "block-metadata/accepted";
const BLOCK_METADATA_CONFIRMED: &str = "block-metadata/confirmed";
const BLOCK_METADATA_FINALIZED: &str = "block-metadata/finalized";
const COMMITMENTS_FINALIZED: &str = "commitments/finalized";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
enum BlockState {
    Pending,
    Accepted,
    Confirmed,
    Finalized,
    Rejected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
enum TransactionState {
    Pending,
    Accepted,
    Committed,
    Finalized,
    Failed,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionMetadata {
    transaction_state: TransactionState,
    #[serde(default)]
    transaction_failure_reason: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NovaBlockMetadata {
    block_id: String,
    block_state: BlockState,
    #[serde(default)]
    transaction_metadata: Option<TransactionMetadata>,
}

impl NovaBlockMetadata {
    fn into_update(self) -> Result<BlockMetadataUpdate, FeedError> {
        if self.block_id.is_empty() {
            return Err(FeedError::malformed("metadata without block id"));
        }
        let tx_state = self.transaction_metadata.as_ref().map(|tx| tx.transaction_state);
        Ok(BlockMetadataUpdate {
            block_id: self.block_id,
            metadata: ItemMetadata {
                referenced: matches!(self.block_state, BlockState::Confirmed | BlockState::Finalized),
                solid: self.block_state != BlockState::Pending,
                conflicting: matches!(self.block_state, BlockState::Rejected | BlockState::Failed)
                    || tx_state == Some(TransactionState::Failed),
                included: matches!(
                    tx_state,
                    Some(TransactionState::Committed | TransactionState::Finalized)
                ),
                milestone_index: None,
                milestone_timestamp: None,
                conflict_reason: self
                    .transaction_metadata
                    .and_then(|tx| tx.transaction_failure_reason),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizedCommitment {
    #[serde(alias = "slotIndex")]
    slot: u64,
    #[serde(default)]
    commitment_id: Option<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NovaAdapter;

impl ProtocolAdapter for NovaAdapter {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Nova
    }

    fn topics(&self) -> &'static [&'static str] {
        &[
            BLOCKS,
            BLOCK_METADATA_ACCEPTED,
            BLOCK_METADATA_CONFIRMED,
            BLOCK_METADATA_FINALIZED,
            COMMITMENTS_FINALIZED,
        ]
    }

    fn classify(&self, frame: &UpstreamFrame) -> Result<Vec<SourceEvent>, FeedError> {
        let frame = topic_frame(frame)?;
        match frame.topic.as_str() {
            BLOCKS => {
                let block: NodeBlock = decode_payload(BLOCKS, frame.payload)?;
                let payload = FeedPayload::BlockUpdate(block.into_update()?);
                Ok(vec![
                    SourceEvent::new(FeedKind::Block, payload.clone()),
                    SourceEvent::new(FeedKind::SlotBlocks, payload),
                ])
            }
            topic @ (BLOCK_METADATA_ACCEPTED | BLOCK_METADATA_CONFIRMED | BLOCK_METADATA_FINALIZED) => {
                let metadata: NovaBlockMetadata = decode_payload(topic, frame.payload)?;
                Ok(vec![SourceEvent::new(
                    FeedKind::Block,
                    FeedPayload::BlockMetadataUpdate(metadata.into_update()?),
                )])
            }
            COMMITMENTS_FINALIZED => {
                let commitment: FinalizedCommitment =
                    decode_payload(COMMITMENTS_FINALIZED, frame.payload)?;
                let payload = FeedPayload::SlotFinalized(SlotFinalized {
                    slot_index: commitment.slot,
                    commitment_id: commitment.commitment_id,
                });
                Ok(vec![
                    SourceEvent::new(FeedKind::CommitmentsLatest, payload.clone()),
                    SourceEvent::new(FeedKind::SlotBlocks, payload),
                ])
            }
            other => Err(unknown_topic(self.protocol(), other)),
        }
    }
}
