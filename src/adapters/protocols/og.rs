//! Legacy (og) node events.
//!
//! The legacy node publishes one space-separated line per event on its
//! message queue, topic first:
//!
//! - `tx <hash> <address> <value> <obsoleteTag> <timestamp> <currentIndex>
//!   <lastIndex> <bundle> <trunk> <branch> <arrivalTime> <tag>`
//! - `sn <milestoneIndex> <hash> <address> <trunk> <branch> <bundle>`
//! - `lmi <previousIndex> <latestIndex>`
//!
//! Transactions play the role of blocks on the `transaction` feed.

use serde_json::{Map, Value, json};

use crate::domain::{
    BlockMetadataUpdate, BlockUpdate, FeedError, FeedKind, FeedPayload, ItemMetadata,
    MilestoneUpdate, ProtocolVersion,
};
use crate::ports::feed_source::{ProtocolAdapter, SourceEvent, UpstreamFrame};

use super::unknown_topic;

const TX: &str = "tx";
const CONFIRMED: &str = "sn";
const LATEST_MILESTONE: &str = "lmi";

/// Trailing `tx` fields, in order, after hash/address/value/obsoleteTag/timestamp.
const TX_OPTIONAL_FIELDS: [&str; 7] = [
    "currentIndex",
    "lastIndex",
    "bundle",
    "trunk",
    "branch",
    "arrivalTime",
    "tag",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct OgAdapter;

fn parse_field<T: std::str::FromStr>(topic: &str, name: &str, raw: Option<&str>) -> Result<T, FeedError> {
    let raw = raw.ok_or_else(|| FeedError::malformed(format!("{topic}: missing {name}")))?;
    raw.parse()
        .map_err(|_| FeedError::malformed(format!("{topic}: invalid {name} {raw:?}")))
}

fn transaction<'a>(mut fields: impl Iterator<Item = &'a str>) -> Result<SourceEvent, FeedError> {
    let hash: String = parse_field(TX, "hash", fields.next())?;
    let address: String = parse_field(TX, "address", fields.next())?;
    let value: i64 = parse_field(TX, "value", fields.next())?;
    let obsolete_tag: String = parse_field(TX, "obsoleteTag", fields.next())?;
    let timestamp: u64 = parse_field(TX, "timestamp", fields.next())?;

    let mut block = Map::new();
    block.insert("address".to_string(), json!(address));
    block.insert("value".to_string(), json!(value));
    block.insert("obsoleteTag".to_string(), json!(obsolete_tag));
    block.insert("timestamp".to_string(), json!(timestamp));
    for (name, raw) in TX_OPTIONAL_FIELDS.iter().zip(fields) {
        let value = raw.parse::<u64>().map_or_else(|_| json!(raw), |n| json!(n));
        block.insert((*name).to_string(), value);
    }

    Ok(SourceEvent::new(
        FeedKind::Transaction,
        FeedPayload::BlockUpdate(BlockUpdate {
            block_id: hash,
            block: Value::Object(block),
        }),
    ))
}

fn confirmed<'a>(mut fields: impl Iterator<Item = &'a str>) -> Result<SourceEvent, FeedError> {
    let milestone_index: u32 = parse_field(CONFIRMED, "milestoneIndex", fields.next())?;
    let hash: String = parse_field(CONFIRMED, "hash", fields.next())?;

    Ok(SourceEvent::new(
        FeedKind::Transaction,
        FeedPayload::BlockMetadataUpdate(BlockMetadataUpdate {
            block_id: hash,
            metadata: ItemMetadata {
                referenced: true,
                solid: true,
                included: true,
                milestone_index: Some(milestone_index),
                ..ItemMetadata::default()
            },
        }),
    ))
}

fn latest_milestone<'a>(mut fields: impl Iterator<Item = &'a str>) -> Result<SourceEvent, FeedError> {
    let _previous: u32 = parse_field(LATEST_MILESTONE, "previousIndex", fields.next())?;
    let latest: u32 = parse_field(LATEST_MILESTONE, "latestIndex", fields.next())?;

    Ok(SourceEvent::new(
        FeedKind::Milestone,
        FeedPayload::MilestoneUpdate(MilestoneUpdate {
            milestone_id: None,
            milestone_index: latest,
            timestamp: 0,
        }),
    ))
}

impl ProtocolAdapter for OgAdapter {
    fn protocol(&self) -> ProtocolVersion {
        ProtocolVersion::Og
    }

    fn topics(&self) -> &'static [&'static str] {
        &[TX, CONFIRMED, LATEST_MILESTONE]
    }

    fn classify(&self, frame: &UpstreamFrame) -> Result<Vec<SourceEvent>, FeedError> {
        let mut fields = frame.as_text()?.split_whitespace();
        let event = match fields.next() {
            Some(TX) => transaction(fields)?,
            Some(CONFIRMED) => confirmed(fields)?,
            Some(LATEST_MILESTONE) => latest_milestone(fields)?,
            Some(other) => return Err(unknown_topic(self.protocol(), other)),
            None => return Err(FeedError::malformed("empty frame")),
        };
        Ok(vec![event])
    }
}
