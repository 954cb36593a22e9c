//! Feed catalogue: networks, protocol generations and feed kinds.
//!
//! The validity table in [`ProtocolVersion::supported_feeds`] is the single
//! source of truth for which feed kinds a network may serve. Everything
//! else (registry validation, adapter routing, default selection) reads it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Logical network name as it appears in configuration (e.g. "mainnet").
pub type NetworkId = String;

/// Item identifier at the ports boundary (block, message or transaction id).
pub type BlockId = String;

/// Protocol generation of a configured network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Legacy transaction-based ledger.
    Og,
    /// Message/milestone ledger.
    Chrysalis,
    /// Block/milestone ledger with outputs.
    Stardust,
    /// Slot-based ledger with commitments.
    Nova,
}

impl ProtocolVersion {
    /// Feed kinds a network of this generation can serve.
    pub const fn supported_feeds(self) -> &'static [FeedKind] {
        match self {
            Self::Og => &[FeedKind::Transaction, FeedKind::Milestone],
            Self::Chrysalis | Self::Stardust => &[FeedKind::Block, FeedKind::Milestone],
            Self::Nova => &[
                FeedKind::Block,
                FeedKind::CommitmentsLatest,
                FeedKind::SlotBlocks,
            ],
        }
    }

    /// Feed used when a subscribe request omits `feedSelect`.
    pub const fn default_feed(self) -> FeedKind {
        match self {
            Self::Og => FeedKind::Transaction,
            Self::Chrysalis | Self::Stardust | Self::Nova => FeedKind::Block,
        }
    }

    pub fn supports(self, kind: FeedKind) -> bool {
        self.supported_feeds().contains(&kind)
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Og => write!(f, "og"),
            Self::Chrysalis => write!(f, "chrysalis"),
            Self::Stardust => write!(f, "stardust"),
            Self::Nova => write!(f, "nova"),
        }
    }
}

/// Named live stream of ledger events for one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FeedKind {
    #[serde(rename = "transaction")]
    Transaction,
    #[serde(rename = "block")]
    Block,
    #[serde(rename = "milestone")]
    Milestone,
    #[serde(rename = "commitments/latest")]
    CommitmentsLatest,
    #[serde(rename = "slot-blocks")]
    SlotBlocks,
}

impl FeedKind {
    pub const ALL: [Self; 5] = [
        Self::Transaction,
        Self::Block,
        Self::Milestone,
        Self::CommitmentsLatest,
        Self::SlotBlocks,
    ];

    /// Wire name used in requests and metric labels.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
            Self::Block => "block",
            Self::Milestone => "milestone",
            Self::CommitmentsLatest => "commitments/latest",
            Self::SlotBlocks => "slot-blocks",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown feed kind: {s}"))
    }
}

/// Routing key for subscriber sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedKey {
    pub network: NetworkId,
    pub kind: FeedKind,
}

impl FeedKey {
    pub fn new(network: impl Into<NetworkId>, kind: FeedKind) -> Self {
        Self {
            network: network.into(),
            kind,
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.kind)
    }
}
