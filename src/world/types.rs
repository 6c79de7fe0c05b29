use serde::{Deserialize, Serialize};

/// Identifier of a participating process. Ranks are dense: `0..world.size()`.
pub type ProcessRank = usize;

/// Per-rank shard sizes, agreed on by every rank at startup.
///
/// The product of the global sums initializes the remaining global
/// computation counter on every rank.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShardCounts {
    /// Number of query points held by the rank.
    pub queries: u64,
    /// Number of reference points held by the rank.
    pub references: u64,
}

/// A routed unit of traffic between ranks.
///
/// The payload is an opaque bincode encoding; the transport does not inspect
/// it. Decoding happens at the receiving rank against its own message type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ProcessRank,
    pub payload: Vec<u8>,
}
