use crate::queue::balance::{LoadBalanceRequest, TaskPack};
use crate::queue::intervals::DisjointIntervalSet;
use crate::table::subtable::{Subtable, SubtableId, SubtablePayload};
use crate::world::types::ProcessRank;
use serde::{Deserialize, Serialize};

/// Position of a subtable in the exchange cache. Negative means uncached.
pub type CacheId = i64;

/// Everything the exchange routes between ranks. Encoded with bincode on the
/// router, one envelope per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouteMessage {
    /// A reference subtree shipped so the receiver can generate tasks
    /// against its local query subtrees.
    ReferenceSubtable { payload: SubtablePayload },
    /// An imported query subtree going home with its computed results.
    QueryFlush { payload: SubtablePayload },
    /// Work finished somewhere in the system; every rank subtracts it from
    /// its view of the global remainder.
    CompletedWork { quantity: u64 },
    /// A starved rank asking for work.
    LoadBalanceProbe { request: LoadBalanceRequest },
    /// A loaded rank answering a probe with exported query subtrees.
    ExtraTasks { pack: TaskPack },
}

/// A local reference subtree and the ranks that should receive it.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub begin: usize,
    pub count: usize,
    pub destinations: Vec<ProcessRank>,
}

/// A reference subtree delivered to this rank, ready for task generation.
#[derive(Debug, Clone, Copy)]
pub struct ReceivedReference {
    pub owner: ProcessRank,
    pub begin: usize,
    pub count: usize,
    pub cache_id: CacheId,
}

/// A query subtree imported through load balancing, rebuilt and cached.
pub struct ImportedQuery {
    pub query: Subtable,
    pub assigned: DisjointIntervalSet,
    pub remaining_work: u64,
    /// Cache blocks of the references that arrived with the query; each one
    /// already holds the single lock its future task owns.
    pub references: Vec<CacheId>,
}

/// Incoming traffic, decoded and staged for the queue to apply under its
/// own lock. Draining the router and applying these happen inside one
/// critical section, so the queue observes the same consistency as if the
/// network calls mutated it directly.
pub enum ExchangeEvent {
    ReceivedReferences(Vec<ReceivedReference>),
    ImportedQuery(ImportedQuery),
    ReturnedQuery { id: SubtableId, results: Vec<f64> },
    CompletedWork { quantity: u64 },
    LoadBalanceProbe { from: ProcessRank, request: LoadBalanceRequest },
}
