//! Mailbox Router
//!
//! The in-process message fabric connecting all ranks. One mailbox per rank,
//! registered at join time. Envelopes carry bincode payloads so the send path
//! exercises the same encode/decode discipline a socket transport would; a
//! real deployment swaps this component for a network-backed one without
//! touching the exchange layer.

use super::types::{Envelope, ProcessRank, ShardCounts};
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Shared registry of rank mailboxes.
pub struct Router {
    mailboxes: DashMap<ProcessRank, Arc<Mutex<VecDeque<Envelope>>>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mailboxes: DashMap::new(),
        })
    }

    fn register(&self, rank: ProcessRank) -> Arc<Mutex<VecDeque<Envelope>>> {
        let mailbox = Arc::new(Mutex::new(VecDeque::new()));
        self.mailboxes.insert(rank, mailbox.clone());
        mailbox
    }

    fn deliver(&self, to: ProcessRank, envelope: Envelope) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get(&to)
            .ok_or_else(|| anyhow!("no mailbox registered for rank {}", to))?;
        mailbox.lock().unwrap().push_back(envelope);
        Ok(())
    }
}

/// A single rank's view of the cluster: identity, topology metadata, and its
/// endpoint on the router.
pub struct World {
    rank: ProcessRank,
    shard_counts: Vec<ShardCounts>,
    router: Arc<Router>,
    inbox: Arc<Mutex<VecDeque<Envelope>>>,
}

impl World {
    /// Joins the router as `rank`. Every rank must be constructed with the
    /// same `shard_counts` vector; its length is the world size.
    pub fn join(router: Arc<Router>, rank: ProcessRank, shard_counts: Vec<ShardCounts>) -> Arc<Self> {
        let inbox = router.register(rank);
        tracing::info!(
            "Rank {} joined world of size {}",
            rank,
            shard_counts.len()
        );
        Arc::new(Self {
            rank,
            shard_counts,
            router,
            inbox,
        })
    }

    /// Convenience constructor for a world with a single rank.
    pub fn single(queries: u64, references: u64) -> Arc<Self> {
        Self::join(Router::new(), 0, vec![ShardCounts { queries, references }])
    }

    pub fn rank(&self) -> ProcessRank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shard_counts.len()
    }

    /// Query-point count held by the given rank.
    pub fn query_count(&self, rank: ProcessRank) -> u64 {
        self.shard_counts[rank].queries
    }

    /// Reference-point count held by the given rank.
    pub fn reference_count(&self, rank: ProcessRank) -> u64 {
        self.shard_counts[rank].references
    }

    pub fn total_query_points(&self) -> u64 {
        self.shard_counts.iter().map(|counts| counts.queries).sum()
    }

    pub fn total_reference_points(&self) -> u64 {
        self.shard_counts.iter().map(|counts| counts.references).sum()
    }

    /// Hypercube bit distance between this rank and a peer. Feeds the
    /// rank-favoring term of the task priority formula.
    pub fn process_distance(&self, other: ProcessRank) -> u32 {
        (self.rank ^ other).count_ones()
    }

    /// Encodes and delivers a message to the given rank. Self-sends are
    /// legal and loop back through this rank's own mailbox.
    pub fn send<T: Serialize>(&self, to: ProcessRank, message: &T) -> Result<()> {
        let payload = bincode::serialize(message)?;
        self.router.deliver(
            to,
            Envelope {
                from: self.rank,
                payload,
            },
        )
    }

    /// Drains every envelope currently in this rank's mailbox, decoding each
    /// against `T`. Undecodable envelopes are dropped with a warning, the
    /// same policy the gossip receive loop applies to malformed datagrams.
    pub fn drain<T: DeserializeOwned>(&self) -> Vec<(ProcessRank, T)> {
        let mut drained = Vec::new();
        let mut inbox = self.inbox.lock().unwrap();
        while let Some(envelope) = inbox.pop_front() {
            match bincode::deserialize::<T>(&envelope.payload) {
                Ok(message) => drained.push((envelope.from, message)),
                Err(e) => {
                    tracing::warn!(
                        "Dropping undecodable envelope from rank {}: {}",
                        envelope.from,
                        e
                    );
                }
            }
        }
        drained
    }

    /// Number of envelopes waiting in this rank's mailbox.
    pub fn pending(&self) -> usize {
        self.inbox.lock().unwrap().len()
    }
}
