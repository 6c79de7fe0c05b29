//! Table Exchange Service
//!
//! The queue's only network surface. Owns the refcounted subtable cache,
//! routes reference subtrees to the ranks that need them, returns drained
//! imported query subtrees to their origin, and fans completed-work
//! quantities out to every peer.
//!
//! All methods run under the task queue's lock; incoming traffic is decoded
//! into `ExchangeEvent`s that the queue applies inside the same critical
//! section, so deliveries always observe a quiescent queue.
//!
//! Outgoing traffic is staged: query flushes leave before completed-work
//! broadcasts on every turn, so a rank always receives the results of work
//! done on its behalf no later than the news that the work finished.

use super::cache::{ReleaseOutcome, SubtableCache};
use super::types::{
    CacheId, ExchangeEvent, ImportedQuery, ReceivedReference, RouteMessage, RouteRequest,
};
use crate::queue::balance::{LoadBalanceRequest, TaskPack};
use crate::table::subtable::{Subtable, SubtableId, Table};
use crate::world::router::World;
use crate::world::types::ProcessRank;
use std::sync::Arc;

pub struct TableExchange {
    rank: ProcessRank,
    max_subtree_size: usize,
    do_load_balancing: bool,
    reference_table: Arc<Table>,
    cache: SubtableCache,
    /// Imported query subtrees waiting to be shipped home with their
    /// results.
    pending_flushes: Vec<Subtable>,
    /// Completed work not yet broadcast to peers.
    pending_completed: u64,
    /// Capacity for extra query points taken on through load balancing.
    extra_point_capacity: u64,
    extra_points_held: u64,
}

impl TableExchange {
    pub fn new(
        world: &World,
        max_subtree_size: usize,
        do_load_balancing: bool,
        query_table: &Arc<Table>,
        reference_table: Arc<Table>,
    ) -> Self {
        // A rank takes on at most a fair share of the global query load;
        // beyond that it is the bottleneck, not the helper. The local-shard
        // floor keeps large shards from refusing symmetric trades.
        let fair_share = world.total_query_points() / world.size() as u64;
        let extra_point_capacity = (query_table.n_points() as u64).max(fair_share);
        tracing::info!(
            "Rank {} exchange up: max subtree {}, load balancing {}, extra capacity {}",
            world.rank(),
            max_subtree_size,
            do_load_balancing,
            extra_point_capacity
        );
        Self {
            rank: world.rank(),
            max_subtree_size,
            do_load_balancing,
            reference_table,
            cache: SubtableCache::new(),
            pending_flushes: Vec::new(),
            pending_completed: 0,
            extra_point_capacity,
            extra_points_held: 0,
        }
    }

    pub fn do_load_balancing(&self) -> bool {
        self.do_load_balancing
    }

    /// The local reference shard, used to alias subtables that were routed
    /// by id but are resident here anyway.
    pub fn local_table(&self) -> &Arc<Table> {
        &self.reference_table
    }

    pub fn max_subtree_size(&self) -> usize {
        self.max_subtree_size
    }

    pub fn remaining_extra_points_to_hold(&self) -> u64 {
        self.extra_point_capacity
            .saturating_sub(self.extra_points_held)
    }

    /// The exchange is quiet: nothing staged to send and nothing waiting in
    /// the mailbox. Termination additionally requires the queue's global
    /// work counter to be zero.
    pub fn can_terminate(&self, world: &World) -> bool {
        self.pending_flushes.is_empty() && self.pending_completed == 0 && world.pending() == 0
    }

    // ---- cache ----------------------------------------------------------

    pub fn find_subtable(&self, cache_id: CacheId) -> Option<&Subtable> {
        self.cache.find(cache_id)
    }

    /// Aliases the local reference subtree with exactly the given range.
    pub fn find_by_begin_count(&self, begin: usize, count: usize) -> Option<Subtable> {
        self.reference_table
            .tree()
            .find_by_begin_count(begin, count)
            .map(|node| Subtable::alias(self.reference_table.clone(), node))
    }

    /// Caches a received subtable, pre-locked `num_referenced` times.
    pub fn push_subtable(&mut self, subtable: Subtable, num_referenced: u64) -> CacheId {
        let cache_id = self.cache.insert(subtable, num_referenced);
        if let Some(block) = self.cache.find(cache_id) {
            tracing::trace!("Rank {} cached {} as block {}", self.rank, block.id(), cache_id);
        }
        cache_id
    }

    pub fn lock_cache(&mut self, cache_id: CacheId, n: u64) {
        if cache_id >= 0 {
            self.cache.lock(cache_id, n);
        }
    }

    /// Removes lock units. Returns the id of a resident subtable whose
    /// count drained to zero; the caller integrity-checks it and then calls
    /// `evict_cache`.
    pub fn release_cache(&mut self, cache_id: CacheId, n: u64) -> Option<SubtableId> {
        if cache_id < 0 {
            return None;
        }
        match self.cache.release(cache_id, n) {
            ReleaseOutcome::Held | ReleaseOutcome::Drained(None) => None,
            ReleaseOutcome::Drained(Some(destruct_id)) => Some(destruct_id),
        }
    }

    pub fn evict_cache(&mut self, cache_id: CacheId) {
        self.cache.evict(cache_id);
    }

    pub fn cache_refcount(&self, cache_id: CacheId) -> Option<u64> {
        self.cache.refcount(cache_id)
    }

    // ---- outgoing -------------------------------------------------------

    /// Stages a drained imported query subtree for return to its origin.
    pub fn queue_flush_request(&mut self, subtable: Subtable) {
        assert_ne!(
            subtable.originating_rank(),
            self.rank,
            "flushing a query subtree that already lives on its origin"
        );
        self.extra_points_held = self
            .extra_points_held
            .saturating_sub(subtable.count() as u64);
        self.pending_flushes.push(subtable);
    }

    /// Ships every staged flush home, results included.
    pub fn send_receive_query_flush_requests(&mut self, world: &World) {
        for subtable in self.pending_flushes.drain(..) {
            let origin = subtable.originating_rank();
            let payload = subtable.payload(true);
            tracing::debug!("Rank {} flushing {} home to {}", self.rank, payload.id(), origin);
            if let Err(e) = world.send(origin, &RouteMessage::QueryFlush { payload }) {
                tracing::warn!("Failed to flush query subtree to rank {}: {}", origin, e);
            }
        }
    }

    /// Accumulates a completed quantity for the next broadcast turn.
    pub fn push_completed_computation(&mut self, world: &World, quantity: u64) {
        if world.size() > 1 {
            self.pending_completed += quantity;
        }
    }

    pub fn send_load_balance_probe(&self, world: &World, to: ProcessRank, request: LoadBalanceRequest) {
        tracing::debug!(
            "Rank {} probing rank {} for work ({} extra points to hold)",
            self.rank,
            to,
            request.remaining_extra_points_to_hold
        );
        if let Err(e) = world.send(to, &RouteMessage::LoadBalanceProbe { request }) {
            tracing::warn!("Failed to probe rank {}: {}", to, e);
        }
    }

    pub fn send_extra_tasks(&self, world: &World, pack: TaskPack) {
        let to = pack.destination();
        tracing::info!(
            "Rank {} exporting {} query subtree(s) to rank {}",
            self.rank,
            pack.items.len(),
            to
        );
        if let Err(e) = world.send(to, &RouteMessage::ExtraTasks { pack }) {
            tracing::warn!("Failed to export tasks to rank {}: {}", to, e);
        }
    }

    /// Whether a send/receive turn can make progress. The in-memory fabric
    /// is always ready; a network transport gates on its in-flight windows
    /// here.
    pub fn ready_to_send_receive(&self, _world: &World) -> bool {
        true
    }

    // ---- the turn -------------------------------------------------------

    /// Routes outgoing reference subtrees and decodes everything waiting in
    /// the mailbox into events for the queue to apply.
    pub fn send_receive(
        &mut self,
        world: &World,
        hashed_reference_subtrees: &mut Vec<RouteRequest>,
    ) -> Vec<ExchangeEvent> {
        let mut events = Vec::new();

        // Outgoing: route each local reference granule to its destinations.
        for request in hashed_reference_subtrees.drain(..) {
            let Some(node) = self
                .reference_table
                .tree()
                .find_by_begin_count(request.begin, request.count)
            else {
                tracing::warn!(
                    "Rank {} cannot route unknown reference range {}+{}",
                    self.rank,
                    request.begin,
                    request.count
                );
                continue;
            };
            let mut delivered_to_self = Vec::new();
            for destination in request.destinations {
                if destination == self.rank {
                    // Local granules never cross the wire; they get an id
                    // and are aliased straight out of the local shard.
                    delivered_to_self.push(ReceivedReference {
                        owner: self.rank,
                        begin: request.begin,
                        count: request.count,
                        cache_id: self.cache.assign_id(),
                    });
                } else {
                    let payload =
                        Subtable::alias(self.reference_table.clone(), node).payload(false);
                    if let Err(e) =
                        world.send(destination, &RouteMessage::ReferenceSubtable { payload })
                    {
                        tracing::warn!(
                            "Failed to route reference subtree to rank {}: {}",
                            destination,
                            e
                        );
                    }
                }
            }
            if !delivered_to_self.is_empty() {
                events.push(ExchangeEvent::ReceivedReferences(delivered_to_self));
            }
        }

        // Broadcast accumulated completions after the flushes of this turn.
        if self.pending_completed > 0 {
            let quantity = self.pending_completed;
            self.pending_completed = 0;
            for peer in (0..world.size()).filter(|&peer| peer != self.rank) {
                if let Err(e) = world.send(peer, &RouteMessage::CompletedWork { quantity }) {
                    tracing::warn!("Failed to broadcast completed work to rank {}: {}", peer, e);
                }
            }
        }

        // Incoming: decode the whole mailbox in arrival order.
        for (from, message) in world.drain::<RouteMessage>() {
            match message {
                RouteMessage::ReferenceSubtable { payload } => {
                    let received = ReceivedReference {
                        owner: payload.rank,
                        begin: payload.begin,
                        count: payload.count(),
                        cache_id: 0,
                    };
                    let cache_id = self.push_subtable(payload.into_subtable(), 0);
                    events.push(ExchangeEvent::ReceivedReferences(vec![ReceivedReference {
                        cache_id,
                        ..received
                    }]));
                }
                RouteMessage::QueryFlush { payload } => {
                    let id = payload.id();
                    tracing::debug!("Rank {} received flushed query {} from {}", self.rank, id, from);
                    events.push(ExchangeEvent::ReturnedQuery {
                        id,
                        results: payload.results.unwrap_or_default(),
                    });
                }
                RouteMessage::CompletedWork { quantity } => {
                    events.push(ExchangeEvent::CompletedWork { quantity });
                }
                RouteMessage::LoadBalanceProbe { request } => {
                    events.push(ExchangeEvent::LoadBalanceProbe { from, request });
                }
                RouteMessage::ExtraTasks { pack } => {
                    for item in pack.items {
                        let references: Vec<CacheId> = item
                            .references
                            .into_iter()
                            .map(|reference| self.push_subtable(reference.into_subtable(), 1))
                            .collect();
                        let query = item.query.into_subtable();
                        self.extra_points_held += query.count() as u64;
                        tracing::info!(
                            "Rank {} imported query {} from rank {} with {} task(s)",
                            self.rank,
                            query.id(),
                            from,
                            references.len()
                        );
                        events.push(ExchangeEvent::ImportedQuery(ImportedQuery {
                            query,
                            assigned: item.assigned,
                            remaining_work: item.remaining_work,
                            references,
                        }));
                    }
                }
            }
        }

        events
    }

    /// Carves the local reference tree into granules of at most
    /// `max_subtree_size` points, each addressed to every rank. The higher
    /// level narrows destinations when it can prune; routing everything is
    /// the exhaustive default.
    pub fn essential_reference_subtrees(&self, world: &World) -> Vec<RouteRequest> {
        let destinations: Vec<ProcessRank> = (0..world.size()).collect();
        self.reference_table
            .tree()
            .frontier_bounded_by_size(self.max_subtree_size)
            .into_iter()
            .map(|node| {
                let node = self.reference_table.tree().node(node);
                RouteRequest {
                    begin: node.begin,
                    count: node.count,
                    destinations: destinations.clone(),
                }
            })
            .collect()
    }
}
