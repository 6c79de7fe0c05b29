//! Load-Balance Wire Types
//!
//! A starved rank advertises what it already holds and how many extra points
//! it can take (`LoadBalanceRequest`); a loaded peer answers with a
//! `TaskPack` of exported query subtrees, each travelling with its assigned
//! history, its remaining-work counter, and the reference subtables of its
//! drained tasks. Carrying the assigned set with the query state is what
//! keeps exporter and importer from generating the same (query, reference)
//! pair twice.

use super::intervals::DisjointIntervalSet;
use crate::table::subtable::{SubtableId, SubtablePayload};
use crate::world::types::ProcessRank;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Snapshot a rank sends when probing a peer for work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalanceRequest {
    /// Identities of every query subtree already resident on the probing
    /// rank (active and checked out). The answering peer must not export
    /// these back.
    pub owned_query_subtables: HashSet<SubtableId>,
    /// The prober's remaining local work, so the peer can judge starvation.
    pub remaining_local_computation: u64,
    /// How many extra points the prober can still take on.
    pub remaining_extra_points_to_hold: u64,
}

impl LoadBalanceRequest {
    pub fn query_subtable_is_owned(&self, id: &SubtableId) -> bool {
        self.owned_query_subtables.contains(id)
    }
}

/// One exported query subtree and everything it needs to run remotely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedQuery {
    /// The query points, with their partial result accumulators.
    pub query: SubtablePayload,
    /// Assigned reference intervals at the moment of export.
    pub assigned: DisjointIntervalSet,
    /// Reference points this query subtree still has to meet.
    pub remaining_work: u64,
    /// Reference subtables of the tasks drained out of the slot, one task
    /// each.
    pub references: Vec<SubtablePayload>,
}

impl ExportedQuery {
    /// Points this export adds to the destination's long-term holdings. The
    /// reference payloads are transient cache blocks and are not counted.
    pub fn cost(&self) -> u64 {
        self.query.count() as u64
    }
}

/// The outgoing packet built by `prepare_extra_task_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPack {
    destination: ProcessRank,
    remaining_extra_points_to_hold: u64,
    pub items: Vec<ExportedQuery>,
}

impl TaskPack {
    pub fn new(destination: ProcessRank, budget: u64) -> Self {
        Self {
            destination,
            remaining_extra_points_to_hold: budget,
            items: Vec::new(),
        }
    }

    pub fn destination(&self) -> ProcessRank {
        self.destination
    }

    /// Budget left before the destination's capacity is exhausted.
    pub fn remaining_extra_points_to_hold(&self) -> u64 {
        self.remaining_extra_points_to_hold
    }

    pub fn has_budget_for(&self, cost: u64) -> bool {
        cost <= self.remaining_extra_points_to_hold
    }

    /// Admits an export, consuming its cost from the budget. Callers check
    /// the budget before draining the slot.
    pub fn push(&mut self, item: ExportedQuery) {
        let cost = item.cost();
        assert!(
            self.has_budget_for(cost),
            "export of {} points exceeds remaining budget {}",
            cost,
            self.remaining_extra_points_to_hold
        );
        self.remaining_extra_points_to_hold -= cost;
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
