//! Tables, Subtable Views, and Wire Payloads
//!
//! A `Table` is one rank's shard of points plus its tree and a per-point
//! result accumulator. A `Subtable` is a cheap view into a table (Arc +
//! node index) carrying the originating rank and the exchange cache block it
//! occupies, if any. Crossing the wire turns a view into a `SubtablePayload`
//! deep copy; the receiver rebuilds a standalone table from it, preserving
//! origin row coordinates.

use super::tree::{self, Tree, TreeNode};
use super::types::BoundingBox;
use crate::world::types::ProcessRank;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Cache block id of a subtable that is not resident in the exchange cache.
pub const UNCACHED: i64 = -1;

/// Identity of a subtree: originating rank plus the half-open row range
/// `[begin, begin + count)` in the origin table's coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubtableId {
    pub rank: ProcessRank,
    pub begin: usize,
    pub count: usize,
}

impl SubtableId {
    pub fn end(&self) -> usize {
        self.begin + self.count
    }

    /// Whether this subtree's range covers `other`'s entirely.
    pub fn includes(&self, other: &SubtableId) -> bool {
        self.rank == other.rank && self.begin <= other.begin && other.end() <= self.end()
    }
}

impl std::fmt::Display for SubtableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.rank, self.begin, self.count)
    }
}

/// One rank's shard of points (or a received copy of part of one).
pub struct Table {
    rank: ProcessRank,
    dim: usize,
    /// Origin-table coordinate of row 0 of `data`. Zero for local shards.
    first_index: usize,
    data: Vec<f64>,
    tree: Tree,
    leaf_size: usize,
    /// Per-point accumulator; only meaningful for query tables.
    results: Mutex<Vec<f64>>,
}

impl Table {
    /// Builds a local shard: spatially sorts the rows once, then freezes row
    /// order and indexes them.
    pub fn new(rank: ProcessRank, dim: usize, mut data: Vec<f64>, leaf_size: usize) -> Arc<Self> {
        let leaf_size = leaf_size.max(1);
        tree::spatial_sort(&mut data, dim, leaf_size);
        let tree = Tree::build(&data, dim, 0, leaf_size);
        let n = data.len() / dim;
        Arc::new(Self {
            rank,
            dim,
            first_index: 0,
            data,
            tree,
            leaf_size,
            results: Mutex::new(vec![0.0; n]),
        })
    }

    /// Rebuilds a table from rows received off the wire. Rows are already in
    /// frozen order; the tree is rebuilt with the same midpoint splits the
    /// origin used, so subtree ids line up.
    pub fn from_received(
        rank: ProcessRank,
        dim: usize,
        first_index: usize,
        data: Vec<f64>,
        results: Vec<f64>,
        leaf_size: usize,
    ) -> Arc<Self> {
        let leaf_size = leaf_size.max(1);
        let tree = Tree::build(&data, dim, first_index, leaf_size);
        Arc::new(Self {
            rank,
            dim,
            first_index,
            data,
            tree,
            leaf_size,
            results: Mutex::new(results),
        })
    }

    /// Leaf-size floor the tree was built with. Travels with wire payloads
    /// so a receiver reproduces the same splits.
    pub fn leaf_size(&self) -> usize {
        self.leaf_size
    }

    pub fn rank(&self) -> ProcessRank {
        self.rank
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn n_points(&self) -> usize {
        self.data.len() / self.dim
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Row at origin-table coordinate `index`.
    pub fn point(&self, index: usize) -> &[f64] {
        let local = (index - self.first_index) * self.dim;
        &self.data[local..local + self.dim]
    }

    /// Adds `delta` into the accumulator of the point at origin coordinate
    /// `index`.
    pub fn accumulate(&self, index: usize, delta: f64) {
        self.results.lock().unwrap()[index - self.first_index] += delta;
    }

    /// Copies out the accumulators for `[begin, begin + count)`.
    pub fn results_range(&self, begin: usize, count: usize) -> Vec<f64> {
        let local = begin - self.first_index;
        self.results.lock().unwrap()[local..local + count].to_vec()
    }

    /// Overwrites the accumulators for the range starting at `begin` with
    /// values computed elsewhere.
    pub fn store_results(&self, begin: usize, values: &[f64]) {
        let local = begin - self.first_index;
        self.results.lock().unwrap()[local..local + values.len()].copy_from_slice(values);
    }
}

/// A view of one subtree of a table.
#[derive(Clone)]
pub struct Subtable {
    table: Arc<Table>,
    node: usize,
    originating_rank: ProcessRank,
    cache_block_id: i64,
}

impl Subtable {
    /// Aliases a node of a table already held by this rank.
    pub fn alias(table: Arc<Table>, node: usize) -> Self {
        let originating_rank = table.rank();
        Self {
            table,
            node,
            originating_rank,
            cache_block_id: UNCACHED,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn start_node(&self) -> &TreeNode {
        self.table.tree().node(self.node)
    }

    pub fn node_index(&self) -> usize {
        self.node
    }

    /// Re-roots the view at another node of the same table. Split uses this
    /// to narrow a slot to the left child.
    pub fn set_node(&mut self, node: usize) {
        self.node = node;
    }

    pub fn id(&self) -> SubtableId {
        let node = self.start_node();
        SubtableId {
            rank: self.originating_rank,
            begin: node.begin,
            count: node.count,
        }
    }

    pub fn begin(&self) -> usize {
        self.start_node().begin
    }

    pub fn count(&self) -> usize {
        self.start_node().count
    }

    pub fn bound(&self) -> &BoundingBox {
        &self.start_node().bound
    }

    pub fn is_leaf(&self) -> bool {
        self.start_node().is_leaf()
    }

    pub fn originating_rank(&self) -> ProcessRank {
        self.originating_rank
    }

    pub fn set_originating_rank(&mut self, rank: ProcessRank) {
        self.originating_rank = rank;
    }

    pub fn cache_block_id(&self) -> i64 {
        self.cache_block_id
    }

    pub fn set_cache_block_id(&mut self, cache_block_id: i64) {
        self.cache_block_id = cache_block_id;
    }

    /// Deep copy for the wire. `with_results` is set for query subtables so
    /// partial accumulations travel with the points.
    pub fn payload(&self, with_results: bool) -> SubtablePayload {
        let node = self.start_node();
        let begin = node.begin;
        let count = node.count;
        let dim = self.table.dim();
        let mut rows = Vec::with_capacity(count * dim);
        for index in begin..begin + count {
            rows.extend_from_slice(self.table.point(index));
        }
        SubtablePayload {
            rank: self.originating_rank,
            begin,
            dim,
            leaf_size: self.table.leaf_size(),
            rows,
            results: if with_results {
                Some(self.table.results_range(begin, count))
            } else {
                None
            },
        }
    }
}

/// Serialized deep copy of a subtable, as routed between ranks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtablePayload {
    pub rank: ProcessRank,
    pub begin: usize,
    pub dim: usize,
    pub leaf_size: usize,
    pub rows: Vec<f64>,
    pub results: Option<Vec<f64>>,
}

impl SubtablePayload {
    pub fn count(&self) -> usize {
        self.rows.len() / self.dim
    }

    pub fn id(&self) -> SubtableId {
        SubtableId {
            rank: self.rank,
            begin: self.begin,
            count: self.count(),
        }
    }

    /// Rebuilds a standalone subtable rooted at the payload's whole range.
    pub fn into_subtable(self) -> Subtable {
        let count = self.count();
        let results = self.results.unwrap_or_else(|| vec![0.0; count]);
        let table = Table::from_received(
            self.rank,
            self.dim,
            self.begin,
            self.rows,
            results,
            self.leaf_size,
        );
        Subtable::alias(table, tree::ROOT)
    }
}
