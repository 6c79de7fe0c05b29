//! Task Priority Queue
//!
//! A max-heap of dual-tree tasks. Priority is the negated midpoint of the
//! squared-distance range between the query and reference bounds, minus a
//! rank-favoring term (currently weighted zero): geometrically close pairs
//! run first because they produce most of the result mass. Ties break by
//! insertion order, which keeps per-process dispatch deterministic.

use crate::table::subtable::Subtable;
use crate::table::types::Metric;
use crate::world::router::World;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Weight of the peer-distance term in the priority formula. Zero keeps
/// pure geometric ordering; the term is still evaluated so retuning is a
/// constant change.
pub const PROCESS_RANK_FAVOR_FACTOR: f64 = 0.0;

/// Priority of pairing `query` with `reference` on this rank.
pub fn task_priority<M: Metric>(
    metric: &M,
    world: &World,
    query: &Subtable,
    reference: &Subtable,
) -> f64 {
    let range = metric.range_distance_sq(query.bound(), reference.bound());
    -range.mid()
        - PROCESS_RANK_FAVOR_FACTOR * world.process_distance(reference.originating_rank()) as f64
}

/// One unit of work: a query subtree paired with a reference subtree.
#[derive(Clone)]
pub struct Task {
    query: Subtable,
    reference: Subtable,
    priority: f64,
    work: u64,
}

impl Task {
    pub fn new(query: Subtable, reference: Subtable, priority: f64) -> Self {
        let work = query.count() as u64 * reference.count() as u64;
        assert!(work > 0, "task with zero work: {} x {}", query.id(), reference.id());
        Self {
            query,
            reference,
            priority,
            work,
        }
    }

    pub fn query(&self) -> &Subtable {
        &self.query
    }

    pub fn reference(&self) -> &Subtable {
        &self.reference
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    /// Point-pair count this task covers: `|query| * |reference|`.
    pub fn work(&self) -> u64 {
        self.work
    }
}

struct HeapEntry {
    priority: f64,
    seq: u64,
    task: Task,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority wins; among equals the earlier push wins.
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-heap of tasks for one query subtree slot.
#[derive(Default)]
pub struct TaskHeap {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl TaskHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        let entry = HeapEntry {
            priority: task.priority(),
            seq: self.next_seq,
            task,
        };
        self.next_seq += 1;
        self.heap.push(entry);
    }

    pub fn top(&self) -> Option<&Task> {
        self.heap.peek().map(|entry| &entry.task)
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|entry| entry.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Visits every queued task in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.heap.iter().map(|entry| &entry.task)
    }

    /// Removes and returns all tasks, highest priority first.
    pub fn drain_sorted(&mut self) -> Vec<Task> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            drained.push(entry.task);
        }
        drained
    }
}
