//! Distributed Dual-Tree Task Queue
//!
//! The scheduling core of the system. Every rank keeps a pool of active
//! query subtree slots, each with its own task heap, its assigned reference
//! intervals, and a remaining-work counter; query subtrees that left the
//! pool (checked out to a worker, or exported to a peer) wait in the
//! checked-out list until they come back through `synchronize` or
//! `return_query_subtable`.
//!
//! ## Locking
//! One process-wide mutex guards all queue state. Public methods on
//! `TaskQueue` lock it once and delegate to the non-locking bodies on
//! `QueueState`, which call each other freely; this replaces the re-entrant
//! lock the operations otherwise require. Exchange traffic is drained and
//! applied inside the same critical section, so deliveries always observe a
//! quiescent queue.
//!
//! ## Accounting
//! - `remaining_global`: this rank's view of outstanding point-pair work in
//!   the whole system; zero (plus a quiet exchange) means termination.
//! - `remaining_local`: the work of every task currently in any heap here.
//! - `num_remaining_tasks`: heap sizes summed over active and checked-out.
//! - `num_exported` / `num_imported`: query subtrees lent to remote ranks /
//!   borrowed from them.
//! Counter underflow means the state machine broke, and it is fatal.

use super::balance::{ExportedQuery, LoadBalanceRequest, TaskPack};
use super::priority::{Task, TaskHeap, task_priority};
use crate::exchange::service::TableExchange;
use crate::exchange::types::{CacheId, ExchangeEvent, ReceivedReference, RouteRequest};
use crate::queue::intervals::DisjointIntervalSet;
use crate::table::subtable::{Subtable, SubtableId, Table};
use crate::table::types::Metric;
use crate::world::router::World;
use crate::world::types::ProcessRank;
use anyhow::{Result, bail};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// A starved rank sends a load-balance probe every this many idle
/// send/receive turns.
const LOAD_BALANCE_PROBE_INTERVAL: u32 = 4;

/// Stable identifier of a checked-out entry.
pub type CheckoutHandle = u64;

/// One active query subtree and everything scheduled against it.
struct QuerySlot {
    subtable: Subtable,
    tasks: TaskHeap,
    assigned: DisjointIntervalSet,
    remaining_work: u64,
}

/// A query subtree away from the active pool, with the rank that holds it.
struct CheckedOutEntry {
    slot: QuerySlot,
    locked_by: ProcessRank,
}

/// A successfully dequeued task. `slot` is the probe position at dequeue
/// time; it is stale once the slot has been checked out or cleaned up.
pub struct DequeuedTask {
    pub task: Task,
    pub slot: usize,
    pub checkout: Option<CheckoutHandle>,
}

/// Outcome of probing a single slot for work.
pub enum SlotDequeue {
    Task(DequeuedTask),
    /// The slot was evicted or flushed; the tail slot now sits at the probe
    /// position and must be re-examined.
    CleanedUp,
    /// No task, but the slot stays (its remaining work is nonzero).
    Empty,
}

struct QueueState {
    rank: ProcessRank,
    num_threads: usize,
    slots: Vec<QuerySlot>,
    checked_out: BTreeMap<CheckoutHandle, CheckedOutEntry>,
    next_checkout_handle: CheckoutHandle,
    num_exported: usize,
    num_imported: usize,
    num_remaining_tasks: usize,
    remaining_global: u64,
    remaining_local: u64,
    exchange: TableExchange,
    idle_turns: u32,
}

/// The process-wide queue. All methods lock the single state mutex.
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    /// Builds the queue for this rank: carves the local query tree into
    /// roughly `4 * num_threads` active slots, sizes the global work
    /// counters from the world's shard counts, and brings up the exchange.
    pub fn init(
        world: &World,
        max_subtree_size: usize,
        do_load_balancing: bool,
        query_table: Arc<Table>,
        reference_table: Arc<Table>,
        num_threads: usize,
    ) -> Arc<Self> {
        let num_threads = num_threads.max(1);
        let frontier = query_table.tree().frontier_bounded_by(4 * num_threads);
        let total_references = world.total_reference_points();
        let slots: Vec<QuerySlot> = frontier
            .into_iter()
            .map(|node| QuerySlot {
                subtable: Subtable::alias(query_table.clone(), node),
                tasks: TaskHeap::new(),
                assigned: DisjointIntervalSet::new(),
                remaining_work: total_references,
            })
            .collect();
        let remaining_global = world.total_query_points() * total_references;
        let exchange = TableExchange::new(
            world,
            max_subtree_size,
            do_load_balancing,
            &query_table,
            reference_table,
        );
        tracing::info!(
            "Rank {} task queue up: {} slot(s), {} worker thread(s), {} global point pairs",
            world.rank(),
            slots.len(),
            num_threads,
            remaining_global
        );
        Arc::new(Self {
            state: Mutex::new(QueueState {
                rank: world.rank(),
                num_threads,
                slots,
                checked_out: BTreeMap::new(),
                next_checkout_handle: 0,
                num_exported: 0,
                num_imported: 0,
                num_remaining_tasks: 0,
                remaining_global,
                remaining_local: 0,
                exchange,
                idle_turns: 0,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap()
    }

    pub fn push_task<M: Metric>(
        &self,
        world: &World,
        metric: &M,
        slot: usize,
        reference: Subtable,
    ) {
        self.state().push_task(world, metric, slot, reference);
    }

    pub fn generate_tasks<M: Metric>(
        &self,
        world: &World,
        metric: &M,
        received: &[ReceivedReference],
    ) {
        self.state().generate_tasks(world, metric, received);
    }

    pub fn push_new_queue(&self, originating_rank: ProcessRank, query_subtable: Subtable) -> usize {
        self.state().push_new_queue(originating_rank, query_subtable)
    }

    /// Scans the active slots for the highest-priority available task,
    /// splitting a subtree first if there are fewer slots than worker
    /// threads. With `want_checkout` the winning slot is atomically moved to
    /// the checked-out list under this rank's own lock.
    pub fn dequeue<M: Metric>(
        &self,
        world: &World,
        thread_id: usize,
        metric: &M,
        want_checkout: bool,
    ) -> Option<DequeuedTask> {
        self.state().dequeue(world, thread_id, metric, want_checkout)
    }

    /// Single-slot dequeue; see `SlotDequeue` for the cleanup contract.
    pub fn dequeue_from(&self, probe: usize, want_checkout: bool) -> SlotDequeue {
        self.state().dequeue_from(probe, want_checkout)
    }

    pub fn top(&self, probe: usize) -> Option<Task> {
        self.state().slots[probe].tasks.top().cloned()
    }

    pub fn pop(&self, probe: usize) -> Option<Task> {
        self.state().pop(probe)
    }

    pub fn size(&self, probe: usize) -> usize {
        self.state().slots[probe].tasks.len()
    }

    pub fn lock_query_subtable(&self, probe: usize, remote_rank: ProcessRank) -> CheckoutHandle {
        self.state().lock_query_subtable(probe, remote_rank)
    }

    pub fn return_query_subtable(&self, handle: CheckoutHandle) {
        self.state().return_query_subtable(handle);
    }

    /// Applies a returned query subtree to its checked-out entry. A full
    /// identity match reactivates the entry; a strict sub-range is refused
    /// after its results are stored.
    pub fn synchronize(&self, id: &SubtableId, results: &[f64]) -> Result<()> {
        self.state().synchronize(id, results)
    }

    /// Completed work against every active slot (a whole-process prune).
    pub fn push_completed_computation(&self, world: &World, reference_count: u64, quantity: u64) {
        self.state()
            .push_completed_computation(world, reference_count, quantity);
    }

    /// Completed work scoped to one checked-out query subtree.
    pub fn push_completed_computation_checked_out(
        &self,
        world: &World,
        reference_count: u64,
        quantity: u64,
        handle: CheckoutHandle,
    ) {
        self.state()
            .push_completed_computation_checked_out(world, reference_count, quantity, handle);
    }

    pub fn prepare_load_balance_request(&self) -> LoadBalanceRequest {
        self.state().prepare_load_balance_request()
    }

    /// Packs as many active slots as the neighbor's budget allows into an
    /// outgoing task list, checking each one out to the neighbor. Priorities
    /// are not shipped; the importer recomputes them against its own rank.
    pub fn prepare_extra_task_list(
        &self,
        neighbor_rank: ProcessRank,
        neighbor_budget: u64,
        neighbor_request: &LoadBalanceRequest,
    ) -> TaskPack {
        self.state()
            .prepare_extra_task_list(neighbor_rank, neighbor_budget, neighbor_request)
    }

    pub fn redistribute_among_cores<M: Metric>(&self, world: &World, metric: &M) {
        self.state().redistribute_among_cores(world, metric);
    }

    pub fn split_subtree<M: Metric>(&self, world: &World, metric: &M, index: usize) {
        self.state().split_subtree(world, metric, index);
    }

    /// One cooperative network turn: flush drained imports home, route
    /// reference subtrees, apply everything the mailbox held, and probe for
    /// work when starved. Runs entirely under the queue lock.
    pub fn send_receive<M: Metric>(
        &self,
        world: &World,
        metric: &M,
        hashed_reference_subtrees: &mut Vec<RouteRequest>,
    ) {
        self.state()
            .send_receive(world, metric, hashed_reference_subtrees);
    }

    /// Releases lock units on a cache block, destroying it when the count
    /// drains (after verifying no task still references it).
    pub fn release_cache(&self, cache_id: CacheId, n: u64) {
        self.state().release_cache(cache_id, n);
    }

    /// The local reference granules to route at startup, each addressed to
    /// every rank. Hand the result to the worker pool.
    pub fn essential_reference_subtrees(&self, world: &World) -> Vec<RouteRequest> {
        self.state().exchange.essential_reference_subtrees(world)
    }

    /// Whether any task, active or checked out, still references the given
    /// reference subtree. Consulted before a cache block is destroyed.
    pub fn integrity_check(&self, destruct_id: &SubtableId) -> bool {
        self.state().integrity_check(destruct_id)
    }

    /// The computation is over for this rank: no outstanding work anywhere
    /// in its view, no borrowed query subtrees still resident (their
    /// results must flush home first), and a quiet exchange.
    pub fn can_terminate(&self, world: &World) -> bool {
        let state = self.state();
        state.remaining_global == 0
            && state.num_imported == 0
            && state.exchange.can_terminate(world)
    }

    pub fn is_empty(&self) -> bool {
        self.state().num_remaining_tasks == 0
    }

    pub fn num_remaining_tasks(&self) -> usize {
        self.state().num_remaining_tasks
    }

    pub fn remaining_local_computation(&self) -> u64 {
        self.state().remaining_local
    }

    pub fn remaining_global_computation(&self) -> u64 {
        self.state().remaining_global
    }

    pub fn num_exported_query_subtables(&self) -> usize {
        self.state().num_exported
    }

    pub fn num_imported_query_subtables(&self) -> usize {
        self.state().num_imported
    }

    pub fn active_slot_count(&self) -> usize {
        self.state().slots.len()
    }

    pub fn query_subtable_id(&self, probe: usize) -> SubtableId {
        self.state().slots[probe].subtable.id()
    }

    pub fn remaining_work_for(&self, probe: usize) -> u64 {
        self.state().slots[probe].remaining_work
    }

    pub fn cache_refcount(&self, cache_id: CacheId) -> Option<u64> {
        self.state().exchange.cache_refcount(cache_id)
    }

    /// Dumps every active slot and checked-out entry through tracing.
    pub fn print(&self) {
        self.state().print();
    }
}

impl QueueState {
    fn push_task<M: Metric>(&mut self, world: &World, metric: &M, slot: usize, reference: Subtable) {
        let priority = task_priority(metric, world, &self.slots[slot].subtable, &reference);
        let task = Task::new(self.slots[slot].subtable.clone(), reference, priority);
        self.credit_task(task.work());
        self.slots[slot].tasks.push(task);
    }

    fn credit_task(&mut self, work: u64) {
        self.num_remaining_tasks += 1;
        self.remaining_local += work;
    }

    fn debit_task(&mut self, work: u64) {
        self.num_remaining_tasks = self
            .num_remaining_tasks
            .checked_sub(1)
            .expect("task counter underflow");
        self.remaining_local = self
            .remaining_local
            .checked_sub(work)
            .expect("local work counter underflow");
    }

    fn generate_tasks<M: Metric>(
        &mut self,
        world: &World,
        metric: &M,
        received: &[ReceivedReference],
    ) {
        for delivery in received {
            let reference = match self.exchange.find_subtable(delivery.cache_id) {
                Some(resident) => resident.clone(),
                None => {
                    // Not resident: the granule is part of this rank's own
                    // reference shard. Alias it straight out of the table.
                    assert_eq!(
                        delivery.owner, self.rank,
                        "reference {}+{} from rank {} is neither cached nor local",
                        delivery.begin, delivery.count, delivery.owner
                    );
                    let mut alias = self
                        .exchange
                        .find_by_begin_count(delivery.begin, delivery.count)
                        .unwrap_or_else(|| {
                            panic!(
                                "local reference shard has no subtree {}+{}",
                                delivery.begin, delivery.count
                            )
                        });
                    alias.set_cache_block_id(delivery.cache_id);
                    alias
                }
            };
            let interval_end = delivery.begin + delivery.count;

            // Active slots in index order; only subtrees that originate here
            // take new work directly (imports run down what they brought).
            for slot in 0..self.slots.len() {
                if self.slots[slot].subtable.originating_rank() == self.rank
                    && self.slots[slot]
                        .assigned
                        .insert(delivery.owner, delivery.begin, interval_end)
                {
                    self.push_task(world, metric, slot, reference.clone());
                    self.exchange.lock_cache(delivery.cache_id, 1);
                }
            }

            // Checked-out entries in insertion order; new tasks wait in the
            // entry's own heap until it returns.
            let handles: Vec<CheckoutHandle> = self.checked_out.keys().copied().collect();
            for handle in handles {
                let entry = self.checked_out.get_mut(&handle).unwrap();
                if !entry
                    .slot
                    .assigned
                    .insert(delivery.owner, delivery.begin, interval_end)
                {
                    continue;
                }
                let priority = task_priority(metric, world, &entry.slot.subtable, &reference);
                let task = Task::new(entry.slot.subtable.clone(), reference.clone(), priority);
                let work = task.work();
                entry.slot.tasks.push(task);
                self.credit_task(work);
                self.exchange.lock_cache(delivery.cache_id, 1);
            }
        }
    }

    fn push_new_queue(&mut self, originating_rank: ProcessRank, query_subtable: Subtable) -> usize {
        let mut subtable = query_subtable;
        subtable.set_originating_rank(originating_rank);
        tracing::debug!(
            "Rank {} activating query subtree {} from rank {}",
            self.rank,
            subtable.id(),
            originating_rank
        );
        self.slots.push(QuerySlot {
            subtable,
            tasks: TaskHeap::new(),
            assigned: DisjointIntervalSet::new(),
            remaining_work: 0,
        });
        self.num_imported += 1;
        self.slots.len() - 1
    }

    fn dequeue<M: Metric>(
        &mut self,
        world: &World,
        thread_id: usize,
        metric: &M,
        want_checkout: bool,
    ) -> Option<DequeuedTask> {
        if self.slots.len() < self.num_threads {
            self.redistribute_among_cores(world, metric);
        }
        let mut probe = 0;
        while probe < self.slots.len() {
            match self.dequeue_from(probe, want_checkout) {
                SlotDequeue::Task(dequeued) => {
                    tracing::trace!(
                        "Rank {} worker {} dequeued {} x {}",
                        self.rank,
                        thread_id,
                        dequeued.task.query().id(),
                        dequeued.task.reference().id()
                    );
                    return Some(dequeued);
                }
                // Cleanup swapped the tail into this position.
                SlotDequeue::CleanedUp => {}
                SlotDequeue::Empty => probe += 1,
            }
        }
        None
    }

    fn dequeue_from(&mut self, probe: usize, want_checkout: bool) -> SlotDequeue {
        if !self.slots[probe].tasks.is_empty() {
            let task = self.slots[probe].tasks.pop().unwrap();
            self.debit_task(task.work());
            let checkout = want_checkout.then(|| self.lock_query_subtable(probe, self.rank));
            return SlotDequeue::Task(DequeuedTask {
                task,
                slot: probe,
                checkout,
            });
        }

        if self.slots[probe].subtable.originating_rank() == self.rank {
            // At-origin subtrees leave only when all their work is done.
            if self.slots[probe].remaining_work == 0 {
                self.evict(probe);
                return SlotDequeue::CleanedUp;
            }
        } else {
            // A drained import goes home with its results.
            self.flush(probe);
            return SlotDequeue::CleanedUp;
        }
        SlotDequeue::Empty
    }

    fn pop(&mut self, probe: usize) -> Option<Task> {
        let task = self.slots[probe].tasks.pop()?;
        self.debit_task(task.work());
        Some(task)
    }

    fn evict(&mut self, probe: usize) {
        let slot = self.slots.swap_remove(probe);
        tracing::debug!(
            "Rank {} evicted drained query subtree {}",
            self.rank,
            slot.subtable.id()
        );
    }

    fn flush(&mut self, probe: usize) {
        let slot = self.slots.swap_remove(probe);
        self.num_imported = self
            .num_imported
            .checked_sub(1)
            .expect("import counter underflow");
        self.exchange.queue_flush_request(slot.subtable);
    }

    fn lock_query_subtable(&mut self, probe: usize, remote_rank: ProcessRank) -> CheckoutHandle {
        let slot = self.slots.swap_remove(probe);
        if remote_rank != self.rank {
            self.num_exported += 1;
        }
        let handle = self.next_checkout_handle;
        self.next_checkout_handle += 1;
        self.checked_out
            .insert(handle, CheckedOutEntry { slot, locked_by: remote_rank });
        handle
    }

    fn return_query_subtable(&mut self, handle: CheckoutHandle) {
        let entry = self
            .checked_out
            .remove(&handle)
            .unwrap_or_else(|| panic!("returning unknown checkout handle {}", handle));
        if entry.locked_by != self.rank {
            self.num_exported = self
                .num_exported
                .checked_sub(1)
                .expect("export counter underflow");
        }
        self.slots.push(entry.slot);
    }

    fn synchronize(&mut self, id: &SubtableId, results: &[f64]) -> Result<()> {
        assert_eq!(
            results.len(),
            id.count,
            "returned query {} carries {} results",
            id,
            results.len()
        );
        let handle = self
            .checked_out
            .iter()
            .find(|(_, entry)| entry.slot.subtable.id().includes(id))
            .map(|(&handle, _)| handle)
            .unwrap_or_else(|| panic!("synchronize: no checked-out query subtree includes {}", id));

        let entry = self.checked_out.get_mut(&handle).unwrap();
        let entry_id = entry.slot.subtable.id();
        entry.slot.subtable.table().store_results(id.begin, results);

        if entry_id == *id {
            tracing::debug!("Rank {} synchronized query subtree {}", self.rank, id);
            self.return_query_subtable(handle);
            Ok(())
        } else {
            bail!("unsupported partial query return: {} inside {}", id, entry_id)
        }
    }

    fn push_completed_computation(&mut self, world: &World, reference_count: u64, quantity: u64) {
        self.debit_global(quantity);
        self.exchange.push_completed_computation(world, quantity);
        for slot in &mut self.slots {
            slot.remaining_work = slot.remaining_work.saturating_sub(reference_count);
        }
    }

    fn push_completed_computation_checked_out(
        &mut self,
        world: &World,
        reference_count: u64,
        quantity: u64,
        handle: CheckoutHandle,
    ) {
        self.debit_global(quantity);
        self.exchange.push_completed_computation(world, quantity);
        let entry = self
            .checked_out
            .get_mut(&handle)
            .unwrap_or_else(|| panic!("completed work against unknown checkout {}", handle));
        entry.slot.remaining_work = entry.slot.remaining_work.saturating_sub(reference_count);
    }

    fn debit_global(&mut self, quantity: u64) {
        self.remaining_global = self
            .remaining_global
            .checked_sub(quantity)
            .expect("global work counter underflow");
    }

    fn prepare_load_balance_request(&self) -> LoadBalanceRequest {
        let owned_query_subtables = self
            .slots
            .iter()
            .map(|slot| slot.subtable.id())
            .chain(
                self.checked_out
                    .values()
                    .map(|entry| entry.slot.subtable.id()),
            )
            .collect();
        LoadBalanceRequest {
            owned_query_subtables,
            remaining_local_computation: self.remaining_local,
            remaining_extra_points_to_hold: self.exchange.remaining_extra_points_to_hold(),
        }
    }

    fn prepare_extra_task_list(
        &mut self,
        neighbor_rank: ProcessRank,
        neighbor_budget: u64,
        neighbor_request: &LoadBalanceRequest,
    ) -> TaskPack {
        let mut pack = TaskPack::new(neighbor_rank, neighbor_budget);
        let mut probe = 0;
        while probe < self.slots.len() {
            let subtable = &self.slots[probe].subtable;
            let exportable = !neighbor_request.query_subtable_is_owned(&subtable.id())
                && subtable.originating_rank() != neighbor_rank
                && !self.slots[probe].tasks.is_empty()
                && pack.has_budget_for(subtable.count() as u64);
            if exportable {
                self.export_slot_into(&mut pack, probe, neighbor_rank);
                // Eviction swapped the tail in; re-examine this position.
            } else {
                probe += 1;
            }
        }
        pack
    }

    fn export_slot_into(&mut self, pack: &mut TaskPack, probe: usize, neighbor_rank: ProcessRank) {
        let handle = self.lock_query_subtable(probe, neighbor_rank);
        let (query, assigned, remaining_work, drained) = {
            let entry = self.checked_out.get_mut(&handle).unwrap();
            (
                entry.slot.subtable.payload(true),
                entry.slot.assigned.clone(),
                entry.slot.remaining_work,
                entry.slot.tasks.drain_sorted(),
            )
        };
        // The drained tasks leave this rank for good: settle their counters
        // and hand each task's cache lock unit back.
        let mut references = Vec::with_capacity(drained.len());
        for task in drained {
            self.debit_task(task.work());
            references.push(task.reference().payload(false));
            self.release_cache(task.reference().cache_block_id(), 1);
        }
        tracing::debug!(
            "Rank {} packed query subtree {} with {} task(s) for rank {}",
            self.rank,
            query.id(),
            references.len(),
            neighbor_rank
        );
        pack.push(ExportedQuery {
            query,
            assigned,
            remaining_work,
            references,
        });
    }

    fn redistribute_among_cores<M: Metric>(&mut self, world: &World, metric: &M) {
        let mut split_index = None;
        let mut split_size = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.subtable.is_leaf()
                && !slot.tasks.is_empty()
                && slot.subtable.count() > split_size
            {
                split_size = slot.subtable.count();
                split_index = Some(index);
            }
        }
        if let Some(index) = split_index {
            self.split_subtree(world, metric, index);
        }
    }

    fn split_subtree<M: Metric>(&mut self, world: &World, metric: &M, index: usize) {
        let node = self.slots[index].subtable.start_node();
        let (left, right) = (node.left.unwrap(), node.right.unwrap());

        // The slot narrows to the left child; the right child becomes a new
        // slot sharing the assigned history and the remaining-work counter.
        self.slots[index].subtable.set_node(left);
        let mut right_subtable = self.slots[index].subtable.clone();
        right_subtable.set_node(right);
        self.slots.push(QuerySlot {
            subtable: right_subtable,
            tasks: TaskHeap::new(),
            assigned: self.slots[index].assigned.clone(),
            remaining_work: self.slots[index].remaining_work,
        });
        let right_index = self.slots.len() - 1;

        // Every pending task is re-aimed at both halves with freshly
        // computed priorities. Only the query side split, so each reference
        // cache block takes exactly one extra lock unit.
        let drained = self.slots[index].tasks.drain_sorted();
        tracing::debug!(
            "Rank {} split query subtree into {} and {} redistributing {} task(s)",
            self.rank,
            self.slots[index].subtable.id(),
            self.slots[right_index].subtable.id(),
            drained.len()
        );
        for task in drained {
            self.debit_task(task.work());
            let reference = task.reference().clone();
            self.push_task(world, metric, index, reference.clone());
            self.push_task(world, metric, right_index, reference);
            self.exchange.lock_cache(task.reference().cache_block_id(), 1);
        }
    }

    fn send_receive<M: Metric>(
        &mut self,
        world: &World,
        metric: &M,
        hashed_reference_subtrees: &mut Vec<RouteRequest>,
    ) {
        if self.exchange.do_load_balancing() {
            self.exchange.send_receive_query_flush_requests(world);
        }
        if self.exchange.ready_to_send_receive(world) {
            let events = self.exchange.send_receive(world, hashed_reference_subtrees);
            for event in events {
                self.apply(world, metric, event);
            }
        }
        self.maybe_probe_for_work(world);
    }

    fn apply<M: Metric>(&mut self, world: &World, metric: &M, event: ExchangeEvent) {
        match event {
            ExchangeEvent::ReceivedReferences(received) => {
                self.generate_tasks(world, metric, &received);
            }
            ExchangeEvent::ImportedQuery(imported) => {
                let origin = imported.query.originating_rank();
                let index = self.push_new_queue(origin, imported.query);
                self.slots[index].assigned = imported.assigned;
                self.slots[index].remaining_work = imported.remaining_work;
                for cache_id in imported.references {
                    let reference = self
                        .exchange
                        .find_subtable(cache_id)
                        .cloned()
                        .unwrap_or_else(|| {
                            panic!("imported reference block {} is not resident", cache_id)
                        });
                    // The block already holds this task's lock unit.
                    self.push_task(world, metric, index, reference);
                }
            }
            ExchangeEvent::ReturnedQuery { id, results } => {
                if let Err(e) = self.synchronize(&id, &results) {
                    tracing::error!("Rank {} failed to synchronize {}: {}", self.rank, id, e);
                }
            }
            ExchangeEvent::CompletedWork { quantity } => {
                self.debit_global(quantity);
            }
            ExchangeEvent::LoadBalanceProbe { from, request } => {
                self.answer_probe(world, from, request);
            }
        }
    }

    fn answer_probe(&mut self, world: &World, from: ProcessRank, request: LoadBalanceRequest) {
        if !self.exchange.do_load_balancing() || self.remaining_local == 0 {
            return;
        }
        let pack =
            self.prepare_extra_task_list(from, request.remaining_extra_points_to_hold, &request);
        if !pack.is_empty() {
            self.exchange.send_extra_tasks(world, pack);
        }
    }

    fn maybe_probe_for_work(&mut self, world: &World) {
        if !self.exchange.do_load_balancing() || world.size() <= 1 {
            return;
        }
        if self.remaining_local > 0 || self.remaining_global == 0 {
            self.idle_turns = 0;
            return;
        }
        self.idle_turns += 1;
        if self.idle_turns % LOAD_BALANCE_PROBE_INTERVAL != 0 {
            return;
        }
        let mut target = rand::thread_rng().gen_range(0..world.size() - 1);
        if target >= self.rank {
            target += 1;
        }
        let request = self.prepare_load_balance_request();
        self.exchange.send_load_balance_probe(world, target, request);
    }

    fn release_cache(&mut self, cache_id: CacheId, n: u64) {
        if let Some(destruct_id) = self.exchange.release_cache(cache_id, n) {
            assert!(
                !self.integrity_check(&destruct_id),
                "destroying cache block {} still referenced by tasks ({})",
                cache_id,
                destruct_id
            );
            self.exchange.evict_cache(cache_id);
        }
    }

    fn integrity_check(&self, destruct_id: &SubtableId) -> bool {
        let in_active = self.slots.iter().any(|slot| {
            slot.tasks
                .iter()
                .any(|task| task.reference().id() == *destruct_id)
        });
        in_active
            || self.checked_out.values().any(|entry| {
                entry
                    .slot
                    .tasks
                    .iter()
                    .any(|task| task.reference().id() == *destruct_id)
            })
    }

    fn print(&self) {
        tracing::info!("Task queue status on rank {}:", self.rank);
        tracing::info!("  Active query subtrees:");
        for (index, slot) in self.slots.iter().enumerate() {
            tracing::info!(
                "    [{}] {} with {} task(s), remaining work {}, origin {}",
                index,
                slot.subtable.id(),
                slot.tasks.len(),
                slot.remaining_work,
                slot.subtable.originating_rank()
            );
            for task in slot.tasks.iter() {
                tracing::info!(
                    "      reference {} at cache block {}",
                    task.reference().id(),
                    task.reference().cache_block_id()
                );
            }
        }
        tracing::info!("  Checked-out query subtrees:");
        for (handle, entry) in self.checked_out.iter() {
            tracing::info!(
                "    [#{}] {} with {} task(s), remaining work {}, held by rank {}",
                handle,
                entry.slot.subtable.id(),
                entry.slot.tasks.len(),
                entry.slot.remaining_work,
                entry.locked_by
            );
            for task in entry.slot.tasks.iter() {
                tracing::info!(
                    "      reference {} at cache block {}",
                    task.reference().id(),
                    task.reference().cache_block_id()
                );
            }
        }
    }
}
