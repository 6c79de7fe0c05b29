//! Task Queue Scenario Tests
//!
//! Drives the queue through its contract operation by operation: task
//! generation and deduplication, dequeue and cleanup, completion accounting,
//! splitting, export/synchronize, and the integrity observable. All
//! scenarios run on an in-memory world; most need only one rank.

#[cfg(test)]
mod tests {
    use crate::exchange::types::ReceivedReference;
    use crate::queue::balance::LoadBalanceRequest;
    use crate::queue::queue::{SlotDequeue, TaskQueue};
    use crate::table::subtable::{SubtableId, Table};
    use crate::table::types::EuclideanMetric;
    use crate::world::router::{Router, World};
    use crate::world::types::ShardCounts;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Two query points and three reference points on one rank; the query
    /// root is a single leaf so init produces exactly one slot. The
    /// reference tree is fully split so sub-range deliveries resolve.
    fn single_slot_setup() -> (Arc<World>, Arc<TaskQueue>) {
        let world = World::single(2, 3);
        let query = Table::new(0, 1, vec![0.0, 1.0], 2);
        let reference = Table::new(0, 1, vec![5.0, 6.0, 7.0], 1);
        let queue = TaskQueue::init(&world, 3, false, query, reference, 1);
        (world, queue)
    }

    fn whole_reference_delivery(cache_id: i64) -> ReceivedReference {
        ReceivedReference {
            owner: 0,
            begin: 0,
            count: 3,
            cache_id,
        }
    }

    // ============================================================
    // S1: task generation against a single slot
    // ============================================================

    #[test]
    fn test_generate_tasks_creates_one_task_per_slot() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        assert_eq!(queue.active_slot_count(), 1);
        assert_eq!(queue.remaining_global_computation(), 6);

        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);

        assert_eq!(queue.num_remaining_tasks(), 1);
        assert_eq!(queue.remaining_local_computation(), 6);
        assert_eq!(queue.size(0), 1);
        assert_eq!(queue.cache_refcount(42), Some(1));

        let top = queue.top(0).expect("task enqueued");
        assert_eq!(top.work(), 6);
        // Bounds are [0,1] and [5,7]: lo 16, hi 49, priority -mid.
        assert_eq!(top.priority(), -32.5);
    }

    #[test]
    fn test_generate_tasks_is_idempotent_per_interval() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;

        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);
        // Replaying the same delivery produces no task and no lock.
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);
        // An overlapping sub-range is also refused.
        queue.generate_tasks(
            &world,
            &metric,
            &[ReceivedReference {
                owner: 0,
                begin: 1,
                count: 2,
                cache_id: 43,
            }],
        );

        assert_eq!(queue.num_remaining_tasks(), 1);
        assert_eq!(queue.cache_refcount(42), Some(1));
        assert_eq!(queue.cache_refcount(43), None);
    }

    // ============================================================
    // S2: dequeue and the no-eviction case
    // ============================================================

    #[test]
    fn test_dequeue_drains_counters_and_keeps_unfinished_slot() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);

        let dequeued = queue
            .dequeue(&world, 0, &metric, false)
            .expect("one task available");
        assert_eq!(dequeued.task.work(), 6);
        assert_eq!(
            dequeued.task.reference().id(),
            SubtableId { rank: 0, begin: 0, count: 3 }
        );
        assert!(dequeued.checkout.is_none());
        assert_eq!(queue.num_remaining_tasks(), 0);
        assert_eq!(queue.remaining_local_computation(), 0);

        // The slot is at origin with remaining work, so a second dequeue
        // finds nothing but must not evict.
        assert!(queue.dequeue(&world, 0, &metric, false).is_none());
        assert_eq!(queue.active_slot_count(), 1);
        assert_eq!(queue.remaining_work_for(0), 3);
    }

    // ============================================================
    // S3: completion accounting drives eviction and termination
    // ============================================================

    #[test]
    fn test_completed_computation_then_eviction() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);
        queue.dequeue(&world, 0, &metric, false).unwrap();
        queue.release_cache(42, 1);

        queue.push_completed_computation(&world, 3, 6);
        assert_eq!(queue.remaining_global_computation(), 0);
        assert_eq!(queue.remaining_work_for(0), 0);
        assert_eq!(queue.active_slot_count(), 1);

        // The drained at-origin slot with zero remaining work now evicts;
        // this is also the evict-the-last-slot boundary case.
        match queue.dequeue_from(0, false) {
            SlotDequeue::CleanedUp => {}
            _ => panic!("expected cleanup"),
        }
        assert_eq!(queue.active_slot_count(), 0);
        assert!(queue.can_terminate(&world));
    }

    // ============================================================
    // Checkout duality (scoped completion path)
    // ============================================================

    #[test]
    fn test_checkout_and_return_restore_state() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);
        let slot_id = queue.query_subtable_id(0);

        let dequeued = queue
            .dequeue(&world, 0, &metric, true)
            .expect("task with checkout");
        let handle = dequeued.checkout.expect("slot checked out");
        assert_eq!(queue.active_slot_count(), 0);
        // A checkout to this rank's own worker is not an export.
        assert_eq!(queue.num_exported_query_subtables(), 0);

        queue.push_completed_computation_checked_out(&world, 3, 6, handle);
        queue.return_query_subtable(handle);

        assert_eq!(queue.active_slot_count(), 1);
        assert_eq!(queue.query_subtable_id(0), slot_id);
        assert_eq!(queue.remaining_work_for(0), 0);
        assert_eq!(queue.num_exported_query_subtables(), 0);
        assert_eq!(queue.remaining_global_computation(), 0);
    }

    #[test]
    fn test_generation_reaches_checked_out_entries_in_order() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;

        // Check the only slot out first, then deliver a reference: the task
        // must land in the entry's own heap and still count globally.
        let handle = queue.lock_query_subtable(0, 0);
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);

        assert_eq!(queue.active_slot_count(), 0);
        assert_eq!(queue.num_remaining_tasks(), 1);
        assert_eq!(queue.remaining_local_computation(), 6);
        assert_eq!(queue.cache_refcount(42), Some(1));

        // Returning the entry makes the task dispatchable.
        queue.return_query_subtable(handle);
        let dequeued = queue.dequeue(&world, 0, &metric, false).unwrap();
        assert_eq!(dequeued.task.work(), 6);
    }

    // ============================================================
    // S4: redistribute / split
    // ============================================================

    /// Sixteen query points with a fully split tree, so init leaves
    /// internal subtrees in the slots.
    fn splittable_setup(num_threads: usize) -> (Arc<World>, Arc<TaskQueue>) {
        let world = World::single(16, 3);
        let rows = (0..16).map(|i| i as f64).collect();
        let query = Table::new(0, 1, rows, 1);
        let reference = Table::new(0, 1, vec![5.0, 6.0, 7.0], 3);
        let queue = TaskQueue::init(&world, 3, false, query, reference, num_threads);
        (world, queue)
    }

    #[test]
    fn test_dequeue_triggers_split_when_threads_outnumber_slots() {
        let (world, queue) = splittable_setup(2);
        let metric = EuclideanMetric;
        assert_eq!(queue.active_slot_count(), 8);
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(7)]);
        assert_eq!(queue.num_remaining_tasks(), 8);
        assert_eq!(queue.cache_refcount(7), Some(8));

        // Check out every slot but one: its two-point subtree is internal
        // and still holds its task.
        while queue.active_slot_count() > 1 {
            queue.lock_query_subtable(1, 0);
        }

        let dequeued = queue
            .dequeue(&world, 0, &metric, false)
            .expect("split must produce a dispatchable task");

        // One slot became two (left/right children), the drained task was
        // re-aimed at both halves, and the reference block took exactly one
        // extra lock unit.
        assert_eq!(queue.active_slot_count(), 2);
        assert_eq!(dequeued.task.work(), 3);
        assert_eq!(dequeued.task.query().count(), 1);
        assert_eq!(queue.cache_refcount(7), Some(9));
        // 7 tasks checked out + 2 halves - 1 dequeued.
        assert_eq!(queue.num_remaining_tasks(), 8);
    }

    #[test]
    fn test_split_copies_assigned_set_deeply() {
        // Four slots of four points each.
        let (world, queue) = splittable_setup(1);
        let metric = EuclideanMetric;
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(7)]);
        assert_eq!(queue.active_slot_count(), 4);

        queue.split_subtree(&world, &metric, 0);
        assert_eq!(queue.active_slot_count(), 5);

        // The copied assigned set already contains the interval, so a
        // replay creates nothing on either half.
        let before = queue.num_remaining_tasks();
        assert_eq!(before, 5);
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(7)]);
        assert_eq!(queue.num_remaining_tasks(), before);
    }

    #[test]
    fn test_split_with_empty_heap_still_produces_valid_slot() {
        let (world, queue) = splittable_setup(1);
        let metric = EuclideanMetric;

        queue.split_subtree(&world, &metric, 0);
        assert_eq!(queue.active_slot_count(), 5);
        assert_eq!(queue.num_remaining_tasks(), 0);
        assert_eq!(queue.remaining_local_computation(), 0);

        // Both halves accept fresh work independently afterwards.
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(7)]);
        assert_eq!(queue.num_remaining_tasks(), 5);
    }

    #[test]
    fn test_redistribute_is_noop_on_leaves_and_empty_heaps() {
        // A single leaf slot: nothing is splittable.
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        queue.redistribute_among_cores(&world, &metric);
        assert_eq!(queue.active_slot_count(), 1);

        // Internal subtrees without tasks do not split either.
        let (world, queue) = splittable_setup(1);
        queue.redistribute_among_cores(&world, &metric);
        assert_eq!(queue.active_slot_count(), 4);
    }

    // ============================================================
    // S5: export and synchronize
    // ============================================================

    fn two_rank_setup() -> (Arc<World>, Arc<World>, Arc<TaskQueue>) {
        let router = Router::new();
        let counts = vec![
            ShardCounts { queries: 2, references: 3 },
            ShardCounts { queries: 0, references: 0 },
        ];
        let w0 = World::join(router.clone(), 0, counts.clone());
        let w1 = World::join(router, 1, counts);
        let query = Table::new(0, 1, vec![0.0, 1.0], 2);
        let reference = Table::new(0, 1, vec![5.0, 6.0, 7.0], 3);
        let queue = TaskQueue::init(&w0, 3, true, query, reference, 1);
        (w0, w1, queue)
    }

    #[test]
    fn test_export_then_synchronize_roundtrip() {
        let (w0, _w1, queue) = two_rank_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&w0, &metric, &[whole_reference_delivery(42)]);
        let slot_id = queue.query_subtable_id(0);

        let empty_request = LoadBalanceRequest {
            owned_query_subtables: HashSet::new(),
            remaining_local_computation: 0,
            remaining_extra_points_to_hold: 100,
        };
        let pack = queue.prepare_extra_task_list(1, 100, &empty_request);

        assert_eq!(pack.items.len(), 1);
        assert_eq!(queue.num_exported_query_subtables(), 1);
        assert_eq!(queue.active_slot_count(), 0);
        // The drained task left with the packet: counters settle and its
        // cache lock was handed back.
        assert_eq!(queue.num_remaining_tasks(), 0);
        assert_eq!(queue.remaining_local_computation(), 0);
        assert_eq!(queue.cache_refcount(42), None);

        let exported = &pack.items[0];
        assert_eq!(exported.query.id(), slot_id);
        assert_eq!(exported.references.len(), 1);
        assert!(exported.assigned.overlaps(0, 0, 3));
        assert_eq!(exported.remaining_work, 3);

        // The peer finished the work and the subtree comes home.
        queue.synchronize(&slot_id, &[0.5, 0.25]).unwrap();
        assert_eq!(queue.num_exported_query_subtables(), 0);
        assert_eq!(queue.active_slot_count(), 1);
        assert_eq!(queue.query_subtable_id(0), slot_id);
    }

    #[test]
    fn test_export_skips_subtrees_the_neighbor_owns() {
        let (w0, _w1, queue) = two_rank_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&w0, &metric, &[whole_reference_delivery(42)]);

        let mut owned = HashSet::new();
        owned.insert(queue.query_subtable_id(0));
        let request = LoadBalanceRequest {
            owned_query_subtables: owned,
            remaining_local_computation: 0,
            remaining_extra_points_to_hold: 100,
        };
        let pack = queue.prepare_extra_task_list(1, 100, &request);

        assert!(pack.is_empty());
        assert_eq!(queue.active_slot_count(), 1);
        assert_eq!(queue.num_exported_query_subtables(), 0);
    }

    #[test]
    fn test_export_respects_point_budget() {
        let (w0, _w1, queue) = two_rank_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&w0, &metric, &[whole_reference_delivery(42)]);

        let empty_request = LoadBalanceRequest {
            owned_query_subtables: HashSet::new(),
            remaining_local_computation: 0,
            remaining_extra_points_to_hold: 1,
        };
        // The slot holds two query points; a one-point budget refuses it.
        let pack = queue.prepare_extra_task_list(1, 1, &empty_request);
        assert!(pack.is_empty());
        assert_eq!(queue.active_slot_count(), 1);
    }

    #[test]
    fn test_partial_synchronize_is_refused() {
        let (w0, _w1, queue) = two_rank_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&w0, &metric, &[whole_reference_delivery(42)]);
        let empty_request = LoadBalanceRequest {
            owned_query_subtables: HashSet::new(),
            remaining_local_computation: 0,
            remaining_extra_points_to_hold: 100,
        };
        queue.prepare_extra_task_list(1, 100, &empty_request);

        // A strict sub-range keeps the entry checked out and reports the
        // unsupported partial return.
        let partial = SubtableId { rank: 0, begin: 0, count: 1 };
        let result = queue.synchronize(&partial, &[0.5]);
        assert!(result.is_err());
        assert_eq!(queue.num_exported_query_subtables(), 1);
        assert_eq!(queue.active_slot_count(), 0);
    }

    // ============================================================
    // S6: integrity observable
    // ============================================================

    #[test]
    fn test_integrity_check_tracks_task_references() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        let reference_id = SubtableId { rank: 0, begin: 0, count: 3 };
        assert!(!queue.integrity_check(&reference_id));

        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);
        assert!(queue.integrity_check(&reference_id));
        assert!(!queue.integrity_check(&SubtableId { rank: 0, begin: 0, count: 2 }));
        queue.print();

        // Checked-out heaps are scanned too.
        let handle = queue.lock_query_subtable(0, 0);
        assert!(queue.integrity_check(&reference_id));
        queue.return_query_subtable(handle);

        queue.dequeue(&world, 0, &metric, false).unwrap();
        queue.push_completed_computation(&world, 3, 6);
        assert!(!queue.integrity_check(&reference_id));
    }

    // ============================================================
    // Accounting invariants across a mixed sequence
    // ============================================================

    #[test]
    fn test_task_accounting_matches_heap_contents() {
        // Four slots of four points, one task of work 12 each.
        let (world, queue) = splittable_setup(1);
        let metric = EuclideanMetric;

        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(7)]);
        let handle = queue.lock_query_subtable(2, 0);
        queue.split_subtree(&world, &metric, 0);

        // Four generated, one of them split into two halves.
        assert_eq!(queue.num_remaining_tasks(), 5);
        let mut heap_total = 0;
        for probe in 0..queue.active_slot_count() {
            heap_total += queue.size(probe);
        }
        // One task sits in the checked-out entry's heap.
        assert_eq!(heap_total + 1, queue.num_remaining_tasks());

        // remaining_local is the summed work of every queued task: three
        // intact tasks of work 12 (two active, one checked out) plus two
        // halves of work 6.
        assert_eq!(queue.remaining_local_computation(), 3 * 12 + 2 * 6);
        queue.return_query_subtable(handle);
    }

    #[test]
    fn test_evict_then_reimport_preserves_identity() {
        let (world, queue) = single_slot_setup();
        let metric = EuclideanMetric;
        queue.generate_tasks(&world, &metric, &[whole_reference_delivery(42)]);
        let slot_id = queue.query_subtable_id(0);

        // Run the slot to completion and evict it.
        queue.dequeue(&world, 0, &metric, false).unwrap();
        queue.push_completed_computation(&world, 3, 6);
        assert!(matches!(queue.dequeue_from(0, false), SlotDequeue::CleanedUp));

        // Reactivating the same logical subtree restores its identity under
        // a fresh slot index.
        let query = Table::new(0, 1, vec![0.0, 1.0], 2);
        let subtable = crate::table::subtable::Subtable::alias(query, crate::table::tree::ROOT);
        let index = queue.push_new_queue(0, subtable);
        assert_eq!(queue.query_subtable_id(index), slot_id);
        assert_eq!(queue.num_imported_query_subtables(), 1);
    }
}
