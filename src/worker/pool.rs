//! Worker Pool Implementation
//!
//! Spawns the rank's worker threads and blocks until the distributed
//! computation terminates. Every worker alternates between a cooperative
//! network turn and a dequeue; the queue's single lock serializes both, and
//! evaluation runs outside it.

use crate::compute::evaluator::TaskEvaluator;
use crate::exchange::types::RouteRequest;
use crate::queue::queue::TaskQueue;
use crate::table::types::Metric;
use crate::world::router::World;
use std::sync::Mutex;
use std::time::Duration;

/// How long an idle worker sleeps before polling again.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

pub struct WorkerPool {
    worker_count: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    /// Runs the rank to completion. `initial_routes` are the essential
    /// reference subtrees to ship out; the first network turn consumes
    /// them. Returns when `can_terminate` holds.
    pub fn run<M: Metric, E: TaskEvaluator>(
        &self,
        world: &World,
        queue: &TaskQueue,
        metric: &M,
        evaluator: &E,
        initial_routes: Vec<RouteRequest>,
    ) {
        tracing::info!(
            "Rank {} starting {} task worker(s)",
            world.rank(),
            self.worker_count
        );
        let routes = Mutex::new(initial_routes);
        std::thread::scope(|scope| {
            for thread_id in 0..self.worker_count {
                let routes = &routes;
                scope.spawn(move || {
                    worker_loop(world, queue, metric, evaluator, thread_id, routes);
                });
            }
        });
        tracing::info!("Rank {} computation complete", world.rank());
    }
}

fn worker_loop<M: Metric, E: TaskEvaluator>(
    world: &World,
    queue: &TaskQueue,
    metric: &M,
    evaluator: &E,
    thread_id: usize,
    routes: &Mutex<Vec<RouteRequest>>,
) {
    tracing::debug!("Rank {} worker {} started", world.rank(), thread_id);
    let mut tasks_done: u64 = 0;

    loop {
        // Network turn first: deliver pending traffic and pick up new work
        // before deciding whether the computation is over.
        {
            let mut pending_routes = routes.lock().unwrap();
            queue.send_receive(world, metric, &mut pending_routes);
        }
        if queue.can_terminate(world) {
            break;
        }

        let Some(dequeued) = queue.dequeue(world, thread_id, metric, true) else {
            std::thread::sleep(IDLE_BACKOFF);
            continue;
        };
        let handle = dequeued
            .checkout
            .expect("dequeue with checkout returned no handle");

        // The subtree is checked out to this worker: evaluate without the
        // queue lock, then settle the books.
        evaluator.evaluate(metric, dequeued.task.query(), dequeued.task.reference());
        let reference_count = dequeued.task.reference().count() as u64;
        queue.push_completed_computation_checked_out(
            world,
            reference_count,
            dequeued.task.work(),
            handle,
        );
        queue.release_cache(dequeued.task.reference().cache_block_id(), 1);
        queue.return_query_subtable(handle);
        tasks_done += 1;
    }

    tracing::debug!(
        "Rank {} worker {} finished after {} task(s)",
        world.rank(),
        thread_id,
        tasks_done
    );
}
