//! Distributed Task Queue Module
//!
//! The scheduling core: decomposes the all-pairs dual-tree computation into
//! tasks (query subtree x reference subtree), dispatches them to worker
//! threads by priority, and trades subtrees with peer ranks to keep every
//! process busy until the global work counter drains.
//!
//! ## Architecture Overview
//! 1. **Slots**: the local query tree is carved into active slots, one task
//!    heap each, sized to keep `num_threads` workers fed.
//! 2. **Generation**: reference subtrees delivered by the exchange become
//!    tasks against every slot whose assigned-interval set admits them;
//!    the disjointness test makes repeated deliveries idempotent.
//! 3. **Checkout**: a dispatched slot moves to the checked-out list until
//!    the worker (or the remote rank it was exported to) brings it back.
//! 4. **Splitting**: when slots run short of threads, the largest splittable
//!    subtree divides and its pending tasks re-aim at both halves.
//! 5. **Accounting**: remaining local/global work counters drive load
//!    balancing and the distributed termination decision.
//!
//! ## Submodules
//! - **`intervals`**: insert-if-disjoint interval sets (the dedup guard).
//! - **`priority`**: tasks and the per-slot max-heap.
//! - **`balance`**: load-balance requests and export packets.
//! - **`queue`**: the queue itself.

pub mod balance;
pub mod intervals;
pub mod priority;
pub mod queue;

#[cfg(test)]
mod tests;
