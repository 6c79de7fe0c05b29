//! Worker Pool Module
//!
//! Runs the computation on one rank: a pool of OS threads that pull tasks
//! from the queue, evaluate them, report the completed work, and take
//! cooperative network turns so traffic keeps flowing while they wait.
//!
//! ## Responsibilities
//! - **Dispatch**: dequeue with checkout, evaluate outside the queue lock,
//!   report the completion scoped to the checked-out subtree, hand back the
//!   reference cache lock, return the subtree.
//! - **Driving the exchange**: every loop iteration takes a send/receive
//!   turn, so a starved worker still delivers flushes, broadcasts, and
//!   imports.
//! - **Termination**: workers exit when the global work counter is zero and
//!   the exchange is quiet.

pub mod pool;
