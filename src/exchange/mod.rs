//! Table Exchange Module
//!
//! Moves subtables between ranks so every query subtree eventually meets
//! every reference subtree. The task queue drives it and consumes its
//! traffic; nothing else in the system touches the network.
//!
//! ## Core Mechanisms
//! - **Reference routing**: local reference granules are shipped to the
//!   ranks whose query subtrees still owe them work; received granules are
//!   cached once and shared by every task that uses them.
//! - **Cache refcounting**: each task holds exactly one lock unit on its
//!   reference block; blocks are destroyed when the count drains, gated by
//!   the queue's integrity check.
//! - **Query flush**: an imported query subtree whose tasks drained goes
//!   home carrying its results, before any completed-work broadcast of the
//!   same turn.
//! - **Load balancing**: starved ranks probe peers; loaded peers answer
//!   with exported query subtrees.
//!
//! ## Submodules
//! - **`cache`**: the refcounted subtable store.
//! - **`service`**: the exchange itself (routing, flushes, broadcasts).
//! - **`types`**: wire messages and the events handed back to the queue.

pub mod cache;
pub mod service;
pub mod types;
