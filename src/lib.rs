//! Distributed Dual-Tree Computation Library
//!
//! This library crate defines the core modules of a distributed-memory
//! dual-tree batch computation. It serves as the foundation for the binary
//! executable (`main.rs`), which runs a simulated cluster in one process.
//!
//! ## Architecture Modules
//! The system is composed of five loosely coupled subsystems:
//!
//! - **`world`**: The process layer. Ranks, topology metadata, and the
//!   in-memory router that carries bincode-encoded envelopes between them.
//! - **`table`**: The spatial data layer. Point shards, space-partitioning
//!   trees, and the subtable views that identify units of work.
//! - **`exchange`**: The transfer layer. Routes reference subtrees between
//!   ranks, caches them with reference counting, returns finished query
//!   subtrees to their origin, and broadcasts completed work.
//! - **`queue`**: The scheduling core. Per-subtree task heaps, disjoint
//!   assigned-work bookkeeping, checkout/export state, dynamic subtree
//!   splitting, and the distributed termination decision.
//! - **`compute`** / **`worker`**: The execution layer. The per-task
//!   evaluation seam and the OS-thread worker pool that drives everything
//!   to completion.

pub mod compute;
pub mod exchange;
pub mod queue;
pub mod table;
pub mod worker;
pub mod world;
