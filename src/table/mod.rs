//! Point Table & Tree Module
//!
//! The spatial data layer: each rank owns one shard of the query points and
//! one shard of the reference points, indexed by a binary space-partitioning
//! tree. Subtrees are the unit of work distribution, identified everywhere by
//! `(origin rank, begin, count)`.
//!
//! ## Core Concepts
//! - **Stable identity**: point rows are spatially sorted once, at shard
//!   construction. After that the row order never changes, so a subtree id
//!   names the same points on every rank that holds a copy.
//! - **Views, not copies**: a `Subtable` is an aliased view (shared table +
//!   tree node). Deep copies only happen at the wire boundary, as
//!   `SubtablePayload`.
//! - **Origin coordinates**: an imported copy keeps the origin table's row
//!   numbering (`first_index` offset), so results computed remotely land on
//!   the right rows when they are flushed home.
//!
//! ## Submodules
//! - **`types`**: bounds, distance ranges, and the `Metric` seam.
//! - **`tree`**: the node arena, frontier extraction, and subtree lookup.
//! - **`subtable`**: tables, subtable views, and wire payloads.

pub mod subtable;
pub mod tree;
pub mod types;
