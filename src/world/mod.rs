//! World & Transport Module
//!
//! Models the set of cooperating processes ("ranks") and the message fabric
//! between them. Every rank holds a `World` handle joined to a shared
//! `Router`, which keeps one mailbox per rank and delivers bincode-encoded
//! envelopes.
//!
//! ## Core Mechanisms
//! - **Identity**: ranks are dense integers `0..size`; peer distance is the
//!   hypercube bit distance, which the task priority formula consumes.
//! - **Delivery**: senders encode and drop envelopes into the destination
//!   mailbox; receivers drain their own mailbox explicitly. Nothing is pushed
//!   asynchronously, so the queue can drain and apply traffic inside a single
//!   critical section.
//! - **Topology metadata**: each rank knows the per-rank query/reference
//!   point counts, which size the global work counters at startup.

pub mod router;
pub mod types;

#[cfg(test)]
mod tests;
