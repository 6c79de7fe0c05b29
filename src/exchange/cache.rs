//! Refcounted Subtable Cache
//!
//! Reference subtables received from peers are cached once and shared by
//! every task that pairs a local query subtree with them. Each such task
//! owns exactly one lock unit; the block is destroyed when the count drains
//! to zero. Lock/release mismatches are accounting bugs in the caller, so
//! they are fatal.

use super::types::CacheId;
use crate::table::subtable::{Subtable, SubtableId};
use std::collections::HashMap;

struct CacheBlock {
    /// `None` for placeholder blocks: ids that were locked before (or
    /// without) a resident subtable, e.g. aliases of the local shard.
    subtable: Option<Subtable>,
    refcount: u64,
}

/// Outcome of a release.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Lock units remain.
    Held,
    /// The count hit zero; a resident block now awaits destruction pending
    /// the queue's integrity check.
    Drained(Option<SubtableId>),
}

#[derive(Default)]
pub struct SubtableCache {
    blocks: HashMap<CacheId, CacheBlock>,
    next_id: CacheId,
}

impl SubtableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a received subtable with an initial lock count and returns its
    /// block id. The stored subtable learns its own block id, so every task
    /// that later clones it carries the right id for release.
    pub fn insert(&mut self, mut subtable: Subtable, refcount: u64) -> CacheId {
        let cache_id = self.assign_id();
        subtable.set_cache_block_id(cache_id);
        self.blocks.insert(
            cache_id,
            CacheBlock {
                subtable: Some(subtable),
                refcount,
            },
        );
        cache_id
    }

    /// Reserves a fresh id with no resident subtable (used for local
    /// aliases, which need an identity but no storage).
    pub fn assign_id(&mut self) -> CacheId {
        let cache_id = self.next_id;
        self.next_id += 1;
        cache_id
    }

    pub fn find(&self, cache_id: CacheId) -> Option<&Subtable> {
        self.blocks
            .get(&cache_id)
            .and_then(|block| block.subtable.as_ref())
    }

    /// Adds `n` lock units to the block, creating a placeholder if the id
    /// has never been seen.
    pub fn lock(&mut self, cache_id: CacheId, n: u64) {
        let block = self.blocks.entry(cache_id).or_insert(CacheBlock {
            subtable: None,
            refcount: 0,
        });
        block.refcount += n;
    }

    /// Removes `n` lock units. Releasing an unknown id or more units than
    /// are held breaks the one-release-per-lock contract.
    pub fn release(&mut self, cache_id: CacheId, n: u64) -> ReleaseOutcome {
        let block = self
            .blocks
            .get_mut(&cache_id)
            .unwrap_or_else(|| panic!("release of unknown cache block {}", cache_id));
        assert!(
            block.refcount >= n,
            "cache block {} released {} times with only {} locks held",
            cache_id,
            n,
            block.refcount
        );
        block.refcount -= n;
        if block.refcount > 0 {
            return ReleaseOutcome::Held;
        }
        let destruct_id = block.subtable.as_ref().map(|subtable| subtable.id());
        if destruct_id.is_none() {
            // Placeholders have nothing to destroy.
            self.blocks.remove(&cache_id);
        }
        ReleaseOutcome::Drained(destruct_id)
    }

    /// Destroys a drained block. The caller has already verified no task
    /// still references it.
    pub fn evict(&mut self, cache_id: CacheId) {
        let block = self.blocks.remove(&cache_id);
        debug_assert!(
            matches!(&block, Some(block) if block.refcount == 0),
            "evicting cache block {} that is absent or still locked",
            cache_id
        );
    }

    pub fn refcount(&self, cache_id: CacheId) -> Option<u64> {
        self.blocks.get(&cache_id).map(|block| block.refcount)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
