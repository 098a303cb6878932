//! Shared block-id generators.
//!
//! Spec.md's design notes call out "global mutable state" (block-id
//! generators, latest-metadata pointers) as something to encapsulate
//! rather than hang off process-wide statics — this is the engine-scoped
//! encapsulation: one `IdAllocator` per reserved id range (§3: ordinary,
//! checkpoint, hash-chain) is created per archive and handed to every
//! component that mints its own blocks in that range.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::block::{CHECKPOINT_ID_BASE, HASH_CHAIN_ID_BASE};

#[derive(Clone)]
pub struct IdAllocator {
    next: Arc<AtomicI64>,
    ceiling: i64,
}

impl IdAllocator {
    /// Ordinary blocks: `[first, CHECKPOINT_ID_BASE)`.
    pub fn starting_at(first: i64) -> Self {
        Self { next: Arc::new(AtomicI64::new(first)), ceiling: CHECKPOINT_ID_BASE }
    }

    /// Hash-chain entries: `[HASH_CHAIN_ID_BASE, i64::MAX)`.
    pub fn hash_chain() -> Self {
        Self { next: Arc::new(AtomicI64::new(HASH_CHAIN_ID_BASE)), ceiling: i64::MAX }
    }

    /// Mint the next id in this allocator's range. Asserted rather than
    /// silently wrapped into a neighboring range — running out of an id
    /// space is a sizing bug worth crashing loudly on.
    pub fn next(&self) -> i64 {
        let id = self.next.fetch_add(1, Ordering::SeqCst);
        assert!(id < self.ceiling, "id allocator exhausted its reserved range at {id}");
        id
    }

    /// Fast-forward past every id already present in the file (observed
    /// during `scan()`), so a reopened archive never reissues one. Ids
    /// outside this allocator's ceiling belong to a different range and
    /// are ignored.
    pub fn observe(&self, seen_id: i64) {
        if seen_id >= self.ceiling {
            return;
        }
        self.next.fetch_max(seen_id + 1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_monotonically() {
        let alloc = IdAllocator::starting_at(1);
        assert_eq!(alloc.next(), 1);
        assert_eq!(alloc.next(), 2);
    }

    #[test]
    fn observe_fast_forwards() {
        let alloc = IdAllocator::starting_at(1);
        alloc.observe(100);
        assert_eq!(alloc.next(), 101);
    }

    #[test]
    fn ordinary_allocator_ignores_out_of_range_observation() {
        let alloc = IdAllocator::starting_at(1);
        alloc.observe(CHECKPOINT_ID_BASE + 5);
        assert_eq!(alloc.next(), 1);
    }

    #[test]
    fn hash_chain_allocator_starts_past_ordinary_range() {
        let alloc = IdAllocator::hash_chain();
        assert_eq!(alloc.next(), HASH_CHAIN_ID_BASE);
    }
}
