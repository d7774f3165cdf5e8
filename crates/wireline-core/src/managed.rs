//! Bucket-generation ownership table for managed mode (`-b`).
//!
//! Every command that carries a (bucket, generation) pair is honored only if
//! the table's current generation for that bucket matches. Reads never take
//! a lock — a single relaxed atomic load is enough, since a stale read just
//! means a command is rejected a moment later than it ideally would be, not
//! that anything unsafe happens.

use std::sync::atomic::{AtomicU32, Ordering};

const NOT_OWNED: u32 = 0;

pub struct BucketTable {
    generations: Vec<AtomicU32>,
}

impl BucketTable {
    #[must_use]
    pub fn new(num_buckets: usize) -> Self {
        Self { generations: (0..num_buckets).map(|_| AtomicU32::new(NOT_OWNED)).collect() }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    #[must_use]
    pub fn owns(&self, bucket: u32, generation: u32) -> bool {
        generation != NOT_OWNED
            && self
                .generations
                .get(bucket as usize)
                .is_some_and(|g| g.load(Ordering::Relaxed) == generation)
    }

    /// Claims `bucket` at `generation`. Always succeeds for an in-range
    /// bucket; a later, larger generation simply supersedes an earlier one.
    pub fn own(&self, bucket: u32, generation: u32) -> bool {
        let Some(slot) = self.generations.get(bucket as usize) else { return false };
        slot.store(generation, Ordering::Relaxed);
        true
    }

    pub fn disown(&self, bucket: u32) -> bool {
        let Some(slot) = self.generations.get(bucket as usize) else { return false };
        slot.store(NOT_OWNED, Ordering::Relaxed);
        true
    }

    /// Bumps the generation of a bucket this node already owns. Unlike
    /// `own`, this rejects an unowned bucket rather than silently claiming
    /// it — `bg` is for a rebalance handing a bucket forward, not a fresh
    /// claim.
    pub fn bump_generation(&self, bucket: u32, generation: u32) -> bool {
        let Some(slot) = self.generations.get(bucket as usize) else { return false };
        if slot.load(Ordering::Relaxed) == NOT_OWNED {
            return false;
        }
        slot.store(generation, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_then_owns_matches_only_current_generation() {
        let table = BucketTable::new(4);
        assert!(!table.owns(1, 1));
        table.own(1, 1);
        assert!(table.owns(1, 1));
        assert!(!table.owns(1, 2));
    }

    #[test]
    fn disown_clears_ownership() {
        let table = BucketTable::new(4);
        table.own(0, 5);
        table.disown(0);
        assert!(!table.owns(0, 5));
    }

    #[test]
    fn bump_generation_requires_prior_ownership() {
        let table = BucketTable::new(4);
        assert!(!table.bump_generation(2, 9));
        table.own(2, 1);
        assert!(table.bump_generation(2, 2));
        assert!(table.owns(2, 2));
    }

    #[test]
    fn out_of_range_bucket_is_rejected() {
        let table = BucketTable::new(2);
        assert!(!table.own(5, 1));
        assert!(!table.owns(5, 1));
    }
}
