//! Orphan block pool
//!
//! Blocks whose parent is unknown, keyed by the missing previous hash. The
//! pool holds hashes, never positions in the chain arena.

use std::collections::HashMap;
use tracing::debug;

use crate::consensus::Block;
use crate::crypto::Hash;

/// Bounds on the orphan pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrphanLimits {
    pub max_blocks: usize,
    /// Seconds an orphan may wait for its parent
    pub max_age_secs: u64,
    /// How far below the tip an orphan's height may fall
    pub max_depth: u64,
}

#[derive(Debug, Clone)]
struct OrphanBlock {
    block: Block,
    received: u64,
}

#[derive(Debug, Clone)]
pub struct OrphanBlockPool {
    blocks: HashMap<Hash, OrphanBlock>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    limits: OrphanLimits,
}

impl OrphanBlockPool {
    pub fn new(limits: OrphanLimits) -> Self {
        Self {
            blocks: HashMap::new(),
            by_parent: HashMap::new(),
            limits,
        }
    }

    /// Hold a block until its parent shows up. Returns false if already held.
    pub fn insert(&mut self, block: Block, now: u64) -> bool {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            return false;
        }
        if self.blocks.len() >= self.limits.max_blocks {
            self.evict_oldest();
        }
        self.by_parent
            .entry(*block.previous_hash())
            .or_default()
            .push(hash);
        self.blocks.insert(hash, OrphanBlock { block, received: now });
        true
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Orphans waiting on `parent`
    pub fn children_of(&self, parent: &Hash) -> Vec<&Block> {
        self.by_parent
            .get(parent)
            .map(|hashes| {
                hashes
                    .iter()
                    .filter_map(|h| self.blocks.get(h).map(|o| &o.block))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove and return every orphan waiting on `parent`
    pub fn take_children(&mut self, parent: &Hash) -> Vec<Block> {
        let hashes = self.by_parent.remove(parent).unwrap_or_default();
        hashes
            .iter()
            .filter_map(|h| self.blocks.remove(h).map(|o| o.block))
            .collect()
    }

    /// Drop orphans older than the age limit or too far below the tip.
    /// Returns how many were removed.
    pub fn prune(&mut self, now: u64, tip_height: u64) -> usize {
        let limits = self.limits;
        let doomed: Vec<Hash> = self
            .blocks
            .iter()
            .filter(|(_, o)| {
                now.saturating_sub(o.received) > limits.max_age_secs
                    || o.block.height().saturating_add(limits.max_depth) < tip_height
            })
            .map(|(h, _)| *h)
            .collect();

        for hash in &doomed {
            self.remove(hash);
        }
        if !doomed.is_empty() {
            debug!(removed = doomed.len(), remaining = self.blocks.len(), "pruned orphan blocks");
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn remove(&mut self, hash: &Hash) -> Option<Block> {
        let orphan = self.blocks.remove(hash)?;
        let parent = *orphan.block.previous_hash();
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(orphan.block)
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .blocks
            .iter()
            .min_by_key(|(h, o)| (o.received, **h))
            .map(|(h, _)| *h);
        if let Some(hash) = oldest {
            debug!(hash = %hash.short(), "orphan pool full, evicting oldest");
            self.remove(&hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::BlockHeader;
    use crate::crypto::hash_bytes;

    const LIMITS: OrphanLimits = OrphanLimits {
        max_blocks: 3,
        max_age_secs: 600,
        max_depth: 10,
    };

    fn orphan(index: u64, parent: &str) -> Block {
        Block::new(
            BlockHeader {
                version: 1,
                index,
                previous_hash: hash_bytes(parent.as_bytes()),
                merkle_root: Hash::zero(),
                timestamp: index,
                difficulty: 1,
                nonce: 0,
                miner_key: None,
            },
            vec![],
        )
    }

    #[test]
    fn test_keyed_by_missing_parent() {
        let mut pool = OrphanBlockPool::new(LIMITS);
        assert!(pool.insert(orphan(5, "p"), 100));
        assert!(!pool.insert(orphan(5, "p"), 100));
        assert!(pool.insert(orphan(6, "p"), 100));

        assert_eq!(pool.children_of(&hash_bytes(b"p")).len(), 2);
        let taken = pool.take_children(&hash_bytes(b"p"));
        assert_eq!(taken.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_prune_by_age() {
        let mut pool = OrphanBlockPool::new(LIMITS);
        let old = orphan(5, "old");
        let young = orphan(5, "young");
        pool.insert(old.clone(), 0);
        pool.insert(young.clone(), 500);

        assert_eq!(pool.prune(1_000, 5), 1);
        assert!(!pool.contains(&old.hash()));
        assert_eq!(pool.children_of(&hash_bytes(b"young")), vec![&young]);
    }

    #[test]
    fn test_prune_by_depth() {
        let mut pool = OrphanBlockPool::new(LIMITS);
        pool.insert(orphan(5, "deep"), 100);
        pool.insert(orphan(40, "near"), 100);

        assert_eq!(pool.prune(100, 45), 1);
        assert!(pool.children_of(&hash_bytes(b"deep")).is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut pool = OrphanBlockPool::new(LIMITS);
        let first = orphan(1, "a");
        pool.insert(first.clone(), 1);
        pool.insert(orphan(2, "b"), 2);
        pool.insert(orphan(3, "c"), 3);
        pool.insert(orphan(4, "d"), 4);

        assert_eq!(pool.len(), 3);
        assert!(!pool.contains(&first.hash()));
    }
}
