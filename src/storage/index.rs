//! Block index
//!
//! Two persisted mappings, height → location and hash → location, with a
//! fixed-capacity LRU cache in front. Heights are stored big-endian so the
//! height tree iterates in chain order.

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use tracing::{debug, warn};

use crate::crypto::Hash;
use crate::storage::{decode_height, StorageError};

/// Where a block's bytes live in the block files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLocation {
    pub file: u32,
    pub offset: u64,
    pub size: u32,
    pub hash: Hash,
}

/// One authoritative entry per height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub height: u64,
    pub location: BlockLocation,
}

/// Persisted side of the index
pub trait IndexStore: Send + Sync {
    /// Write both mappings atomically, replacing whatever sat at that
    /// height. Returns the replaced entry.
    fn put(&self, entry: &IndexEntry) -> Result<Option<IndexEntry>, StorageError>;

    fn get_by_height(&self, height: u64) -> Result<Option<IndexEntry>, StorageError>;

    fn get_by_hash(&self, hash: &Hash) -> Result<Option<IndexEntry>, StorageError>;

    /// Delete every entry at or above `height`, returning what was removed
    fn remove_from(&self, height: u64) -> Result<Vec<IndexEntry>, StorageError>;

    /// Highest indexed height
    fn tip_height(&self) -> Result<Option<u64>, StorageError>;
}

/// Sled-backed index store
#[derive(Debug, Clone)]
pub struct SledIndexStore {
    by_height: Tree,
    by_hash: Tree,
}

impl SledIndexStore {
    pub fn new(by_height: Tree, by_hash: Tree) -> Self {
        Self { by_height, by_hash }
    }
}

fn from_transaction(err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(inner) => StorageError::Database(inner),
    }
}

impl IndexStore for SledIndexStore {
    fn put(&self, entry: &IndexEntry) -> Result<Option<IndexEntry>, StorageError> {
        let value = bincode::serialize(entry)?;
        let height_key = entry.height.to_be_bytes().to_vec();
        let hash_key = entry.location.hash.0.to_vec();

        let replaced = (&self.by_height, &self.by_hash)
            .transaction(|(heights, hashes)| {
                let previous = match heights.get(height_key.as_slice())? {
                    Some(bytes) => Some(
                        bincode::deserialize::<IndexEntry>(&bytes)
                            .map_err(|e| ConflictableTransactionError::Abort(StorageError::Encoding(e)))?,
                    ),
                    None => None,
                };
                if let Some(old) = &previous {
                    if old.location.hash != entry.location.hash {
                        hashes.remove(old.location.hash.0.to_vec())?;
                    }
                }
                heights.insert(height_key.clone(), value.clone())?;
                hashes.insert(hash_key.clone(), value.clone())?;
                Ok::<_, ConflictableTransactionError<StorageError>>(previous)
            })
            .map_err(from_transaction)?;

        self.by_height.flush()?;
        Ok(replaced)
    }

    fn get_by_height(&self, height: u64) -> Result<Option<IndexEntry>, StorageError> {
        match self.by_height.get(height.to_be_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_by_hash(&self, hash: &Hash) -> Result<Option<IndexEntry>, StorageError> {
        match self.by_hash.get(hash.0)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove_from(&self, height: u64) -> Result<Vec<IndexEntry>, StorageError> {
        let mut doomed = Vec::new();
        for item in self.by_height.range(height.to_be_bytes().to_vec()..) {
            let (_, value) = item?;
            doomed.push(bincode::deserialize::<IndexEntry>(&value)?);
        }
        if doomed.is_empty() {
            return Ok(doomed);
        }

        (&self.by_height, &self.by_hash)
            .transaction(|(heights, hashes)| {
                for entry in &doomed {
                    heights.remove(entry.height.to_be_bytes().to_vec())?;
                    hashes.remove(entry.location.hash.0.to_vec())?;
                }
                Ok::<(), ConflictableTransactionError<StorageError>>(())
            })
            .map_err(from_transaction)?;

        self.by_height.flush()?;
        Ok(doomed)
    }

    fn tip_height(&self) -> Result<Option<u64>, StorageError> {
        match self.by_height.last()? {
            Some((key, _)) => Ok(Some(decode_height(&key)?)),
            None => Ok(None),
        }
    }
}

/// In-memory index store
#[derive(Debug, Default)]
pub struct MemoryIndexStore {
    inner: RwLock<(BTreeMap<u64, IndexEntry>, HashMap<Hash, u64>)>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexStore for MemoryIndexStore {
    fn put(&self, entry: &IndexEntry) -> Result<Option<IndexEntry>, StorageError> {
        let mut guard = self.inner.write();
        let (heights, hashes) = &mut *guard;
        let previous = heights.insert(entry.height, *entry);
        if let Some(old) = &previous {
            hashes.remove(&old.location.hash);
        }
        hashes.insert(entry.location.hash, entry.height);
        Ok(previous)
    }

    fn get_by_height(&self, height: u64) -> Result<Option<IndexEntry>, StorageError> {
        Ok(self.inner.read().0.get(&height).copied())
    }

    fn get_by_hash(&self, hash: &Hash) -> Result<Option<IndexEntry>, StorageError> {
        let guard = self.inner.read();
        Ok(guard.1.get(hash).and_then(|h| guard.0.get(h)).copied())
    }

    fn remove_from(&self, height: u64) -> Result<Vec<IndexEntry>, StorageError> {
        let mut guard = self.inner.write();
        let (heights, hashes) = &mut *guard;
        let removed: Vec<IndexEntry> = heights.split_off(&height).into_values().collect();
        for entry in &removed {
            hashes.remove(&entry.location.hash);
        }
        Ok(removed)
    }

    fn tip_height(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.inner.read().0.keys().next_back().copied())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    Height(u64),
    Hash(Hash),
}

#[derive(Debug, Default)]
struct CacheState {
    hits: u64,
    misses: u64,
}

/// Cache counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub cached: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

/// LRU-cached block index
pub struct BlockIndex {
    store: Box<dyn IndexStore>,
    cache: Mutex<(LruCache<CacheKey, IndexEntry>, CacheState)>,
}

impl BlockIndex {
    /// Create a new index with the given cache capacity (0 is treated as 1)
    pub fn new(store: Box<dyn IndexStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: Mutex::new((LruCache::new(capacity), CacheState::default())),
        }
    }

    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Box::new(MemoryIndexStore::new()), capacity)
    }

    /// Index a block, overwriting any entry already at its height
    pub fn put(&self, height: u64, location: BlockLocation) -> Result<(), StorageError> {
        let entry = IndexEntry { height, location };
        let mut guard = self.cache.lock();
        let replaced = self.store.put(&entry)?;
        if let Some(old) = replaced {
            if old.location.hash != location.hash {
                debug!(height, old = %old.location.hash.short(), new = %location.hash.short(), "reindexed height");
                guard.0.pop(&CacheKey::Hash(old.location.hash));
            }
        }
        guard.0.put(CacheKey::Height(height), entry);
        guard.0.put(CacheKey::Hash(location.hash), entry);
        Ok(())
    }

    pub fn get_by_height(&self, height: u64) -> Result<Option<IndexEntry>, StorageError> {
        self.lookup(CacheKey::Height(height), |store| store.get_by_height(height))
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Result<Option<IndexEntry>, StorageError> {
        self.lookup(CacheKey::Hash(*hash), |store| store.get_by_hash(hash))
    }

    /// Remove every entry at or above `height` from store and cache.
    /// Returns the number of entries removed.
    pub fn remove_blocks_from(&self, height: u64) -> Result<usize, StorageError> {
        self.take_blocks_from(height).map(|removed| removed.len())
    }

    /// Remove every entry at or above `height`, returning them in height order
    pub fn take_blocks_from(&self, height: u64) -> Result<Vec<IndexEntry>, StorageError> {
        let mut guard = self.cache.lock();
        let removed = match self.store.remove_from(height) {
            Ok(removed) => removed,
            Err(err) => {
                // the store write is atomic, but the cache may now disagree
                warn!(height, error = %err, "index rollback failed, clearing cache");
                guard.0.clear();
                return Err(err);
            }
        };
        for entry in &removed {
            guard.0.pop(&CacheKey::Height(entry.height));
            guard.0.pop(&CacheKey::Hash(entry.location.hash));
        }
        debug!(height, removed = removed.len(), "index rolled back");
        Ok(removed)
    }

    pub fn tip_height(&self) -> Result<Option<u64>, StorageError> {
        self.store.tip_height()
    }

    pub fn stats(&self) -> IndexStats {
        let guard = self.cache.lock();
        IndexStats {
            cached: guard.0.len(),
            capacity: guard.0.cap().get(),
            hits: guard.1.hits,
            misses: guard.1.misses,
        }
    }

    fn lookup<F>(&self, key: CacheKey, fetch: F) -> Result<Option<IndexEntry>, StorageError>
    where
        F: FnOnce(&dyn IndexStore) -> Result<Option<IndexEntry>, StorageError>,
    {
        let mut guard = self.cache.lock();
        if let Some(entry) = guard.0.get(&key).copied() {
            guard.1.hits += 1;
            return Ok(Some(entry));
        }
        guard.1.misses += 1;

        let found = fetch(self.store.as_ref())?;
        if let Some(entry) = found {
            guard.0.put(CacheKey::Height(entry.height), entry);
            guard.0.put(CacheKey::Hash(entry.location.hash), entry);
        }
        Ok(found)
    }
}

impl std::fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockIndex").field("stats", &self.stats()).finish()
    }
}
