//! Canonical block storage: segment files addressed through the block index

use std::sync::Arc;

use crate::consensus::Block;
use crate::storage::{BlockFiles, BlockIndex, BlockLocation, IndexEntry, StorageError};

#[derive(Debug)]
pub struct BlockStore {
    index: Arc<BlockIndex>,
    files: BlockFiles,
}

impl BlockStore {
    pub fn new(index: Arc<BlockIndex>, files: BlockFiles) -> Self {
        Self { index, files }
    }

    pub fn index(&self) -> &Arc<BlockIndex> {
        &self.index
    }

    /// Append a canonical block and index it at its height
    pub fn store_block(&self, block: &Block) -> Result<BlockLocation, StorageError> {
        let location = self.files.append(block)?;
        self.index.put(block.height(), location)?;
        Ok(location)
    }

    pub fn load_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        match self.index.get_by_height(height)? {
            Some(entry) => self.files.read(&entry.location).map(Some),
            None => Ok(None),
        }
    }

    /// Forget every canonical block at or above `height`
    pub fn rewind(&self, height: u64) -> Result<usize, StorageError> {
        self.index.remove_blocks_from(height)
    }

    /// Like [`BlockStore::rewind`], but hands back the dropped entries.
    /// Segment files are append-only, so the entries stay readable and
    /// can be put back with [`BlockStore::reinstate`].
    pub fn split_off(&self, height: u64) -> Result<Vec<IndexEntry>, StorageError> {
        self.index.take_blocks_from(height)
    }

    pub fn reinstate(&self, entries: &[IndexEntry]) -> Result<(), StorageError> {
        entries
            .iter()
            .try_for_each(|entry| self.index.put(entry.height, entry.location))
    }

    pub fn tip_height(&self) -> Result<Option<u64>, StorageError> {
        self.index.tip_height()
    }
}
