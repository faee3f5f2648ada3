//! Durable storage
//!
//! Blocks are appended to flat segment files and addressed by
//! `(file, offset, size)`. Everything else (chain record, backups,
//! checkpoints, the block index) lives in sled trees.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::{Block, ChainWork};
use crate::crypto::Hash;
use crate::storage::{BlockLocation, SledIndexStore};

/// Storage and I/O failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

const CHAIN_RECORD_KEY: &str = "chain";
const BLOCK_FILE_PREFIX: &str = "blk";
const BLOCK_FILE_SUFFIX: &str = ".dat";

/// Summary of the committed canonical chain, written after every change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    /// Height the chain starts from (0, or the checkpoint it was restored from)
    pub base_height: u64,
    pub height: u64,
    pub tip: Hash,
    pub cumulative_work: ChainWork,
    pub ledger_digest: Hash,
}

/// Sled areas holding height-keyed sealed records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordArea {
    Backups,
    Checkpoints,
}

/// Database wrapper
#[derive(Debug, Clone)]
pub struct NodeStore {
    db: Db,
    state: Tree,
    backups: Tree,
    checkpoints: Tree,
}

impl NodeStore {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        Self::from_db(sled::open(path)?)
    }

    /// Throwaway database removed on drop
    pub fn temporary() -> Result<Self, StorageError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let state = db.open_tree("state")?;
        let backups = db.open_tree("backups")?;
        let checkpoints = db.open_tree("checkpoints")?;
        Ok(Self {
            db,
            state,
            backups,
            checkpoints,
        })
    }

    /// Persisted height/hash index sharing this database
    pub fn index_store(&self) -> Result<SledIndexStore, StorageError> {
        Ok(SledIndexStore::new(
            self.db.open_tree("index_height")?,
            self.db.open_tree("index_hash")?,
        ))
    }

    pub fn save_chain_record(&self, record: &ChainRecord) -> Result<(), StorageError> {
        self.state.insert(CHAIN_RECORD_KEY, bincode::serialize(record)?)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_chain_record(&self) -> Result<Option<ChainRecord>, StorageError> {
        match self.state.get(CHAIN_RECORD_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_record(&self, area: RecordArea, height: u64, bytes: &[u8]) -> Result<(), StorageError> {
        self.tree(area).insert(height.to_be_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn get_record(&self, area: RecordArea, height: u64) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.tree(area).get(height.to_be_bytes())?.map(|v| v.to_vec()))
    }

    pub fn remove_record(&self, area: RecordArea, height: u64) -> Result<bool, StorageError> {
        let removed = self.tree(area).remove(height.to_be_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }

    /// Heights present in `area`, ascending
    pub fn record_heights(&self, area: RecordArea) -> Result<Vec<u64>, StorageError> {
        let mut heights = Vec::new();
        for key in self.tree(area).iter().keys() {
            heights.push(decode_height(&key?)?);
        }
        Ok(heights)
    }

    fn tree(&self, area: RecordArea) -> &Tree {
        match area {
            RecordArea::Backups => &self.backups,
            RecordArea::Checkpoints => &self.checkpoints,
        }
    }
}

pub(crate) fn decode_height(key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("height key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

#[derive(Debug)]
struct FileCursor {
    file: u32,
    offset: u64,
}

/// Append-only block segment files `blk00000.dat`, `blk00001.dat`, ...
#[derive(Debug)]
pub struct BlockFiles {
    dir: PathBuf,
    max_file_size: u64,
    cursor: Mutex<FileCursor>,
}

impl BlockFiles {
    /// Open the block directory, continuing after the newest segment
    pub fn open<P: AsRef<Path>>(dir: P, max_file_size: u64) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut newest: Option<u32> = None;
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(number) = parse_segment_name(&name.to_string_lossy()) {
                newest = Some(newest.map_or(number, |n| n.max(number)));
            }
        }

        let file = newest.unwrap_or(0);
        let path = segment_path(&dir, file);
        let offset = if path.exists() { fs::metadata(&path)?.len() } else { 0 };
        debug!(dir = %dir.display(), file, offset, "block files opened");

        Ok(Self {
            dir,
            max_file_size,
            cursor: Mutex::new(FileCursor { file, offset }),
        })
    }

    /// Append a block and return where it landed
    pub fn append(&self, block: &Block) -> Result<BlockLocation, StorageError> {
        let bytes = bincode::serialize(block)?;
        let mut cursor = self.cursor.lock();

        if cursor.offset > 0 && cursor.offset + bytes.len() as u64 > self.max_file_size {
            cursor.file += 1;
            cursor.offset = 0;
            info!(file = cursor.file, "rolled over to new block file");
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(segment_path(&self.dir, cursor.file))?;
        file.write_all(&bytes)?;
        file.sync_data()?;

        let location = BlockLocation {
            file: cursor.file,
            offset: cursor.offset,
            size: bytes.len() as u32,
            hash: block.hash(),
        };
        cursor.offset += bytes.len() as u64;
        Ok(location)
    }

    /// Read the block at `location`, checking it hashes to the recorded hash
    pub fn read(&self, location: &BlockLocation) -> Result<Block, StorageError> {
        let mut file = File::open(segment_path(&self.dir, location.file))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut bytes = vec![0u8; location.size as usize];
        file.read_exact(&mut bytes)?;

        let block: Block = bincode::deserialize(&bytes)?;
        if block.hash() != location.hash {
            return Err(StorageError::Corrupt(format!(
                "block at {}:{} hashes to {}, index says {}",
                location.file,
                location.offset,
                block.hash().short(),
                location.hash.short()
            )));
        }
        Ok(block)
    }
}

fn segment_path(dir: &Path, file: u32) -> PathBuf {
    dir.join(format!("{BLOCK_FILE_PREFIX}{file:05}{BLOCK_FILE_SUFFIX}"))
}

fn parse_segment_name(name: &str) -> Option<u32> {
    name.strip_prefix(BLOCK_FILE_PREFIX)?
        .strip_suffix(BLOCK_FILE_SUFFIX)?
        .parse()
        .ok()
}
