//! Startup recovery
//!
//! Candidates are tried strictly in order: the primary store, every backup
//! newest first, every checkpoint newest first. Each is fully validated
//! before it is accepted. If none survives the node must not start.

use std::fmt;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::chain::{BlockId, ChainError, ChainParams, ChainState};
use crate::checkpoint::{CheckpointError, CheckpointManager};
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::{BlockStore, ChainRecord, NodeStore, StorageError};

/// Durable state recovery reads from
pub struct RecoverySources<'a> {
    pub store: &'a NodeStore,
    pub blocks: &'a BlockStore,
    pub checkpoints: &'a CheckpointManager,
    pub genesis: &'a Block,
    pub params: ChainParams,
}

/// Where the recovered chain came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// Nothing stored yet; started from genesis
    Fresh,
    Primary,
    Backup(u64),
    Checkpoint(u64),
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverySource::Fresh => write!(f, "genesis"),
            RecoverySource::Primary => write!(f, "primary store"),
            RecoverySource::Backup(height) => write!(f, "backup at height {height}"),
            RecoverySource::Checkpoint(height) => write!(f, "checkpoint at height {height}"),
        }
    }
}

#[derive(Debug)]
pub struct Recovered {
    pub chain: ChainState,
    pub source: RecoverySource,
}

/// Why the primary store could not be loaded
#[derive(Debug, Error)]
pub enum PrimaryError {
    #[error("blocks are indexed but no chain record exists")]
    MissingRecord,
    #[error("block at height {0} is missing from the index")]
    MissingBlock(u64),
    #[error("stored genesis {found} does not match configured genesis {expected}")]
    GenesisMismatch { expected: Hash, found: Hash },
    #[error("replayed chain {found:?} does not match the stored record {expected:?}")]
    RecordMismatch {
        expected: Box<ChainRecord>,
        found: Box<ChainRecord>,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("replay failed: {0}")]
    Chain(#[from] ChainError),
}

/// One candidate that did not survive validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub source: RecoverySource,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(
        "no valid chain state after {} recovery attempts; refusing to start on unvalidated state. \
         Resync from peers into an empty data directory, inspect the storage directory for \
         disk or file corruption, or contact the network operators",
        .attempts.len()
    )]
    Exhausted { attempts: Vec<FailedAttempt> },
}

/// Run the recovery sequence
pub fn recover(sources: &RecoverySources<'_>) -> Result<Recovered, RecoveryError> {
    let mut attempts = Vec::new();

    match load_primary(sources) {
        Ok(Some(chain)) => return Ok(finish(chain, RecoverySource::Primary, sources)),
        Ok(None) => info!("no stored chain record"),
        Err(err) => reject(&mut attempts, RecoverySource::Primary, err.to_string()),
    }

    let backups = sources.checkpoints.backup_heights().unwrap_or_else(|err| {
        warn!(error = %err, "cannot list backups");
        Vec::new()
    });
    for height in &backups {
        info!(height, "trying backup");
        match sources
            .checkpoints
            .restore_backup(*height, sources.genesis, sources.params)
        {
            Ok(chain) => return Ok(finish(chain, RecoverySource::Backup(*height), sources)),
            Err(err) => reject(&mut attempts, RecoverySource::Backup(*height), err.to_string()),
        }
    }

    let checkpoints = sources.checkpoints.checkpoint_heights().unwrap_or_else(|err| {
        warn!(error = %err, "cannot list checkpoints");
        Vec::new()
    });
    for height in &checkpoints {
        info!(height, "trying checkpoint");
        match sources.checkpoints.restore_checkpoint(*height, sources.params) {
            Ok(chain) => return Ok(finish(chain, RecoverySource::Checkpoint(*height), sources)),
            Err(err) => reject(&mut attempts, RecoverySource::Checkpoint(*height), err.to_string()),
        }
    }

    if attempts.is_empty() {
        match ChainState::new(sources.genesis.clone(), sources.params) {
            Ok(chain) => return Ok(finish(chain, RecoverySource::Fresh, sources)),
            Err(err) => reject(&mut attempts, RecoverySource::Fresh, err.to_string()),
        }
    }

    error!(attempts = attempts.len(), "recovery exhausted");
    Err(RecoveryError::Exhausted { attempts })
}

fn reject(attempts: &mut Vec<FailedAttempt>, source: RecoverySource, reason: String) {
    warn!(%source, %reason, "recovery candidate rejected");
    attempts.push(FailedAttempt { source, reason });
}

/// Replay the canonical blocks the index points at and compare the result
/// with the stored chain record
fn load_primary(sources: &RecoverySources<'_>) -> Result<Option<ChainState>, PrimaryError> {
    let Some(record) = sources.store.load_chain_record()? else {
        return match sources.blocks.tip_height()? {
            Some(_) => Err(PrimaryError::MissingRecord),
            None => Ok(None),
        };
    };
    let read = |height: u64| -> Result<Block, PrimaryError> {
        sources
            .blocks
            .load_block(height)?
            .ok_or(PrimaryError::MissingBlock(height))
    };

    let mut chain = if record.base_height == 0 {
        let genesis = read(0)?;
        if genesis.hash() != sources.genesis.hash() {
            return Err(PrimaryError::GenesisMismatch {
                expected: sources.genesis.hash(),
                found: genesis.hash(),
            });
        }
        ChainState::new(genesis, sources.params)?
    } else {
        let anchor = sources
            .checkpoints
            .load_checkpoint(record.base_height)?
            .to_anchor()?;
        ChainState::from_anchor(anchor, sources.params)
    };
    for height in record.base_height + 1..=record.height {
        chain.connect_tip(read(height)?)?;
    }

    let found = chain.record();
    if found != record {
        return Err(PrimaryError::RecordMismatch {
            expected: Box::new(record),
            found: Box::new(found),
        });
    }
    Ok(Some(chain))
}

/// Finalize `chain` at the newest retained checkpoint it contains.
/// Returns that height.
pub fn finalize_from_checkpoints(chain: &mut ChainState, checkpoints: &CheckpointManager) -> Option<u64> {
    let heights = checkpoints.checkpoint_heights().unwrap_or_default();
    for height in heights.into_iter().filter(|h| *h <= chain.height()) {
        let Ok(checkpoint) = checkpoints.load_checkpoint(height) else {
            continue;
        };
        let on_chain = chain
            .get_block(BlockId::Height(height))
            .map(|block| block.hash());
        if on_chain == Some(checkpoint.block_hash) {
            chain.set_finalized_height(height);
            return Some(height);
        }
    }
    None
}

fn finish(mut chain: ChainState, source: RecoverySource, sources: &RecoverySources<'_>) -> Recovered {
    finalize_from_checkpoints(&mut chain, sources.checkpoints);
    info!(
        %source,
        height = chain.height(),
        tip = %chain.tip_hash().short(),
        finalized = ?chain.finalized_height(),
        "chain state recovered"
    );
    Recovered { chain, source }
}
