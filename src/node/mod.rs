//! Node module - owns the chain, the mempool and durable storage
//!
//! Lock order is always chain, then mempool. Every canonical change is
//! persisted (block files, index, chain record) before the chain lock is
//! released. After a failed write the next update rewrites from the first
//! unwritten height.

mod genesis;

pub use genesis::*;

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::chain::{BlockId, ChainError, ChainParams, ChainState, ChainStats, ChainUpdate};
use crate::checkpoint::{
    finalize_from_checkpoints, recover, Checkpoint, CheckpointError, CheckpointInfo, CheckpointManager,
    RecoveryError, RecoverySource, RecoverySources, RestoreError,
};
use crate::config::NodeConfig;
use crate::consensus::Block;
use crate::constants::MAX_BLOCK_TRANSACTIONS;
use crate::crypto::{Address, Hash};
use crate::mempool::{Admission, AdmissionError, Mempool, PoolRefresh, TxState};
use crate::mining::{Miner, MiningResult};
use crate::spv::SpvService;
use crate::storage::{BlockFiles, BlockIndex, BlockStore, IndexStats, NodeStore, StorageError};
use crate::validation::Transaction;
use crate::{unix_now, Amount};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error("block rejected: {0}")]
    Chain(#[from] ChainError),
    #[error("transaction rejected: {0}")]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),
}

/// Node-wide counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub chain: ChainStats,
    pub mempool_size: usize,
    pub mempool_orphans: usize,
    pub index: IndexStats,
    pub recovered_from: RecoverySource,
}

/// What one maintenance pass cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub orphan_blocks_pruned: usize,
    pub transactions_expired: usize,
}

pub struct Node {
    config: NodeConfig,
    genesis: Block,
    chain: Arc<RwLock<ChainState>>,
    mempool: Arc<Mutex<Mempool>>,
    blocks: BlockStore,
    store: NodeStore,
    checkpoints: CheckpointManager,
    recovered_from: RecoverySource,
    /// Lowest height a failed write left out of the block files
    unwritten_from: Mutex<Option<u64>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("genesis", &self.genesis.hash())
            .field("recovered_from", &self.recovered_from)
            .finish()
    }
}

impl Node {
    /// Open storage under the configured data directory and recover the
    /// chain. Fails rather than start on state that did not validate.
    pub fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let store = NodeStore::open(config.storage.db_path())?;
        let index = BlockIndex::new(Box::new(store.index_store()?), config.index.cache_capacity);
        let files = BlockFiles::open(config.storage.blocks_path(), config.index.max_block_file_size)?;
        let blocks = BlockStore::new(Arc::new(index), files);
        let checkpoints = CheckpointManager::new(store.clone(), config.checkpoint.clone());
        let genesis = create_genesis_block(&config);
        info!(genesis = %genesis.hash().short(), data_dir = %config.storage.data_dir.display(), "opening node");

        let recovered = recover(&RecoverySources {
            store: &store,
            blocks: &blocks,
            checkpoints: &checkpoints,
            genesis: &genesis,
            params: ChainParams::from_config(&config),
        })?;
        if recovered.source != RecoverySource::Primary {
            reindex(&blocks, &store, &recovered.chain)?;
        }

        Ok(Self {
            mempool: Arc::new(Mutex::new(Mempool::new(config.mempool.clone()))),
            chain: Arc::new(RwLock::new(recovered.chain)),
            recovered_from: recovered.source,
            unwritten_from: Mutex::new(None),
            config,
            genesis,
            blocks,
            store,
            checkpoints,
        })
    }

    pub fn chain(&self) -> Arc<RwLock<ChainState>> {
        Arc::clone(&self.chain)
    }

    pub fn mempool(&self) -> Arc<Mutex<Mempool>> {
        Arc::clone(&self.mempool)
    }

    pub fn spv(&self) -> SpvService {
        SpvService::new(self.chain())
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn recovered_from(&self) -> RecoverySource {
        self.recovered_from
    }

    /// Validate and apply a block, persist the result and refresh the
    /// mempool. A block that validated stays applied even when persisting
    /// it fails; the next update writes it.
    pub fn submit_block(&self, block: Block) -> Result<ChainUpdate, NodeError> {
        let mut chain = self.chain.write();
        self.apply_block(&mut chain, block)
    }

    fn apply_block(&self, chain: &mut ChainState, block: Block) -> Result<ChainUpdate, NodeError> {
        let now = unix_now();
        let update = chain.add_block(block, now)?;
        if update.connected.is_empty() && update.disconnected.is_empty() {
            return Ok(update);
        }

        let persisted = self.persist(chain, &update, now).inspect_err(|err| {
            error!(error = %err, height = chain.height(), "failed to persist chain update");
        });

        let mut mempool = self.mempool.lock();
        let mut refresh = PoolRefresh::default();
        for block in &update.disconnected {
            refresh.resurrected += mempool.on_block_disconnected(block, &*chain, now).resurrected;
        }
        for block in &update.connected {
            let connected = mempool.on_block_connected(block, &*chain, now);
            refresh.confirmed += connected.confirmed;
            refresh.evicted += connected.evicted;
            refresh.promoted += connected.promoted;
        }
        debug!(?refresh, pending = mempool.size(), "mempool updated");
        persisted.map(|()| update)
    }

    /// Block files and index, then the chain record, then any backup or
    /// checkpoint that fell due
    fn persist(&self, chain: &mut ChainState, update: &ChainUpdate, now: u64) -> Result<(), NodeError> {
        let mut unwritten = self.unwritten_from.lock();
        let changed = update
            .rewound_to()
            .or_else(|| update.connected.first().map(Block::height));
        if let Some(from) = changed.into_iter().chain(*unwritten).min() {
            if let Err(err) = self.rewrite_from(chain, from) {
                *unwritten = Some(from);
                return Err(err);
            }
            *unwritten = None;
        }
        drop(unwritten);

        // a multi-block update may step over a due height without ending on it
        let mut heights = update.connected.iter().map(Block::height);
        if heights.clone().any(|h| self.checkpoints.is_backup_due(h)) {
            self.checkpoints.create_backup(chain)?;
        }
        if heights.any(|h| self.checkpoints.is_checkpoint_due(h)) {
            let checkpoint = self.checkpoints.create_checkpoint(chain, now)?;
            chain.set_finalized_height(checkpoint.height);
        }
        Ok(())
    }

    /// Replace the stored blocks from `from` up with the canonical chain and
    /// save the chain record. On failure the index is put back so it still
    /// matches the previous record.
    fn rewrite_from(&self, chain: &ChainState, from: u64) -> Result<(), NodeError> {
        let replaced = self.blocks.split_off(from)?;
        let written = chain
            .canonical_blocks()
            .skip(from.saturating_sub(chain.base_height()) as usize)
            .try_for_each(|block| self.blocks.store_block(block).map(drop))
            .and_then(|()| self.store.save_chain_record(&chain.record()));

        if let Err(err) = written {
            match self.blocks.rewind(from).and_then(|_| self.blocks.reinstate(&replaced)) {
                Ok(()) => warn!(height = from, restored = replaced.len(), "block index rolled back"),
                Err(undo) => error!(height = from, error = %undo, "block index rollback failed"),
            }
            return Err(err.into());
        }
        if !replaced.is_empty() {
            info!(height = from, removed = replaced.len(), "rolled back block index");
        }
        Ok(())
    }

    pub fn submit_transaction(&self, tx: Transaction) -> Result<Admission, NodeError> {
        let chain = self.chain.read();
        let admission = self.mempool.lock().add_transaction(tx, &*chain)?;
        Ok(admission)
    }

    pub fn transaction_status(&self, txid: &Hash) -> Option<TxState> {
        self.mempool.lock().status(txid)
    }

    pub fn get_block(&self, id: BlockId) -> Option<Block> {
        self.chain.read().get_block(id).cloned()
    }

    pub fn get_latest_block(&self) -> Block {
        self.chain.read().get_latest_block().clone()
    }

    pub fn get_balance(&self, address: &Address) -> Amount {
        self.chain.read().get_balance(address)
    }

    pub fn get_stats(&self) -> NodeStats {
        let chain = self.chain.read();
        let mempool = self.mempool.lock();
        NodeStats {
            chain: chain.get_stats(),
            mempool_size: mempool.size(),
            mempool_orphans: mempool.orphan_count(),
            index: self.blocks.index().stats(),
            recovered_from: self.recovered_from,
        }
    }

    /// Checkpoint the current tip and finalize it
    pub fn create_checkpoint(&self) -> Result<Checkpoint, NodeError> {
        let mut chain = self.chain.write();
        let checkpoint = self.checkpoints.create_checkpoint(&chain, unix_now())?;
        chain.set_finalized_height(checkpoint.height);
        Ok(checkpoint)
    }

    pub fn get_checkpoint_info(&self) -> Result<Vec<CheckpointInfo>, NodeError> {
        Ok(self.checkpoints.get_checkpoint_info()?)
    }

    /// Replace the chain with the one rebuilt from the backup at `height`
    pub fn restore_from_backup(&self, height: u64) -> Result<(), NodeError> {
        let params = ChainParams::from_config(&self.config);
        let restored = self.checkpoints.restore_backup(height, &self.genesis, params)?;
        self.replace_chain(restored, RecoverySource::Backup(height))
    }

    /// Replace the chain with one anchored at the checkpoint at `height`
    pub fn restore_from_checkpoint(&self, height: u64) -> Result<(), NodeError> {
        let params = ChainParams::from_config(&self.config);
        let restored = self.checkpoints.restore_checkpoint(height, params)?;
        self.replace_chain(restored, RecoverySource::Checkpoint(height))
    }

    fn replace_chain(&self, mut restored: ChainState, source: RecoverySource) -> Result<(), NodeError> {
        finalize_from_checkpoints(&mut restored, &self.checkpoints);
        let mut chain = self.chain.write();
        reindex(&self.blocks, &self.store, &restored)?;
        *chain = restored;
        let evicted = self.mempool.lock().revalidate(chain.ledger());
        info!(%source, height = chain.height(), evicted, "chain restored");
        Ok(())
    }

    /// Assemble a template, search for a nonce outside any lock, then
    /// commit if the tip has not moved meanwhile
    pub fn mine_once(&self, miner: &Miner) -> Result<MiningResult, NodeError> {
        let template = {
            let chain = self.chain.read();
            let candidates = self
                .mempool
                .lock()
                .get_pending_transactions(MAX_BLOCK_TRANSACTIONS - 1);
            miner.assemble_block(&chain, candidates)
        };

        let parent = *template.previous_hash();
        let is_stale = || self.chain.read().tip_hash() != parent;
        let block = match miner.mine_until_stale(template, is_stale) {
            MiningResult::Success(block) => block,
            other => return Ok(other),
        };

        let mut chain = self.chain.write();
        if chain.tip_hash() != parent {
            debug!(mined_on = %parent.short(), tip = %chain.tip_hash().short(), "mined block is stale");
            return Ok(MiningResult::Stale { mined_on: parent });
        }
        self.apply_block(&mut chain, block.clone())?;
        info!(
            height = block.height(),
            hash = %block.hash().short(),
            txs = block.transactions.len(),
            "mined block"
        );
        Ok(MiningResult::Success(block))
    }

    /// Prune aged orphan blocks and expire stale transactions
    pub fn maintenance(&self, now: u64) -> MaintenanceReport {
        let mut chain = self.chain.write();
        let orphan_blocks_pruned = chain.prune_orphans(now);
        let transactions_expired = self.mempool.lock().expire(now, chain.ledger());
        MaintenanceReport {
            orphan_blocks_pruned,
            transactions_expired,
        }
    }
}

/// Make the block files, index and chain record describe `chain` exactly
fn reindex(blocks: &BlockStore, store: &NodeStore, chain: &ChainState) -> Result<(), StorageError> {
    let removed = blocks.rewind(0)?;
    // an anchored chain's base is a bare header and is restored from its checkpoint
    let skip = usize::from(chain.base_height() > 0);
    let mut stored = 0;
    for block in chain.canonical_blocks().skip(skip) {
        blocks.store_block(block)?;
        stored += 1;
    }
    store.save_chain_record(&chain.record())?;
    info!(removed, stored, base = chain.base_height(), "rebuilt block index");
    Ok(())
}
