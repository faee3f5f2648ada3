//! Canonical chain state
//!
//! Blocks live in an append-only arena addressed by position. The canonical
//! chain is a vector of arena positions; side branches are arena entries
//! that are not on it. The ledger always reflects the canonical tip.

use std::collections::{HashMap, VecDeque};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{OrphanBlockPool, OrphanLimits};
use crate::config::NodeConfig;
use crate::consensus::{
    block_work, calculate_block_reward, calculate_next_difficulty, validate_block, validate_header,
    validate_merkle_root, validate_pow, Block, BlockContext, BlockHeader, ChainWork, RetargetParams,
    ValidationError,
};
use crate::crypto::Hash;
use crate::storage::{BlockUndo, ChainRecord, Ledger, LedgerError};
use crate::Amount;

/// Block acceptance failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("block {0} is already known")]
    Duplicate(Hash),
    #[error("block timestamp {timestamp} is beyond local time {now} plus {drift}s")]
    TimestampTooFar { timestamp: u64, now: u64, drift: u64 },
    #[error("invalid block {hash} at height {height}: {source}")]
    Invalid {
        hash: Hash,
        height: u64,
        #[source]
        source: ValidationError,
    },
    #[error("block {0} descends from an invalid block")]
    InvalidAncestor(Hash),
    #[error("fork point {fork_height} is at or below checkpoint {checkpoint}")]
    ForkBeforeCheckpoint { fork_height: u64, checkpoint: u64 },
    #[error("challenger work {challenger} does not exceed canonical work {canonical}")]
    InsufficientWork { challenger: ChainWork, canonical: ChainWork },
    #[error("ledger after reorg ({got}) differs from full replay ({expected})")]
    ReplayMismatch { expected: Hash, got: Hash },
    #[error("no undo data for canonical block {0}")]
    MissingUndo(Hash),
    #[error("block {0} is not a genesis block")]
    NotGenesis(Hash),
    #[error("block at height {height} does not extend tip {tip}")]
    NotContiguous { height: u64, tip: Hash },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Chain rules that come from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainParams {
    pub retarget: RetargetParams,
    /// Seconds a block timestamp may run ahead of local time
    pub max_future_drift: u64,
    pub verify_reorg_replay: bool,
    pub orphans: OrphanLimits,
}

impl ChainParams {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            retarget: RetargetParams {
                interval: config.chain.retarget_interval,
                target_block_time: config.chain.target_block_time,
            },
            max_future_drift: config.chain.max_future_drift,
            verify_reorg_replay: config.chain.verify_reorg_replay,
            orphans: OrphanLimits {
                max_blocks: config.orphans.max_blocks,
                max_age_secs: config.orphans.max_age_secs,
                max_depth: config.orphans.max_depth,
            },
        }
    }
}

/// Block lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Height(u64),
    Hash(Hash),
}

/// What happened to a submitted block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Parent unknown, held in the orphan pool
    Orphaned { missing_parent: Hash },
    /// Stored on a branch with no more work than the canonical chain
    SideChain,
    /// Appended to the canonical tip
    Extended,
    /// Its branch overtook the canonical chain
    Reorganized { fork_height: u64 },
}

/// Net effect of one `add_block` call, including adopted orphans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    pub outcome: BlockOutcome,
    /// Canonical blocks removed, tip first
    pub disconnected: Vec<Block>,
    /// Blocks that became canonical, ascending
    pub connected: Vec<Block>,
    pub adopted_orphans: usize,
}

impl ChainUpdate {
    fn new(outcome: BlockOutcome) -> Self {
        Self {
            outcome,
            disconnected: Vec::new(),
            connected: Vec::new(),
            adopted_orphans: 0,
        }
    }

    pub(super) fn record_disconnect(&mut self, block: Block) {
        // a block connected earlier in this same update just cancels out
        if self.connected.last().map(|b| b.hash()) == Some(block.hash()) {
            self.connected.pop();
        } else {
            self.disconnected.push(block);
        }
    }

    /// Lowest height whose canonical block changed, if any
    pub fn rewound_to(&self) -> Option<u64> {
        self.disconnected.iter().map(|b| b.height()).min()
    }
}

/// A trusted starting point other than genesis
#[derive(Debug, Clone)]
pub struct ChainAnchor {
    pub header: BlockHeader,
    pub ledger: Ledger,
    pub cumulative_work: ChainWork,
    pub total_issued: Amount,
    pub epoch_start: u64,
}

/// One block in the arena
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub block: Block,
    pub hash: Hash,
    pub height: u64,
    pub parent: Option<usize>,
    pub cumulative_work: ChainWork,
    /// Mined supply up to and including this block
    pub total_issued: Amount,
    /// Timestamp of the first block of this block's retarget period
    pub epoch_start: u64,
    pub(super) undo: Option<BlockUndo>,
    pub(super) invalid: bool,
}

/// Where a confirmed transaction sits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxLocation {
    pub height: u64,
    pub block_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainStats {
    pub height: u64,
    pub tip_hash: Hash,
    pub next_difficulty: u64,
    pub cumulative_work: ChainWork,
    pub total_supply: Amount,
    pub total_issued: Amount,
    pub utxo_count: usize,
    pub orphan_blocks: usize,
    pub known_blocks: usize,
    pub finalized_height: Option<u64>,
}

/// The chain and its ledger, mutated only as a unit
#[derive(Debug, Clone)]
pub struct ChainState {
    pub(super) params: ChainParams,
    pub(super) entries: Vec<BlockEntry>,
    pub(super) by_hash: HashMap<Hash, usize>,
    pub(super) canonical: Vec<usize>,
    pub(super) base_height: u64,
    /// Ledger right after the base block; replays start here
    pub(super) base_ledger: Ledger,
    pub(super) ledger: Ledger,
    pub(super) tx_index: HashMap<Hash, u64>,
    orphans: OrphanBlockPool,
    finalized_height: Option<u64>,
}

impl ChainState {
    /// Start a chain from its genesis block
    pub fn new(genesis: Block, params: ChainParams) -> Result<Self, ChainError> {
        let hash = genesis.hash();
        if !genesis.is_genesis() {
            return Err(ChainError::NotGenesis(hash));
        }
        let invalid = |source| ChainError::Invalid {
            hash,
            height: 0,
            source,
        };
        if genesis.header.difficulty == 0 {
            return Err(invalid(ValidationError::InvalidDifficulty {
                expected: 1,
                got: 0,
            }));
        }
        validate_merkle_root(&genesis).map_err(invalid)?;
        for (index, tx) in genesis.transactions.iter().enumerate() {
            if !tx.is_coinbase() {
                return Err(invalid(ValidationError::MissingCoinbase));
            }
            tx.check_structure()
                .map_err(|source| invalid(ValidationError::InvalidTransaction { index, source }))?;
        }

        let mut ledger = Ledger::new();
        let undo = ledger.apply_block(&genesis)?;
        let entry = BlockEntry {
            hash,
            height: 0,
            parent: None,
            cumulative_work: block_work(genesis.header.difficulty),
            total_issued: 0,
            epoch_start: genesis.header.timestamp,
            undo: Some(undo),
            invalid: false,
            block: genesis,
        };
        info!(hash = %hash.short(), supply = ledger.get_total_unspent_value(), "chain initialized from genesis");
        Ok(Self::with_base(entry, ledger, params, None))
    }

    /// Start a chain from a trusted anchor (a verified checkpoint)
    pub fn from_anchor(anchor: ChainAnchor, params: ChainParams) -> Self {
        let block = Block::new(anchor.header, vec![]);
        let hash = block.hash();
        let height = block.height();
        let entry = BlockEntry {
            hash,
            height,
            parent: None,
            cumulative_work: anchor.cumulative_work,
            total_issued: anchor.total_issued,
            epoch_start: anchor.epoch_start,
            undo: None,
            invalid: false,
            block,
        };
        info!(height, hash = %hash.short(), "chain initialized from anchor");
        Self::with_base(entry, anchor.ledger, params, Some(height))
    }

    fn with_base(entry: BlockEntry, ledger: Ledger, params: ChainParams, finalized: Option<u64>) -> Self {
        let mut tx_index = HashMap::new();
        for tx in &entry.block.transactions {
            tx_index.insert(tx.txid(), entry.height);
        }
        let mut by_hash = HashMap::new();
        by_hash.insert(entry.hash, 0);
        Self {
            base_height: entry.height,
            entries: vec![entry],
            by_hash,
            canonical: vec![0],
            base_ledger: ledger.clone(),
            ledger,
            tx_index,
            orphans: OrphanBlockPool::new(params.orphans),
            finalized_height: finalized,
            params,
        }
    }

    /// Replay a full chain with complete validation
    pub fn from_blocks(blocks: Vec<Block>, params: ChainParams) -> Result<Self, ChainError> {
        let mut blocks = blocks.into_iter();
        let genesis = blocks
            .next()
            .ok_or_else(|| ChainError::NotGenesis(Hash::zero()))?;
        let mut chain = Self::new(genesis, params)?;
        for block in blocks {
            chain.connect_tip(block)?;
        }
        Ok(chain)
    }

    /// Append a block that must extend the current tip
    pub fn connect_tip(&mut self, block: Block) -> Result<(), ChainError> {
        if block.previous_hash() != &self.tip_hash() {
            return Err(ChainError::NotContiguous {
                height: block.height(),
                tip: self.tip_hash(),
            });
        }
        let mut update = ChainUpdate::new(BlockOutcome::Extended);
        self.attach(block, &mut update)?;
        Ok(())
    }

    /// Submit a block: extend, store as side branch, reorganize, or hold as
    /// orphan. Orphans waiting on it are connected afterwards.
    pub fn add_block(&mut self, block: Block, now: u64) -> Result<ChainUpdate, ChainError> {
        let hash = block.hash();
        if self.by_hash.contains_key(&hash) || self.orphans.contains(&hash) {
            return Err(ChainError::Duplicate(hash));
        }
        let drift = self.params.max_future_drift;
        if block.header.timestamp > now.saturating_add(drift) {
            return Err(ChainError::TimestampTooFar {
                timestamp: block.header.timestamp,
                now,
                drift,
            });
        }

        let missing_parent = *block.previous_hash();
        if !self.by_hash.contains_key(&missing_parent) {
            let height = block.height();
            let invalid = |source| ChainError::Invalid { hash, height, source };
            validate_pow(&block.header).map_err(invalid)?;
            validate_merkle_root(&block).map_err(invalid)?;
            self.orphans.insert(block, now);
            info!(height, hash = %hash.short(), parent = %missing_parent.short(), "block orphaned");
            return Ok(ChainUpdate::new(BlockOutcome::Orphaned { missing_parent }));
        }

        let mut update = ChainUpdate::new(BlockOutcome::SideChain);
        update.outcome = self.attach(block, &mut update)?;

        let mut queue = VecDeque::from([hash]);
        while let Some(parent) = queue.pop_front() {
            for child in self.orphans.take_children(&parent) {
                let child_hash = child.hash();
                match self.attach(child, &mut update) {
                    Ok(_) => {
                        update.adopted_orphans += 1;
                        queue.push_back(child_hash);
                    }
                    Err(err) => {
                        warn!(hash = %child_hash.short(), error = %err, "dropping orphan");
                    }
                }
            }
        }
        Ok(update)
    }

    /// Connect a block whose parent is in the arena
    fn attach(&mut self, block: Block, update: &mut ChainUpdate) -> Result<BlockOutcome, ChainError> {
        let hash = block.hash();
        let parent_idx = match self.by_hash.get(block.previous_hash()) {
            Some(idx) => *idx,
            None => {
                return Err(ChainError::NotContiguous {
                    height: block.height(),
                    tip: self.tip_hash(),
                })
            }
        };
        if self.by_hash.contains_key(&hash) {
            return Err(ChainError::Duplicate(hash));
        }
        if self.entries[parent_idx].invalid {
            return Err(ChainError::InvalidAncestor(hash));
        }

        let ctx = self.context_for(parent_idx);
        let height = ctx.height;
        let invalid = |source| ChainError::Invalid { hash, height, source };
        validate_header(&block.header, &ctx).map_err(invalid)?;
        validate_merkle_root(&block).map_err(invalid)?;
        if !block.verify_signature() {
            return Err(invalid(ValidationError::InvalidSignature));
        }

        if parent_idx == self.tip_index() {
            let summary = validate_block(&block, &ctx, &self.ledger).map_err(invalid)?;
            let undo = self.ledger.apply_block(&block)?;
            let idx = self.push_entry(block.clone(), parent_idx, Some(undo));
            self.canonical.push(idx);
            self.index_transactions(idx);
            info!(
                height,
                hash = %hash.short(),
                txs = block.transactions.len(),
                fees = summary.fees,
                "block connected"
            );
            update.connected.push(block);
            return Ok(BlockOutcome::Extended);
        }

        let fork_height = self.fork_height(parent_idx);
        if let Some(checkpoint) = self.finalized_height {
            if fork_height <= checkpoint {
                warn!(height, fork_height, checkpoint, "rejecting fork behind checkpoint");
                return Err(ChainError::ForkBeforeCheckpoint {
                    fork_height,
                    checkpoint,
                });
            }
        }

        let idx = self.push_entry(block, parent_idx, None);
        if self.entries[idx].cumulative_work > self.tip_entry().cumulative_work {
            let fork_height = self.reorganize(idx, update)?;
            Ok(BlockOutcome::Reorganized { fork_height })
        } else {
            debug!(height, hash = %hash.short(), fork_height, "stored side-chain block");
            Ok(BlockOutcome::SideChain)
        }
    }

    fn push_entry(&mut self, block: Block, parent_idx: usize, undo: Option<BlockUndo>) -> usize {
        let parent = &self.entries[parent_idx];
        let height = parent.height + 1;
        let epoch_start = if self.params.retarget.should_adjust(height) {
            block.header.timestamp
        } else {
            parent.epoch_start
        };
        let entry = BlockEntry {
            hash: block.hash(),
            height,
            parent: Some(parent_idx),
            cumulative_work: parent
                .cumulative_work
                .saturating_add(block_work(block.header.difficulty)),
            total_issued: parent
                .total_issued
                .saturating_add(calculate_block_reward(height, parent.total_issued)),
            epoch_start,
            undo,
            invalid: false,
            block,
        };
        let idx = self.entries.len();
        self.by_hash.insert(entry.hash, idx);
        self.entries.push(entry);
        idx
    }

    /// Validation context for a child of the arena entry at `parent_idx`
    pub(super) fn context_for(&self, parent_idx: usize) -> BlockContext {
        let parent = &self.entries[parent_idx];
        BlockContext {
            parent_hash: parent.hash,
            parent_timestamp: parent.block.header.timestamp,
            height: parent.height + 1,
            expected_difficulty: self.difficulty_after(parent),
            total_issued: parent.total_issued,
        }
    }

    fn difficulty_after(&self, parent: &BlockEntry) -> u64 {
        let retarget = &self.params.retarget;
        if retarget.should_adjust(parent.height + 1) {
            calculate_next_difficulty(
                retarget,
                parent.block.header.difficulty,
                parent.epoch_start,
                parent.block.header.timestamp,
            )
        } else {
            parent.block.header.difficulty
        }
    }

    pub(super) fn is_canonical(&self, idx: usize) -> bool {
        let height = self.entries[idx].height;
        height >= self.base_height
            && self.canonical.get((height - self.base_height) as usize) == Some(&idx)
    }

    /// Height of the last canonical ancestor of `idx` (itself if canonical)
    fn fork_height(&self, mut idx: usize) -> u64 {
        while !self.is_canonical(idx) {
            match self.entries[idx].parent {
                Some(parent) => idx = parent,
                None => break,
            }
        }
        self.entries[idx].height
    }

    pub(super) fn index_transactions(&mut self, idx: usize) {
        let entry = &self.entries[idx];
        for tx in &entry.block.transactions {
            self.tx_index.insert(tx.txid(), entry.height);
        }
    }

    pub(super) fn unindex_transactions(&mut self, idx: usize) {
        let entry = &self.entries[idx];
        for tx in &entry.block.transactions {
            if self.tx_index.get(&tx.txid()) == Some(&entry.height) {
                self.tx_index.remove(&tx.txid());
            }
        }
    }

    pub(super) fn tip_index(&self) -> usize {
        self.canonical.last().copied().unwrap_or(0)
    }

    pub fn tip_entry(&self) -> &BlockEntry {
        &self.entries[self.tip_index()]
    }

    pub fn height(&self) -> u64 {
        self.tip_entry().height
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip_entry().hash
    }

    pub fn get_latest_block(&self) -> &Block {
        &self.tip_entry().block
    }

    /// Lowest height held in full (0 unless started from an anchor)
    pub fn base_height(&self) -> u64 {
        self.base_height
    }

    /// Canonical block by height or hash
    pub fn get_block(&self, id: BlockId) -> Option<&Block> {
        let idx = match id {
            BlockId::Height(height) => {
                let offset = height.checked_sub(self.base_height)?;
                *self.canonical.get(offset as usize)?
            }
            BlockId::Hash(hash) => {
                let idx = *self.by_hash.get(&hash)?;
                if !self.is_canonical(idx) {
                    return None;
                }
                idx
            }
        };
        Some(&self.entries[idx].block)
    }

    /// Known anywhere: canonical, side branch, or orphan pool
    pub fn contains_block(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash) || self.orphans.contains(hash)
    }

    /// Canonical blocks from the base up to the tip
    pub fn canonical_blocks(&self) -> impl Iterator<Item = &Block> + '_ {
        self.canonical.iter().map(move |idx| &self.entries[*idx].block)
    }

    /// Up to `count` canonical headers starting at `from`
    pub fn header_range(&self, from: u64, count: usize) -> Vec<BlockHeader> {
        let start = from.saturating_sub(self.base_height) as usize;
        self.canonical
            .iter()
            .skip(start)
            .take(count)
            .map(|idx| self.entries[*idx].block.header.clone())
            .collect()
    }

    pub fn find_transaction(&self, txid: &Hash) -> Option<TxLocation> {
        let height = *self.tx_index.get(txid)?;
        let block = self.get_block(BlockId::Height(height))?;
        Some(TxLocation {
            height,
            block_hash: block.hash(),
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn get_balance(&self, address: &crate::crypto::Address) -> Amount {
        self.ledger.get_balance(address)
    }

    pub fn get_total_unspent_value(&self) -> Amount {
        self.ledger.get_total_unspent_value()
    }

    pub fn snapshot_digest(&self) -> Hash {
        self.ledger.snapshot_digest()
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Context a block extending the current tip is validated in
    pub fn next_block_context(&self) -> BlockContext {
        self.context_for(self.tip_index())
    }

    /// Context for a child of any known block, canonical or not
    pub fn context_after(&self, parent: &Hash) -> Option<BlockContext> {
        self.by_hash.get(parent).map(|idx| self.context_for(*idx))
    }

    /// Summary persisted after every change to the canonical chain
    pub fn record(&self) -> ChainRecord {
        let tip = self.tip_entry();
        ChainRecord {
            base_height: self.base_height,
            height: tip.height,
            tip: tip.hash,
            cumulative_work: tip.cumulative_work,
            ledger_digest: self.ledger.snapshot_digest(),
        }
    }

    pub fn finalized_height(&self) -> Option<u64> {
        self.finalized_height
    }

    /// Forbid reorgs forking at or below `height`. Never lowers the mark.
    pub fn set_finalized_height(&mut self, height: u64) {
        if self.finalized_height.map_or(true, |h| height > h) {
            debug!(height, "finalized height raised");
            self.finalized_height = Some(height);
        }
    }

    pub fn prune_orphans(&mut self, now: u64) -> usize {
        let tip = self.height();
        self.orphans.prune(now, tip)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Orphans waiting on `parent`
    pub fn orphans_waiting_on(&self, parent: &Hash) -> Vec<&Block> {
        self.orphans.children_of(parent)
    }

    pub fn get_stats(&self) -> ChainStats {
        let tip = self.tip_entry();
        ChainStats {
            height: tip.height,
            tip_hash: tip.hash,
            next_difficulty: self.difficulty_after(tip),
            cumulative_work: tip.cumulative_work,
            total_supply: self.ledger.get_total_unspent_value(),
            total_issued: tip.total_issued,
            utxo_count: self.ledger.len(),
            orphan_blocks: self.orphans.len(),
            known_blocks: self.entries.len(),
            finalized_height: self.finalized_height,
        }
    }
}
