//! Checkpoint and backup retention

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chain::{BlockId, ChainAnchor, ChainError, ChainParams, ChainState};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointInfo};
use crate::config::CheckpointConfig;
use crate::consensus::Block;
use crate::crypto::Hash;
use crate::storage::{NodeStore, RecordArea, StorageError};

/// Canonical blocks plus the expected result of replaying them.
///
/// With `base_height` 0 the record holds every block from genesis.
/// Otherwise it holds the blocks after `base_height` and needs the
/// checkpoint at that height to be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub base_height: u64,
    pub tip_height: u64,
    pub tip: Hash,
    pub ledger_digest: Hash,
    pub blocks: Vec<Block>,
}

impl BackupRecord {
    /// Capture `chain` from `anchor` (a checkpointed canonical height) or
    /// from the lowest block it holds
    pub fn capture(chain: &ChainState, anchor: Option<u64>) -> Self {
        let base_height = anchor.unwrap_or_else(|| chain.base_height());
        let skip = match base_height {
            0 => 0,
            base => (base - chain.base_height()) as usize + 1,
        };
        Self {
            base_height,
            tip_height: chain.height(),
            tip: chain.tip_hash(),
            ledger_digest: chain.snapshot_digest(),
            blocks: chain.canonical_blocks().skip(skip).cloned().collect(),
        }
    }
}

/// Creates, retains and loads checkpoints and backups
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: NodeStore,
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(store: NodeStore, config: CheckpointConfig) -> Self {
        Self { store, config }
    }

    pub fn is_checkpoint_due(&self, height: u64) -> bool {
        height > 0 && height % self.config.interval == 0
    }

    pub fn is_backup_due(&self, height: u64) -> bool {
        height > 0 && height % self.config.backup_interval == 0
    }

    /// Seal and store the canonical tip, then evict beyond the retention limit
    pub fn create_checkpoint(&self, chain: &ChainState, now: u64) -> Result<Checkpoint, CheckpointError> {
        let checkpoint = Checkpoint::capture(chain, now);
        let json = checkpoint.to_json()?;
        self.store
            .put_record(RecordArea::Checkpoints, checkpoint.height, json.as_bytes())?;
        info!(
            height = checkpoint.height,
            hash = %checkpoint.block_hash.short(),
            utxos = checkpoint.utxo_snapshot.utxos.len(),
            "checkpoint created"
        );
        // an anchored chain or backup still needs the checkpoint it starts from
        let mut protect = self.backup_bases()?;
        if chain.base_height() > 0 {
            protect.push(chain.base_height());
        }
        self.evict(RecordArea::Checkpoints, self.config.retained, &protect)?;
        Ok(checkpoint)
    }

    /// Load and verify the checkpoint at `height`
    pub fn load_checkpoint(&self, height: u64) -> Result<Checkpoint, CheckpointError> {
        let bytes = self
            .store
            .get_record(RecordArea::Checkpoints, height)?
            .ok_or(CheckpointError::NotFound(height))?;
        let json = String::from_utf8_lossy(&bytes);
        Checkpoint::from_json(&json)
    }

    /// Retained checkpoint heights, newest first
    pub fn checkpoint_heights(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut heights = self.store.record_heights(RecordArea::Checkpoints)?;
        heights.reverse();
        Ok(heights)
    }

    /// Newest checkpoint that passes verification
    pub fn latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        for height in self.checkpoint_heights()? {
            match self.load_checkpoint(height) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(err) => warn!(height, error = %err, "skipping unusable checkpoint"),
            }
        }
        Ok(None)
    }

    /// Summaries of every retained checkpoint that verifies, newest first
    pub fn get_checkpoint_info(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let mut infos = Vec::new();
        for height in self.checkpoint_heights()? {
            match self.load_checkpoint(height) {
                Ok(checkpoint) => infos.push(checkpoint.info()),
                Err(err) => warn!(height, error = %err, "checkpoint failed verification"),
            }
        }
        Ok(infos)
    }

    /// Store the blocks since the newest checkpoint on the canonical path,
    /// or the whole chain when there is none
    pub fn create_backup(&self, chain: &ChainState) -> Result<BackupRecord, CheckpointError> {
        let record = BackupRecord::capture(chain, self.backup_anchor(chain)?);
        let bytes = bincode::serialize(&record).map_err(StorageError::from)?;
        self.store
            .put_record(RecordArea::Backups, record.tip_height, &bytes)?;
        info!(
            height = record.tip_height,
            base = record.base_height,
            blocks = record.blocks.len(),
            "backup written"
        );
        self.evict(RecordArea::Backups, self.config.backups_retained, &[])?;
        Ok(record)
    }

    fn backup_anchor(&self, chain: &ChainState) -> Result<Option<u64>, CheckpointError> {
        for height in self.checkpoint_heights()? {
            if height > chain.height() {
                continue;
            }
            let Some(block) = chain.get_block(BlockId::Height(height)) else {
                break;
            };
            match self.load_checkpoint(height) {
                Ok(checkpoint) if checkpoint.block_hash == block.hash() => return Ok(Some(height)),
                Ok(_) => debug!(height, "checkpoint is off the canonical path"),
                Err(err) => warn!(height, error = %err, "checkpoint unusable as backup base"),
            }
        }
        Ok(None)
    }

    /// Checkpoint heights retained backups start from
    fn backup_bases(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut bases = Vec::new();
        for height in self.backup_heights()? {
            match self.load_backup(height) {
                Ok(record) if record.base_height > 0 => bases.push(record.base_height),
                Ok(_) => {}
                Err(err) => warn!(height, error = %err, "unreadable backup"),
            }
        }
        Ok(bases)
    }

    pub fn load_backup(&self, height: u64) -> Result<BackupRecord, CheckpointError> {
        let bytes = self
            .store
            .get_record(RecordArea::Backups, height)?
            .ok_or(CheckpointError::BackupNotFound(height))?;
        bincode::deserialize(&bytes)
            .map_err(|err| StorageError::from(err).into())
    }

    /// Retained backup heights, newest first
    pub fn backup_heights(&self) -> Result<Vec<u64>, CheckpointError> {
        let mut heights = self.store.record_heights(RecordArea::Backups)?;
        heights.reverse();
        Ok(heights)
    }

    /// Rebuild a chain from the backup at `height` with full validation
    pub fn restore_backup(
        &self,
        height: u64,
        genesis: &Block,
        params: ChainParams,
    ) -> Result<ChainState, RestoreError> {
        let record = self.load_backup(height)?;
        let chain = if record.base_height == 0 {
            match record.blocks.first() {
                Some(first) if first.hash() == genesis.hash() => {}
                _ => return Err(RestoreError::GenesisMismatch(genesis.hash())),
            }
            ChainState::from_blocks(record.blocks, params)?
        } else {
            let anchor = self.anchor_at(record.base_height)?;
            let mut chain = ChainState::from_anchor(anchor, params);
            for block in record.blocks {
                chain.connect_tip(block)?;
            }
            chain
        };

        if chain.tip_hash() != record.tip {
            return Err(CheckpointError::BackupMismatch { height, what: "tip" }.into());
        }
        if chain.snapshot_digest() != record.ledger_digest {
            return Err(CheckpointError::BackupMismatch {
                height,
                what: "ledger digest",
            }
            .into());
        }
        Ok(chain)
    }

    /// Rebuild a chain from the checkpoint at `height`
    pub fn restore_checkpoint(&self, height: u64, params: ChainParams) -> Result<ChainState, RestoreError> {
        let anchor = self.anchor_at(height)?;
        Ok(ChainState::from_anchor(anchor, params))
    }

    fn anchor_at(&self, height: u64) -> Result<ChainAnchor, CheckpointError> {
        self.load_checkpoint(height)?.to_anchor()
    }

    /// Keep the `keep` highest records of `area`, never removing `protect`
    fn evict(&self, area: RecordArea, keep: usize, protect: &[u64]) -> Result<(), CheckpointError> {
        let mut heights = self.store.record_heights(area)?;
        heights.retain(|h| !protect.contains(h));
        let excess = heights.len().saturating_sub(keep);
        for height in &heights[..excess] {
            self.store.remove_record(area, *height)?;
            debug!(height, ?area, "evicted record");
        }
        Ok(())
    }
}

/// Failure to rebuild a chain from a backup or checkpoint
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("backup does not start from the configured genesis {0}")]
    GenesisMismatch(Hash),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error("replay failed: {0}")]
    Chain(#[from] ChainError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{grow, new_chain, params, GENESIS_FUNDS};

    fn manager(retained: usize) -> CheckpointManager {
        CheckpointManager::new(
            NodeStore::temporary().unwrap(),
            CheckpointConfig {
                interval: 2,
                retained,
                backup_interval: 3,
                backups_retained: 2,
            },
        )
    }

    #[test]
    fn test_schedule() {
        let manager = manager(3);
        assert!(!manager.is_checkpoint_due(0));
        assert!(manager.is_checkpoint_due(4));
        assert!(!manager.is_checkpoint_due(5));
        assert!(manager.is_backup_due(6));
        assert!(!manager.is_backup_due(4));
    }

    #[test]
    fn test_checkpoint_retention() {
        let manager = manager(2);
        let (mut chain, _, genesis) = new_chain();
        let mut parent = genesis.hash();
        for _ in 0..4 {
            parent = grow(&mut chain, parent, "LNminer", 1)[0].hash();
            manager.create_checkpoint(&chain, 7).unwrap();
        }

        assert_eq!(manager.checkpoint_heights().unwrap(), vec![4, 3]);
        assert!(matches!(
            manager.load_checkpoint(1),
            Err(CheckpointError::NotFound(1))
        ));
        let latest = manager.latest().unwrap().unwrap();
        assert_eq!(latest.block_hash, chain.tip_hash());

        let infos = manager.get_checkpoint_info().unwrap();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].height, 4);
        assert_eq!(infos[0].total_supply, chain.get_total_unspent_value());
        assert!(infos[0].total_supply > GENESIS_FUNDS);
    }

    #[test]
    fn test_corrupt_checkpoint_skipped() {
        let manager = manager(5);
        let (mut chain, _, genesis) = new_chain();
        let blocks = grow(&mut chain, genesis.hash(), "LNminer", 1);
        manager.create_checkpoint(&chain, 7).unwrap();
        grow(&mut chain, blocks[0].hash(), "LNminer", 1);
        manager.create_checkpoint(&chain, 7).unwrap();

        manager
            .store
            .put_record(RecordArea::Checkpoints, 2, b"{\"height\":2}")
            .unwrap();
        assert!(manager.load_checkpoint(2).is_err());
        assert_eq!(manager.latest().unwrap().unwrap().height, 1);
        assert_eq!(manager.get_checkpoint_info().unwrap().len(), 1);
    }

    #[test]
    fn test_backup_restore() {
        let manager = manager(2);
        let (mut chain, _, genesis) = new_chain();
        grow(&mut chain, genesis.hash(), "LNminer", 3);
        let record = manager.create_backup(&chain).unwrap();
        assert_eq!(record.blocks.len(), 4);

        let restored = manager.restore_backup(3, &genesis, params()).unwrap();
        assert_eq!(restored.tip_hash(), chain.tip_hash());
        assert_eq!(restored.snapshot_digest(), chain.snapshot_digest());

        let (_, _, other_genesis) = new_chain();
        assert!(matches!(
            manager.restore_backup(3, &other_genesis, params()),
            Err(RestoreError::GenesisMismatch(_))
        ));
        assert!(matches!(
            manager.restore_backup(9, &genesis, params()),
            Err(RestoreError::Checkpoint(CheckpointError::BackupNotFound(9)))
        ));
    }

    #[test]
    fn test_backup_digest_checked() {
        let manager = manager(2);
        let (mut chain, _, genesis) = new_chain();
        grow(&mut chain, genesis.hash(), "LNminer", 2);
        let mut record = BackupRecord::capture(&chain, None);
        record.ledger_digest = Hash::zero();
        let bytes = bincode::serialize(&record).unwrap();
        manager.store.put_record(RecordArea::Backups, 2, &bytes).unwrap();

        assert!(matches!(
            manager.restore_backup(2, &genesis, params()),
            Err(RestoreError::Checkpoint(CheckpointError::BackupMismatch { height: 2, .. }))
        ));
    }

    #[test]
    fn test_anchored_backup_and_protected_base() {
        let manager = manager(1);
        let (mut chain, _, genesis) = new_chain();
        grow(&mut chain, genesis.hash(), "LNminer", 2);
        manager.create_checkpoint(&chain, 7).unwrap();

        let mut anchored = manager.restore_checkpoint(2, params()).unwrap();
        assert_eq!(anchored.base_height(), 2);
        let tip = anchored.tip_hash();
        grow(&mut anchored, tip, "LNminer", 2);
        manager.create_checkpoint(&anchored, 8).unwrap();
        // base checkpoint survives eviction alongside the newest one
        assert_eq!(manager.checkpoint_heights().unwrap(), vec![4, 2]);

        // the tip itself is checkpointed, so the backup carries no blocks
        let record = manager.create_backup(&anchored).unwrap();
        assert_eq!(record.base_height, 4);
        assert!(record.blocks.is_empty());
        let restored = manager.restore_backup(4, &genesis, params()).unwrap();
        assert_eq!(restored.tip_hash(), anchored.tip_hash());
        assert_eq!(restored.snapshot_digest(), anchored.snapshot_digest());
    }

    #[test]
    fn test_backup_starts_at_latest_checkpoint() {
        let manager = manager(1);
        let (mut chain, _, genesis) = new_chain();
        let first = grow(&mut chain, genesis.hash(), "LNminer", 2);
        manager.create_checkpoint(&chain, 7).unwrap();
        let tip = first[1].hash();
        let at_three = grow(&mut chain, tip, "LNminer", 1)[0].hash();

        let record = manager.create_backup(&chain).unwrap();
        assert_eq!(record.base_height, 2);
        assert_eq!(record.blocks.len(), 1);
        assert_eq!(BackupRecord::capture(&chain, None).blocks.len(), 4);

        // retained backups keep their base checkpoint alive
        grow(&mut chain, at_three, "LNminer", 2);
        manager.create_checkpoint(&chain, 8).unwrap();
        assert_eq!(manager.checkpoint_heights().unwrap(), vec![5, 2]);

        let restored = manager.restore_backup(3, &genesis, params()).unwrap();
        assert_eq!(restored.base_height(), 2);
        assert_eq!(restored.tip_hash(), at_three);
    }

    #[test]
    fn test_backup_ignores_checkpoint_off_the_chain() {
        let manager = manager(3);
        let (mut rival, _, genesis) = new_chain();
        grow(&mut rival, genesis.hash(), "LNrival", 2);
        manager.create_checkpoint(&rival, 7).unwrap();

        let mut chain = ChainState::new(genesis.clone(), params()).unwrap();
        grow(&mut chain, genesis.hash(), "LNminer", 3);
        let record = manager.create_backup(&chain).unwrap();
        assert_eq!(record.base_height, 0);
        assert_eq!(record.blocks.len(), 4);
    }
}
