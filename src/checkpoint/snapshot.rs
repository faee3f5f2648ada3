//! Sealed checkpoints
//!
//! A checkpoint is the tip header, the full ledger snapshot and the chain
//! totals at one height, sealed with a BLAKE3 hash over all of it. The seal
//! is recomputed on every load.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainAnchor, ChainState};
use crate::consensus::{BlockHeader, ChainWork};
use crate::crypto::{hash_bytes, Hash, PublicKey};
use crate::storage::{Ledger, LedgerError, LedgerSnapshot, StorageError};
use crate::Amount;

/// Integrity failures of stored checkpoints and backups
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {height} seal mismatch: stored {stored}, computed {computed}")]
    SealMismatch { height: u64, stored: Hash, computed: Hash },
    #[error("checkpoint {height} header hashes to {computed}, recorded {recorded}")]
    HeaderMismatch { height: u64, recorded: Hash, computed: Hash },
    #[error("checkpoint {height} snapshot holds {snapshot}, recorded supply {recorded}")]
    SupplyMismatch { height: u64, recorded: Amount, snapshot: Amount },
    #[error("no checkpoint at height {0}")]
    NotFound(u64),
    #[error("no backup at height {0}")]
    BackupNotFound(u64),
    #[error("backup {height} does not reproduce its recorded {what}")]
    BackupMismatch { height: u64, what: &'static str },
    #[error("corrupt ledger snapshot: {0}")]
    Snapshot(#[from] LedgerError),
    #[error("checkpoint encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Sealed snapshot of the chain at one height
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u64,
    pub block_hash: Hash,
    pub previous_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u64,
    pub difficulty: u64,
    pub nonce: u64,
    pub version: u32,
    pub miner_key: Option<PublicKey>,
    pub cumulative_work: ChainWork,
    pub total_issued: Amount,
    /// Start of the retarget period the block belongs to
    pub epoch_start: u64,
    pub total_supply: Amount,
    pub utxo_snapshot: LedgerSnapshot,
    /// Wall-clock time the checkpoint was taken
    pub created_at: u64,
    pub integrity_hash: Hash,
}

impl Checkpoint {
    /// Capture the canonical tip of `chain`
    pub fn capture(chain: &ChainState, created_at: u64) -> Self {
        let tip = chain.tip_entry();
        let header = &tip.block.header;
        let mut checkpoint = Self {
            height: tip.height,
            block_hash: tip.hash,
            previous_hash: header.previous_hash,
            merkle_root: header.merkle_root,
            timestamp: header.timestamp,
            difficulty: header.difficulty,
            nonce: header.nonce,
            version: header.version,
            miner_key: header.miner_key.clone(),
            cumulative_work: tip.cumulative_work,
            total_issued: tip.total_issued,
            epoch_start: tip.epoch_start,
            total_supply: chain.get_total_unspent_value(),
            utxo_snapshot: chain.ledger().snapshot(),
            created_at,
            integrity_hash: Hash::zero(),
        };
        checkpoint.integrity_hash = checkpoint.compute_integrity_hash();
        checkpoint
    }

    /// BLAKE3 over every field except the seal itself
    pub fn compute_integrity_hash(&self) -> Hash {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.block_hash.0);
        bytes.extend_from_slice(&self.previous_hash.0);
        bytes.extend_from_slice(&self.merkle_root.0);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.difficulty.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        bytes.extend_from_slice(&self.version.to_le_bytes());
        match &self.miner_key {
            Some(key) => {
                bytes.push(1);
                bytes.extend_from_slice(&key.0);
            }
            None => bytes.push(0),
        }
        bytes.extend_from_slice(&self.cumulative_work.to_le_bytes());
        bytes.extend_from_slice(&self.total_issued.to_le_bytes());
        bytes.extend_from_slice(&self.epoch_start.to_le_bytes());
        bytes.extend_from_slice(&self.total_supply.to_le_bytes());
        bytes.extend_from_slice(&self.utxo_snapshot.digest().0);
        bytes.extend_from_slice(&self.created_at.to_le_bytes());
        hash_bytes(&bytes)
    }

    /// Header of the checkpointed block, rebuilt from the stored fields
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            version: self.version,
            index: self.height,
            previous_hash: self.previous_hash,
            merkle_root: self.merkle_root,
            timestamp: self.timestamp,
            difficulty: self.difficulty,
            nonce: self.nonce,
            miner_key: self.miner_key.clone(),
        }
    }

    /// Check the seal, the header hash and the snapshot total
    pub fn verify(&self) -> Result<(), CheckpointError> {
        let computed = self.compute_integrity_hash();
        if computed != self.integrity_hash {
            return Err(CheckpointError::SealMismatch {
                height: self.height,
                stored: self.integrity_hash,
                computed,
            });
        }
        let computed = self.header().hash();
        if computed != self.block_hash {
            return Err(CheckpointError::HeaderMismatch {
                height: self.height,
                recorded: self.block_hash,
                computed,
            });
        }
        let snapshot = self.utxo_snapshot.total_value();
        if snapshot != self.total_supply {
            return Err(CheckpointError::SupplyMismatch {
                height: self.height,
                recorded: self.total_supply,
                snapshot,
            });
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and verify. A tampered checkpoint is an error, never a panic.
    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        let checkpoint: Self = serde_json::from_str(json)?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    /// Trusted starting point for a chain rebuilt from this checkpoint
    pub fn to_anchor(&self) -> Result<ChainAnchor, CheckpointError> {
        self.verify()?;
        Ok(ChainAnchor {
            header: self.header(),
            ledger: Ledger::from_snapshot(&self.utxo_snapshot)?,
            cumulative_work: self.cumulative_work,
            total_issued: self.total_issued,
            epoch_start: self.epoch_start,
        })
    }

    pub fn info(&self) -> CheckpointInfo {
        CheckpointInfo {
            height: self.height,
            block_hash: self.block_hash,
            timestamp: self.timestamp,
            created_at: self.created_at,
            utxo_count: self.utxo_snapshot.utxos.len(),
            total_supply: self.total_supply,
            integrity_hash: self.integrity_hash,
        }
    }
}

/// Summary of a retained checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub height: u64,
    pub block_hash: Hash,
    pub timestamp: u64,
    pub created_at: u64,
    pub utxo_count: usize,
    pub total_supply: Amount,
    pub integrity_hash: Hash,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockId;
    use crate::testutil::{grow, make_block, new_chain, params, spend_genesis, NOW};

    fn sample() -> (ChainState, Checkpoint) {
        let (mut chain, key, genesis) = new_chain();
        let tx = spend_genesis(&key, &genesis, "LNdest", 250_000, 500);
        let block = make_block(&chain, genesis.hash(), "LNminer", vec![tx]);
        chain.add_block(block.clone(), NOW).unwrap();
        grow(&mut chain, block.hash(), "LNminer", 2);
        let checkpoint = Checkpoint::capture(&chain, 42);
        (chain, checkpoint)
    }

    #[test]
    fn test_json_roundtrip_keeps_seal() {
        let (chain, checkpoint) = sample();
        checkpoint.verify().unwrap();
        assert_eq!(checkpoint.height, 3);
        assert_eq!(checkpoint.total_supply, chain.get_total_unspent_value());

        let restored = Checkpoint::from_json(&checkpoint.to_json().unwrap()).unwrap();
        assert_eq!(restored.integrity_hash, checkpoint.integrity_hash);
        assert_eq!(restored.compute_integrity_hash(), checkpoint.integrity_hash);
        assert_eq!(restored, checkpoint);
    }

    #[test]
    fn test_any_field_mutation_rejected() {
        let (_, checkpoint) = sample();
        let json: serde_json::Value = serde_json::from_str(&checkpoint.to_json().unwrap()).unwrap();

        for field in ["height", "timestamp", "difficulty", "nonce", "total_issued", "total_supply", "created_at", "epoch_start"] {
            let mut tampered = json.clone();
            let value = tampered[field].as_u64().unwrap();
            tampered[field] = serde_json::Value::from(value + 1);
            assert!(
                Checkpoint::from_json(&tampered.to_string()).is_err(),
                "mutating {field} went unnoticed"
            );
        }

        let mut tampered = json.clone();
        tampered["utxo_snapshot"]["utxos"][0][1]["amount"] = serde_json::Value::from(1u64);
        assert!(matches!(
            Checkpoint::from_json(&tampered.to_string()),
            Err(CheckpointError::SealMismatch { .. })
        ));

        assert!(matches!(
            Checkpoint::from_json("{not json"),
            Err(CheckpointError::Json(_))
        ));
    }

    #[test]
    fn test_resealed_forgery_fails_header_check() {
        let (_, mut checkpoint) = sample();
        checkpoint.merkle_root = Hash::zero();
        checkpoint.integrity_hash = checkpoint.compute_integrity_hash();
        assert!(matches!(
            checkpoint.verify(),
            Err(CheckpointError::HeaderMismatch { height: 3, .. })
        ));
    }

    #[test]
    fn test_anchor_rebuilds_ledger() {
        let (chain, checkpoint) = sample();
        let anchored = ChainState::from_anchor(checkpoint.to_anchor().unwrap(), params());

        assert_eq!(anchored.snapshot_digest(), chain.snapshot_digest());
        assert_eq!(anchored.tip_hash(), chain.tip_hash());
        assert_eq!(anchored.get_stats().total_issued, chain.get_stats().total_issued);
        assert!(anchored.get_block(BlockId::Height(2)).is_none());
    }
}
