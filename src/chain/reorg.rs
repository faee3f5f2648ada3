//! Chain reorganization
//!
//! All work happens on a scratch copy of the ledger. The live ledger and the
//! canonical vector are only replaced once every challenger block has
//! validated and the result matches a fresh replay.

use tracing::{info, warn};

use crate::chain::{ChainError, ChainState, ChainUpdate};
use crate::consensus::validate_block;
use crate::crypto::Hash;

impl ChainState {
    /// Make the branch ending at arena position `new_tip` canonical.
    /// Returns the fork height. On error nothing has changed except that a
    /// failing challenger block is marked invalid.
    pub(super) fn reorganize(&mut self, new_tip: usize, update: &mut ChainUpdate) -> Result<u64, ChainError> {
        let mut branch = Vec::new();
        let mut cursor = new_tip;
        while !self.is_canonical(cursor) {
            if self.entries[cursor].invalid {
                return Err(ChainError::InvalidAncestor(self.entries[new_tip].hash));
            }
            branch.push(cursor);
            match self.entries[cursor].parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        branch.reverse();
        let fork_height = self.entries[cursor].height;

        if let Some(checkpoint) = self.finalized_height() {
            if fork_height <= checkpoint {
                return Err(ChainError::ForkBeforeCheckpoint {
                    fork_height,
                    checkpoint,
                });
            }
        }

        let challenger = self.entries[new_tip].cumulative_work;
        let canonical = self.tip_entry().cumulative_work;
        if challenger <= canonical {
            return Err(ChainError::InsufficientWork {
                challenger,
                canonical,
            });
        }

        let fork_pos = (fork_height - self.base_height) as usize;
        let mut scratch = self.ledger.clone();
        for &idx in self.canonical[fork_pos + 1..].iter().rev() {
            let entry = &self.entries[idx];
            let undo = entry.undo.as_ref().ok_or(ChainError::MissingUndo(entry.hash))?;
            scratch.revert_block(&entry.block, undo)?;
        }

        let mut undos = Vec::with_capacity(branch.len());
        for &idx in &branch {
            let parent = self.entries[idx].parent.unwrap_or(cursor);
            let ctx = self.context_for(parent);
            let entry = &self.entries[idx];
            if let Err(source) = validate_block(&entry.block, &ctx, &scratch) {
                let (hash, height) = (entry.hash, entry.height);
                warn!(height, hash = %hash.short(), error = %source, "challenger block invalid, reorg aborted");
                self.entries[idx].invalid = true;
                return Err(ChainError::Invalid {
                    hash,
                    height,
                    source,
                });
            }
            undos.push(scratch.apply_block(&entry.block)?);
        }

        if self.params.verify_reorg_replay {
            let expected = self.replay_digest(fork_pos, &branch)?;
            let got = scratch.snapshot_digest();
            if expected != got {
                warn!(%expected, %got, "reorg result differs from replay, aborted");
                return Err(ChainError::ReplayMismatch { expected, got });
            }
        }

        let disconnected = self.canonical.split_off(fork_pos + 1);
        for &idx in disconnected.iter().rev() {
            self.unindex_transactions(idx);
            update.record_disconnect(self.entries[idx].block.clone());
        }
        for (&idx, undo) in branch.iter().zip(undos) {
            self.entries[idx].undo = Some(undo);
            self.canonical.push(idx);
            self.index_transactions(idx);
            update.connected.push(self.entries[idx].block.clone());
        }
        self.ledger = scratch;

        info!(
            fork_height,
            disconnected = disconnected.len(),
            connected = branch.len(),
            tip = %self.tip_hash().short(),
            work = challenger,
            "chain reorganized"
        );
        Ok(fork_height)
    }

    /// Digest of the ledger obtained by applying, from the base snapshot,
    /// the canonical blocks up to `fork_pos` and then `branch`
    fn replay_digest(&self, fork_pos: usize, branch: &[usize]) -> Result<Hash, ChainError> {
        let mut ledger = self.base_ledger.clone();
        let prefix = self.canonical[1..=fork_pos].iter();
        for &idx in prefix.chain(branch.iter()) {
            ledger.apply_block(&self.entries[idx].block)?;
        }
        Ok(ledger.snapshot_digest())
    }
}
