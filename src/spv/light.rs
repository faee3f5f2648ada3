//! Header-only light client
//!
//! Starts from one trusted header (genesis or a checkpointed block) and
//! accepts each following header only if it links to the current tip, has
//! the next index and carries valid proof of work.

use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::consensus::{meets_target, BlockHeader};
use crate::crypto::{Hash, MerkleProof};
use crate::spv::{check_inclusion, InclusionResult, TransactionProof};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("header links to {got}, tip is {expected}")]
    BadLinkage { expected: Hash, got: Hash },
    #[error("header index {got}, expected {expected}")]
    BadIndex { expected: u64, got: u64 },
    #[error("header {hash} does not meet difficulty {difficulty}")]
    InsufficientWork { hash: Hash, difficulty: u64 },
}

#[derive(Debug, Clone)]
pub struct LightClient {
    headers: Vec<BlockHeader>,
    hashes: Vec<Hash>,
    by_hash: HashMap<Hash, u64>,
    base_height: u64,
}

impl LightClient {
    /// Trust `header` as the starting point
    pub fn new(header: BlockHeader) -> Self {
        let hash = header.hash();
        let base_height = header.index;
        Self {
            headers: vec![header],
            hashes: vec![hash],
            by_hash: HashMap::from([(hash, base_height)]),
            base_height,
        }
    }

    /// Append the next header. A rejected header leaves the client untouched.
    pub fn add_header(&mut self, header: BlockHeader) -> Result<u64, HeaderError> {
        let tip_hash = self.tip_hash();
        if header.previous_hash != tip_hash {
            return Err(HeaderError::BadLinkage {
                expected: tip_hash,
                got: header.previous_hash,
            });
        }
        let expected = self.height() + 1;
        if header.index != expected {
            return Err(HeaderError::BadIndex {
                expected,
                got: header.index,
            });
        }
        let hash = header.hash();
        if !meets_target(&hash, header.difficulty) {
            return Err(HeaderError::InsufficientWork {
                hash,
                difficulty: header.difficulty,
            });
        }

        debug!(height = expected, hash = %hash.short(), "header accepted");
        self.by_hash.insert(hash, expected);
        self.hashes.push(hash);
        self.headers.push(header);
        Ok(expected)
    }

    /// Append headers in order, stopping at the first rejection
    pub fn add_headers(&mut self, headers: impl IntoIterator<Item = BlockHeader>) -> Result<usize, HeaderError> {
        let mut added = 0;
        for header in headers {
            self.add_header(header)?;
            added += 1;
        }
        Ok(added)
    }

    pub fn height(&self) -> u64 {
        self.base_height + self.headers.len() as u64 - 1
    }

    pub fn tip_hash(&self) -> Hash {
        self.hashes.last().copied().unwrap_or_else(Hash::zero)
    }

    pub fn header_at(&self, height: u64) -> Option<&BlockHeader> {
        let offset = height.checked_sub(self.base_height)?;
        self.headers.get(offset as usize)
    }

    pub fn height_of(&self, hash: &Hash) -> Option<u64> {
        self.by_hash.get(hash).copied()
    }

    /// Check that `txid` is in the block at `block_height` and that the
    /// block has at least `min_confirmations` confirmations
    pub fn verify_transaction_inclusion(
        &self,
        txid: &Hash,
        proof: &MerkleProof,
        block_height: u64,
        min_confirmations: u64,
    ) -> InclusionResult {
        match self.header_at(block_height) {
            Some(header) => check_inclusion(txid, proof, header, self.height(), min_confirmations),
            None => InclusionResult::UnknownBlock { height: block_height },
        }
    }

    /// Check a served proof against this client's own headers
    pub fn verify_transaction_proof(&self, proof: &TransactionProof, min_confirmations: u64) -> InclusionResult {
        match self.height_of(&proof.block_hash) {
            Some(height) if height == proof.block_height => {
                self.verify_transaction_inclusion(&proof.txid, &proof.merkle_proof, height, min_confirmations)
            }
            Some(_) => InclusionResult::BlockMismatch {
                height: proof.block_height,
            },
            None if self.header_at(proof.block_height).is_some() => InclusionResult::BlockMismatch {
                height: proof.block_height,
            },
            None => InclusionResult::UnknownBlock {
                height: proof.block_height,
            },
        }
    }
}
