//! Proof serving for light clients, backed by the full node's chain

use parking_lot::RwLock;
use std::sync::Arc;

use crate::chain::{BlockId, ChainState};
use crate::consensus::BlockHeader;
use crate::crypto::Hash;
use crate::spv::{check_inclusion, InclusionResult, TransactionProof};

#[derive(Debug, Clone)]
pub struct SpvService {
    chain: Arc<RwLock<ChainState>>,
}

impl SpvService {
    pub fn new(chain: Arc<RwLock<ChainState>>) -> Self {
        Self { chain }
    }

    /// The last `count` canonical headers, oldest first
    pub fn get_recent_headers(&self, count: usize) -> Vec<BlockHeader> {
        let chain = self.chain.read();
        let available = (chain.height() - chain.base_height() + 1) as usize;
        let count = count.min(available);
        let from = chain.height() + 1 - count as u64;
        chain.header_range(from, count)
    }

    /// Inclusion proof for a confirmed transaction
    pub fn get_transaction_proof(&self, txid: &Hash) -> Option<TransactionProof> {
        let chain = self.chain.read();
        let location = chain.find_transaction(txid)?;
        let block = chain.get_block(BlockId::Height(location.height))?;
        Some(TransactionProof {
            txid: *txid,
            block_hash: location.block_hash,
            block_height: location.height,
            header: block.header.clone(),
            merkle_proof: block.merkle_proof(txid)?,
        })
    }

    /// Check a proof against the canonical chain
    pub fn verify_proof(&self, txid: &Hash, proof: &TransactionProof, min_confirmations: u64) -> InclusionResult {
        if proof.txid != *txid || proof.header.hash() != proof.block_hash {
            return InclusionResult::InvalidProof;
        }
        let chain = self.chain.read();
        let Some(block) = chain.get_block(BlockId::Height(proof.block_height)) else {
            return InclusionResult::UnknownBlock {
                height: proof.block_height,
            };
        };
        if block.hash() != proof.block_hash {
            return InclusionResult::BlockMismatch {
                height: proof.block_height,
            };
        }
        check_inclusion(
            txid,
            &proof.merkle_proof,
            &block.header,
            chain.height(),
            min_confirmations,
        )
    }
}
