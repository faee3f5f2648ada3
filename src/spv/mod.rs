//! SPV module - header-only verification and proof serving

mod light;
mod service;

pub use light::*;
pub use service::*;

use serde::{Deserialize, Serialize};

use crate::consensus::BlockHeader;
use crate::crypto::{verify_merkle_proof, Hash, MerkleProof};

/// Everything a light client needs to check one transaction's inclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionProof {
    pub txid: Hash,
    pub block_hash: Hash,
    pub block_height: u64,
    pub header: BlockHeader,
    pub merkle_proof: MerkleProof,
}

/// Verdict of an inclusion check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InclusionResult {
    Verified { confirmations: u64 },
    /// Proof is valid but the block is not buried deep enough yet
    InsufficientConfirmations {
        confirmations: u64,
        required: u64,
        shortfall: u64,
    },
    /// No header is known at this height
    UnknownBlock { height: u64 },
    /// The proof names a block other than the one known at its height
    BlockMismatch { height: u64 },
    InvalidProof,
}

impl InclusionResult {
    pub fn is_verified(&self) -> bool {
        matches!(self, InclusionResult::Verified { .. })
    }
}

/// Check a merkle path against a known header and count confirmations
/// from `tip_height`
pub fn check_inclusion(
    txid: &Hash,
    proof: &MerkleProof,
    header: &BlockHeader,
    tip_height: u64,
    min_confirmations: u64,
) -> InclusionResult {
    if !verify_merkle_proof(txid, proof, &header.merkle_root) {
        return InclusionResult::InvalidProof;
    }
    let confirmations = (tip_height + 1).saturating_sub(header.index);
    if confirmations >= min_confirmations {
        InclusionResult::Verified { confirmations }
    } else {
        InclusionResult::InsufficientConfirmations {
            confirmations,
            required: min_confirmations,
            shortfall: min_confirmations - confirmations,
        }
    }
}
