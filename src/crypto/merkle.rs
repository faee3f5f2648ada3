//! Merkle tree implementation
//!
//! Pairwise SHA-256 over the ordered transaction ids of a block. Transaction
//! order is preserved; an odd level duplicates its last hash before pairing.

use serde::{Deserialize, Serialize};

use super::{sha256_pair, Hash};

/// Which side of the running hash a proof sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiblingPosition {
    /// `hash(sibling || current)`
    Left,
    /// `hash(current || sibling)`
    Right,
}

/// One step of a merkle path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Hash,
    pub position: SiblingPosition,
}

/// Merkle proof for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the transaction in the block
    pub index: usize,
    /// Sibling hashes from leaf to root
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Fold the proof over `txid` to reconstruct a root
    pub fn compute_root(&self, txid: &Hash) -> Hash {
        self.steps.iter().fold(*txid, |current, step| match step.position {
            SiblingPosition::Right => sha256_pair(&current, &step.sibling),
            SiblingPosition::Left => sha256_pair(&step.sibling, &current),
        })
    }

    /// Verify this proof against a root hash
    pub fn verify(&self, txid: &Hash, root: &Hash) -> bool {
        self.compute_root(txid) == *root
    }
}

/// Replay `proof` against `txid` and compare with `merkle_root`
pub fn verify_merkle_proof(txid: &Hash, proof: &MerkleProof, merkle_root: &Hash) -> bool {
    proof.verify(txid, merkle_root)
}

/// Compute the merkle root of a list of hashes
///
/// If the list is empty, returns zero hash.
/// If odd number of elements, duplicates the last element.
pub fn compute_merkle_root(hashes: &[Hash]) -> Hash {
    let Some(first) = hashes.first() else {
        return Hash::zero();
    };
    if hashes.len() == 1 {
        return *first;
    }

    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        level = next_level(&mut level);
    }
    level[0]
}

/// Build a merkle proof for a transaction at given index
pub fn build_merkle_proof(hashes: &[Hash], index: usize) -> Option<MerkleProof> {
    if index >= hashes.len() {
        return None;
    }

    let mut level: Vec<Hash> = hashes.to_vec();
    let mut position = index;
    let mut steps = Vec::new();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(level[level.len() - 1]);
        }

        let step = if position % 2 == 0 {
            ProofStep {
                sibling: level[position + 1],
                position: SiblingPosition::Right,
            }
        } else {
            ProofStep {
                sibling: level[position - 1],
                position: SiblingPosition::Left,
            }
        };
        steps.push(step);

        level = next_level(&mut level);
        position /= 2;
    }

    Some(MerkleProof { index, steps })
}

fn next_level(level: &mut Vec<Hash>) -> Vec<Hash> {
    if level.len() % 2 == 1 {
        level.push(level[level.len() - 1]);
    }
    level
        .chunks(2)
        .map(|pair| sha256_pair(&pair[0], &pair[1]))
        .collect()
}
