//! Block structure
//!
//! Defines the immutable block and block header structures.

use serde::{Deserialize, Serialize};

use crate::crypto::{
    build_merkle_proof, compute_merkle_root, sha256, Hash, MerkleProof, PrivateKey, PublicKey,
    SchnorrSignature,
};
use crate::validation::Transaction;

/// Block header containing all metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    /// Protocol version
    pub version: u32,
    /// Height of this block (genesis is 0)
    pub index: u64,
    /// Hash of the previous block
    pub previous_hash: Hash,
    /// Merkle root of all transactions, in block order
    pub merkle_root: Hash,
    /// Block timestamp (seconds since Unix epoch)
    pub timestamp: u64,
    /// Linear work factor, target = 2^256 / difficulty
    pub difficulty: u64,
    /// Nonce used for PoW
    pub nonce: u64,
    /// Key of the miner that signs the block, if any
    pub miner_key: Option<PublicKey>,
}

impl BlockHeader {
    /// Serialize the header for hashing
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 8 + 32 + 32 + 8 + 8 + 8 + 33);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.extend_from_slice(&self.index.to_le_bytes());
        bytes.extend_from_slice(&self.previous_hash.0);
        bytes.extend_from_slice(&self.merkle_root.0);
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.difficulty.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());
        match &self.miner_key {
            Some(key) => {
                bytes.push(1);
                bytes.extend_from_slice(&key.0);
            }
            None => bytes.push(0),
        }
        bytes
    }

    /// Calculate the hash of this header
    pub fn hash(&self) -> Hash {
        sha256(&self.to_bytes())
    }
}

/// A complete block containing header and transactions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// List of transactions in this block, coinbase first
    pub transactions: Vec<Transaction>,
    /// Miner signature over the header hash, present iff `miner_key` is
    pub signature: Option<SchnorrSignature>,
}

impl Block {
    /// Create a new unsigned block
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
            signature: None,
        }
    }

    /// Get the block hash
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.index
    }

    pub fn previous_hash(&self) -> &Hash {
        &self.header.previous_hash
    }

    /// Check if this is the genesis block
    pub fn is_genesis(&self) -> bool {
        self.header.index == 0 && self.header.previous_hash.is_zero()
    }

    /// The coinbase, if the block starts with one
    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn txids(&self) -> Vec<Hash> {
        self.transactions.iter().map(|tx| tx.txid()).collect()
    }

    /// Merkle root over the transactions as currently ordered
    pub fn compute_merkle_root(&self) -> Hash {
        compute_merkle_root(&self.txids())
    }

    /// Proof that `txid` is in this block
    pub fn merkle_proof(&self, txid: &Hash) -> Option<MerkleProof> {
        let txids = self.txids();
        let position = txids.iter().position(|id| id == txid)?;
        build_merkle_proof(&txids, position)
    }

    /// Sign the header hash. The header must already name `key` as miner.
    pub fn sign(&mut self, key: &PrivateKey) {
        self.signature = Some(key.sign(&self.hash()));
    }

    /// Unsigned blocks are valid only without a miner key
    pub fn verify_signature(&self) -> bool {
        match (&self.header.miner_key, &self.signature) {
            (None, None) => true,
            (Some(key), Some(signature)) => key.verify(&self.hash(), signature),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Address;

    fn header(index: u64, miner_key: Option<PublicKey>) -> BlockHeader {
        BlockHeader {
            version: 1,
            index,
            previous_hash: Hash::zero(),
            merkle_root: Hash::zero(),
            timestamp: 1234567890,
            difficulty: 1,
            nonce: 0,
            miner_key,
        }
    }

    #[test]
    fn test_block_header_serialization() {
        let bytes = header(0, None).to_bytes();
        assert_eq!(bytes.len(), 4 + 8 + 32 + 32 + 8 + 8 + 8 + 1);
    }

    #[test]
    fn test_hash_covers_nonce() {
        let mut h = header(3, None);
        let before = h.hash();
        h.nonce += 1;
        assert_ne!(before, h.hash());
    }

    #[test]
    fn test_genesis_block_detection() {
        assert!(Block::new(header(0, None), vec![]).is_genesis());
        assert!(!Block::new(header(1, None), vec![]).is_genesis());
    }

    #[test]
    fn test_merkle_proof_for_each_tx() {
        let txs: Vec<Transaction> = (0..5)
            .map(|h| Transaction::coinbase(h, Address::new("LNminer"), 10 + h))
            .collect();
        let mut block = Block::new(header(1, None), txs);
        block.header.merkle_root = block.compute_merkle_root();

        for txid in block.txids() {
            let proof = block.merkle_proof(&txid).unwrap();
            assert!(proof.verify(&txid, &block.header.merkle_root));
        }
        assert!(block.merkle_proof(&Hash::zero()).is_none());
    }

    #[test]
    fn test_miner_signature() {
        let key = PrivateKey::generate();
        let mut block = Block::new(header(1, Some(key.public_key())), vec![]);
        assert!(!block.verify_signature());

        block.sign(&key);
        assert!(block.verify_signature());

        block.header.nonce += 1;
        assert!(!block.verify_signature());
    }
}
