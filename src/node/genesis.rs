//! Genesis block generation
//!
//! The genesis block is a pure function of the configuration, so every
//! node configured alike derives the same block byte for byte.

use crate::config::NodeConfig;
use crate::consensus::{Block, BlockHeader};
use crate::constants::PROTOCOL_VERSION;
use crate::crypto::{Address, Hash};
use crate::validation::Transaction;

/// Create the genesis block
pub fn create_genesis_block(config: &NodeConfig) -> Block {
    let allocation = Transaction::coinbase(
        0,
        Address::new(config.genesis.allocation_address.as_str()),
        config.genesis.allocation,
    );
    let mut block = Block::new(
        BlockHeader {
            version: PROTOCOL_VERSION,
            index: 0,
            previous_hash: Hash::zero(),
            merkle_root: Hash::zero(),
            timestamp: config.genesis.timestamp,
            difficulty: config.chain.initial_difficulty,
            nonce: 0,
            miner_key: None,
        },
        vec![allocation],
    );
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// Genesis block statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenesisInfo {
    pub hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u64,
    pub difficulty: u64,
    pub allocation: u64,
}

impl GenesisInfo {
    pub fn new(config: &NodeConfig) -> Self {
        let genesis = create_genesis_block(config);
        Self {
            hash: genesis.hash(),
            merkle_root: genesis.header.merkle_root,
            timestamp: genesis.header.timestamp,
            difficulty: genesis.header.difficulty,
            allocation: config.genesis.allocation,
        }
    }
}
