//! Block validation
//!
//! Pure functions of (candidate block, chain state at its parent): running
//! them twice yields the same verdict and touches nothing.

use thiserror::Error;

use crate::consensus::{expected_coinbase_value, calculate_block_reward, meets_target, Block, BlockHeader};
use crate::constants::{MAX_BLOCK_TRANSACTIONS, PROTOCOL_VERSION};
use crate::crypto::Hash;
use crate::storage::{Ledger, LedgerOverlay};
use crate::validation::{TxError, TxKind};
use crate::Amount;

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unsupported block version {0}")]
    UnsupportedVersion(u32),
    #[error("previous hash {got} does not match parent {expected}")]
    InvalidPrevHash { expected: Hash, got: Hash },
    #[error("block index {got}, expected {expected}")]
    InvalidIndex { expected: u64, got: u64 },
    #[error("difficulty {got}, expected {expected}")]
    InvalidDifficulty { expected: u64, got: u64 },
    #[error("timestamp {got} is not after parent timestamp {parent}")]
    InvalidTimestamp { parent: u64, got: u64 },
    #[error("invalid proof of work")]
    InvalidPoW,
    #[error("invalid merkle root")]
    InvalidMerkleRoot,
    #[error("invalid miner signature")]
    InvalidSignature,
    #[error("block has no transactions")]
    Empty,
    #[error("block has {count} transactions, limit is {max}")]
    TooManyTransactions { count: usize, max: usize },
    #[error("first transaction is not a coinbase")]
    MissingCoinbase,
    #[error("coinbase height {got}, expected {expected}")]
    CoinbaseHeight { expected: u64, got: u64 },
    #[error("extra coinbase at position {0}")]
    UnexpectedCoinbase(usize),
    #[error("transaction {index} invalid: {source}")]
    InvalidTransaction {
        index: usize,
        #[source]
        source: TxError,
    },
    #[error("coinbase pays {got}, reward plus fees is {expected}")]
    InvalidBlockReward { expected: Amount, got: Amount },
    #[error("fee total overflows")]
    FeeOverflow,
}

/// Chain state at the candidate's parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    pub parent_hash: Hash,
    pub parent_timestamp: u64,
    /// Height the candidate must carry
    pub height: u64,
    pub expected_difficulty: u64,
    /// Mined supply up to and including the parent
    pub total_issued: Amount,
}

/// What a valid block mints and collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSummary {
    pub reward: Amount,
    pub fees: Amount,
}

/// Validate proof of work
pub fn validate_pow(header: &BlockHeader) -> Result<(), ValidationError> {
    if !meets_target(&header.hash(), header.difficulty) {
        return Err(ValidationError::InvalidPoW);
    }
    Ok(())
}

/// Validate merkle root matches transactions
pub fn validate_merkle_root(block: &Block) -> Result<(), ValidationError> {
    if block.compute_merkle_root() != block.header.merkle_root {
        return Err(ValidationError::InvalidMerkleRoot);
    }
    Ok(())
}

/// Header checks that need only the parent: linkage, index, difficulty,
/// timestamp ordering, proof of work
pub fn validate_header(header: &BlockHeader, ctx: &BlockContext) -> Result<(), ValidationError> {
    if header.version != PROTOCOL_VERSION {
        return Err(ValidationError::UnsupportedVersion(header.version));
    }
    if header.previous_hash != ctx.parent_hash {
        return Err(ValidationError::InvalidPrevHash {
            expected: ctx.parent_hash,
            got: header.previous_hash,
        });
    }
    if header.index != ctx.height {
        return Err(ValidationError::InvalidIndex {
            expected: ctx.height,
            got: header.index,
        });
    }
    if header.difficulty != ctx.expected_difficulty {
        return Err(ValidationError::InvalidDifficulty {
            expected: ctx.expected_difficulty,
            got: header.difficulty,
        });
    }
    if header.timestamp <= ctx.parent_timestamp {
        return Err(ValidationError::InvalidTimestamp {
            parent: ctx.parent_timestamp,
            got: header.timestamp,
        });
    }
    validate_pow(header)
}

/// Validate a block against the ledger as of its parent
pub fn validate_block(
    block: &Block,
    ctx: &BlockContext,
    ledger: &Ledger,
) -> Result<BlockSummary, ValidationError> {
    validate_header(&block.header, ctx)?;

    if block.transactions.is_empty() {
        return Err(ValidationError::Empty);
    }
    if block.transactions.len() > MAX_BLOCK_TRANSACTIONS {
        return Err(ValidationError::TooManyTransactions {
            count: block.transactions.len(),
            max: MAX_BLOCK_TRANSACTIONS,
        });
    }
    validate_merkle_root(block)?;
    if !block.verify_signature() {
        return Err(ValidationError::InvalidSignature);
    }

    let coinbase = block.coinbase().ok_or(ValidationError::MissingCoinbase)?;
    coinbase
        .check_structure()
        .map_err(|source| ValidationError::InvalidTransaction { index: 0, source })?;
    if let TxKind::Coinbase { height } = coinbase.kind {
        if height != ctx.height {
            return Err(ValidationError::CoinbaseHeight {
                expected: ctx.height,
                got: height,
            });
        }
    }

    let mut overlay = LedgerOverlay::new(ledger);
    let mut fees: Amount = 0;
    for (index, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(ValidationError::UnexpectedCoinbase(index));
        }
        let fee = tx
            .validate_against(&overlay)
            .map_err(|source| ValidationError::InvalidTransaction { index, source })?;
        fees = fees.checked_add(fee).ok_or(ValidationError::FeeOverflow)?;
        overlay.apply(tx);
    }

    let reward = calculate_block_reward(ctx.height, ctx.total_issued);
    let expected = expected_coinbase_value(ctx.height, ctx.total_issued, fees)
        .ok_or(ValidationError::FeeOverflow)?;
    if coinbase.amount != expected {
        return Err(ValidationError::InvalidBlockReward {
            expected,
            got: coinbase.amount,
        });
    }

    Ok(BlockSummary { reward, fees })
}
