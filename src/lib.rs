//! Ledger node core library
//!
//! Full-node ledger engine for a proof-of-work UTXO chain: the canonical
//! chain, the unspent-output ledger, the pending-transaction pool, a block
//! index over durable storage, sealed checkpoints with startup recovery, and
//! merkle-proof services for light clients.

pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod mempool;
pub mod mining;
pub mod node;
pub mod spv;
pub mod storage;
pub mod validation;

#[cfg(test)]
mod testutil;

/// Amount in base units
pub type Amount = u64;

/// Current Unix time in seconds
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Protocol constants - HARD-CODED, NEVER CONFIGURABLE
pub mod constants {
    use super::Amount;

    /// Base units per coin (8 decimal places)
    pub const COIN: Amount = 100_000_000;

    /// Total supply (in base units)
    pub const TOTAL_SUPPLY: Amount = 100_000_000 * COIN;

    /// Genesis allocation (in base units)
    pub const GENESIS_ALLOCATION: Amount = 10_000_000 * COIN;

    /// Public issuance through mining (in base units)
    pub const PUBLIC_ISSUANCE: Amount = 90_000_000 * COIN;

    /// Prefix of every encoded address
    pub const ADDRESS_PREFIX: &str = "LN";

    /// Current block and transaction version
    pub const PROTOCOL_VERSION: u32 = 1;

    /// Largest serialized transaction accepted anywhere
    pub const MAX_TX_SIZE: usize = 100_000;

    /// Largest number of transactions in one block (coinbase included)
    pub const MAX_BLOCK_TRANSACTIONS: usize = 5_000;

    /// Genesis timestamp (Unix seconds)
    pub const GENESIS_TIMESTAMP: u64 = 1_767_225_600; // 2026-01-01
}
