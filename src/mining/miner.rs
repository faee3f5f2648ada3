//! Block miner implementation
//!
//! Assembles candidate blocks against a ledger overlay and performs PoW.
//! The search itself never holds a chain lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::chain::ChainState;
use crate::consensus::{calculate_block_reward, meets_target, Block, BlockHeader};
use crate::constants::{MAX_BLOCK_TRANSACTIONS, PROTOCOL_VERSION};
use crate::crypto::{Address, Hash, PrivateKey};
use crate::storage::LedgerOverlay;
use crate::validation::Transaction;
use crate::{unix_now, Amount};

/// How often the search loop polls the stop signal
const STOP_CHECK_INTERVAL: u64 = 1 << 12;

/// Mining result
#[derive(Debug)]
pub enum MiningResult {
    /// Successfully mined a block
    Success(Block),
    /// Mining was interrupted
    Interrupted,
    /// The tip moved away from the template's parent
    Stale { mined_on: Hash },
}

/// Block miner
#[derive(Debug, Clone)]
pub struct Miner {
    reward_address: Address,
    /// Signs mined blocks when set
    key: Option<PrivateKey>,
    /// First nonce tried, so parallel workers search disjoint ranges
    start_nonce: u64,
    stop_signal: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(reward_address: Address) -> Self {
        Self {
            reward_address,
            key: None,
            start_nonce: 0,
            stop_signal: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Name `key` as miner in every header and sign mined blocks with it
    pub fn with_key(mut self, key: PrivateKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_start_nonce(mut self, nonce: u64) -> Self {
        self.start_nonce = nonce;
        self
    }

    /// Get a stop signal handle
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.stop_signal.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    /// Assemble a candidate extending the tip of `chain`
    pub fn assemble_block(&self, chain: &ChainState, candidates: Vec<Transaction>) -> Block {
        self.assemble_block_at(chain, candidates, unix_now())
    }

    /// Assemble a candidate from `candidates`, best first.
    ///
    /// Each transaction must validate against the ledger plus everything
    /// already selected. A transaction that depends on one listed after it
    /// is retried on the next pass, so parents and lower nonces are never
    /// dropped just because they pay less.
    pub fn assemble_block_at(&self, chain: &ChainState, candidates: Vec<Transaction>, now: u64) -> Block {
        let ctx = chain.next_block_context();
        let mut overlay = LedgerOverlay::new(chain.ledger());
        let mut selected = Vec::new();
        let mut fees: Amount = 0;
        let capacity = MAX_BLOCK_TRANSACTIONS - 1;

        let mut remaining = candidates;
        while selected.len() < capacity && !remaining.is_empty() {
            let before = remaining.len();
            let mut deferred = Vec::new();
            for tx in remaining {
                if selected.len() >= capacity {
                    break;
                }
                match tx.validate_against(&overlay) {
                    Ok(fee) => match fees.checked_add(fee) {
                        Some(total) => {
                            fees = total;
                            overlay.apply(&tx);
                            selected.push(tx);
                        }
                        None => debug!(txid = %tx.txid().short(), "fee total overflows, skipped"),
                    },
                    Err(_) => deferred.push(tx),
                }
            }
            if deferred.len() == before {
                break;
            }
            remaining = deferred;
        }

        let reward = calculate_block_reward(ctx.height, ctx.total_issued);
        let mut transactions = vec![Transaction::coinbase(
            ctx.height,
            self.reward_address.clone(),
            reward.saturating_add(fees),
        )];
        transactions.extend(selected);

        let mut block = Block::new(
            BlockHeader {
                version: PROTOCOL_VERSION,
                index: ctx.height,
                previous_hash: ctx.parent_hash,
                merkle_root: Hash::zero(),
                timestamp: now.max(ctx.parent_timestamp + 1),
                difficulty: ctx.expected_difficulty,
                nonce: self.start_nonce,
                miner_key: self.key.as_ref().map(PrivateKey::public_key),
            },
            transactions,
        );
        block.header.merkle_root = block.compute_merkle_root();
        debug!(
            height = ctx.height,
            txs = block.transactions.len() - 1,
            fees,
            "assembled block template"
        );
        block
    }

    /// Mine a block (find valid nonce)
    ///
    /// Increments the nonce until the header meets its target or the stop
    /// signal is raised. Signs the found block when a key is set.
    pub fn mine_block(&self, block: Block) -> MiningResult {
        self.mine_until_stale(block, || false)
    }

    /// Like [`Miner::mine_block`], also giving up once `is_stale` reports
    /// that the template no longer extends the tip
    pub fn mine_until_stale(&self, mut block: Block, is_stale: impl Fn() -> bool) -> MiningResult {
        let mut iterations = 0u64;
        loop {
            if iterations % STOP_CHECK_INTERVAL == 0 {
                if self.is_stopped() {
                    return MiningResult::Interrupted;
                }
                if is_stale() {
                    return MiningResult::Stale {
                        mined_on: block.header.previous_hash,
                    };
                }
            }
            if meets_target(&block.hash(), block.header.difficulty) {
                if let Some(key) = &self.key {
                    block.sign(key);
                }
                debug!(height = block.height(), iterations, "found block");
                return MiningResult::Success(block);
            }

            block.header.nonce = block.header.nonce.wrapping_add(1);
            iterations += 1;
            // nonce space exhausted, move the timestamp instead
            if block.header.nonce == self.start_nonce {
                block.header.timestamp += 1;
            }
        }
    }
}
