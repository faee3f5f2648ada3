//! Chain fixtures shared by unit tests

use crate::chain::{ChainParams, ChainState, OrphanLimits};
use crate::consensus::{calculate_block_reward, meets_target, Block, BlockHeader, RetargetParams};
use crate::constants::PROTOCOL_VERSION;
use crate::crypto::{Address, Hash, PrivateKey};
use crate::validation::{OutPoint, Transaction, TxOutput};
use crate::Amount;

/// Local clock used when submitting fixture blocks
pub(crate) const NOW: u64 = 2_000_000_000;

pub(crate) const GENESIS_FUNDS: Amount = 1_000_000;

pub(crate) fn params() -> ChainParams {
    ChainParams {
        retarget: RetargetParams {
            interval: 1_000,
            target_block_time: 60,
        },
        max_future_drift: 7_200,
        verify_reorg_replay: true,
        orphans: OrphanLimits {
            max_blocks: 50,
            max_age_secs: 600,
            max_depth: 100,
        },
    }
}

/// Difficulty-1 genesis paying `GENESIS_FUNDS` to `owner`
pub(crate) fn genesis(owner: &Address) -> Block {
    let mut block = Block::new(
        BlockHeader {
            version: PROTOCOL_VERSION,
            index: 0,
            previous_hash: Hash::zero(),
            merkle_root: Hash::zero(),
            timestamp: 1_000,
            difficulty: 1,
            nonce: 0,
            miner_key: None,
        },
        vec![Transaction::coinbase(0, owner.clone(), GENESIS_FUNDS)],
    );
    block.header.merkle_root = block.compute_merkle_root();
    block
}

/// A valid child of `parent` paying `miner`, carrying `txs`
pub(crate) fn make_block(chain: &ChainState, parent: Hash, miner: &str, txs: Vec<Transaction>) -> Block {
    let ctx = chain.context_after(&parent).unwrap();
    let fees: Amount = txs.iter().map(|tx| tx.fee).sum();
    let reward = calculate_block_reward(ctx.height, ctx.total_issued);

    let mut transactions = vec![Transaction::coinbase(ctx.height, Address::new(miner), reward + fees)];
    transactions.extend(txs);
    let mut block = Block::new(
        BlockHeader {
            version: PROTOCOL_VERSION,
            index: ctx.height,
            previous_hash: parent,
            merkle_root: Hash::zero(),
            timestamp: ctx.parent_timestamp + 60,
            difficulty: ctx.expected_difficulty,
            nonce: 0,
            miner_key: None,
        },
        transactions,
    );
    block.header.merkle_root = block.compute_merkle_root();
    while !meets_target(&block.hash(), block.header.difficulty) {
        block.header.nonce += 1;
    }
    block
}

/// Build and submit `count` blocks on top of `parent`, returning them
pub(crate) fn grow(chain: &mut ChainState, mut parent: Hash, miner: &str, count: usize) -> Vec<Block> {
    let mut blocks = Vec::new();
    for _ in 0..count {
        let block = make_block(chain, parent, miner, vec![]);
        parent = block.hash();
        chain.add_block(block.clone(), NOW).unwrap();
        blocks.push(block);
    }
    blocks
}

/// Fresh chain whose genesis funds the returned key
pub(crate) fn new_chain() -> (ChainState, PrivateKey, Block) {
    let key = PrivateKey::generate();
    let genesis = genesis(&key.public_key().to_address());
    let chain = ChainState::new(genesis.clone(), params()).unwrap();
    (chain, key, genesis)
}

/// Spend the genesis allocation: `amount` to `to`, the rest back as change
pub(crate) fn spend_genesis(key: &PrivateKey, genesis: &Block, to: &str, amount: Amount, fee: Amount) -> Transaction {
    let funding = genesis.transactions[0].txid();
    let change = GENESIS_FUNDS - amount - fee;
    Transaction::transfer(
        key.public_key(),
        vec![OutPoint::new(funding, 0)],
        vec![
            TxOutput::new(Address::new(to), amount),
            TxOutput::new(key.public_key().to_address(), change),
        ],
        fee,
        0,
    )
    .signed(key)
}
