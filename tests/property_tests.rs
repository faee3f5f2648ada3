//! Property-based and adversarial tests for the ledger node
//!
//! These tests verify invariants hold under random inputs and attack scenarios.

use ledger_node::chain::{ChainError, ChainParams, ChainState};
use ledger_node::config::NodeConfig;
use ledger_node::consensus::{
    calculate_block_reward, calculate_next_difficulty, meets_target, Block, BlockHeader,
    RetargetParams, ValidationError,
};
use ledger_node::constants::{GENESIS_ALLOCATION, PUBLIC_ISSUANCE, TOTAL_SUPPLY};
use ledger_node::crypto::{
    build_merkle_proof, compute_merkle_root, hash_bytes, sha256, Address, Hash, PrivateKey,
};
use ledger_node::mining::{Miner, MiningResult};
use ledger_node::node::create_genesis_block;
use ledger_node::storage::Ledger;
use ledger_node::unix_now;
use ledger_node::validation::{OutPoint, Transaction, TxOutput};
use proptest::prelude::*;

const RETARGET: RetargetParams = RetargetParams {
    interval: 10,
    target_block_time: 60,
};

fn leaves(seed: u8, count: usize) -> Vec<Hash> {
    (0..count as u32)
        .map(|i| hash_bytes(&[&[seed][..], &i.to_le_bytes()].concat()))
        .collect()
}

fn header(timestamp: u64, difficulty: u64, nonce: u64) -> BlockHeader {
    BlockHeader {
        version: 1,
        index: 7,
        previous_hash: hash_bytes(b"parent"),
        merkle_root: hash_bytes(b"root"),
        timestamp,
        difficulty,
        nonce,
        miner_key: None,
    }
}

// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================

proptest! {
    /// Supply invariant: total issued never exceeds PUBLIC_ISSUANCE
    #[test]
    fn prop_supply_never_exceeds_limit(
        issued_so_far in 0u64..=PUBLIC_ISSUANCE,
        height in 1u64..10_000_000u64
    ) {
        let reward = calculate_block_reward(height, issued_so_far);
        prop_assert!(issued_so_far + reward <= PUBLIC_ISSUANCE);
        if issued_so_far < PUBLIC_ISSUANCE {
            prop_assert!(reward >= 1);
        }
    }

    /// More issued means no more reward
    #[test]
    fn prop_reward_decreases_with_issuance(
        issued_a in 0u64..PUBLIC_ISSUANCE / 2,
        height in 1u64..1_000_000u64
    ) {
        let issued_b = issued_a + 1_000_000;
        prop_assert!(calculate_block_reward(height, issued_b) <= calculate_block_reward(height, issued_a));
    }

    /// Every leaf's proof folds back to the root
    #[test]
    fn prop_merkle_proofs_verify(seed in any::<u8>(), count in 1usize..64) {
        let hashes = leaves(seed, count);
        let root = compute_merkle_root(&hashes);
        for (index, leaf) in hashes.iter().enumerate() {
            let proof = build_merkle_proof(&hashes, index).unwrap();
            prop_assert!(proof.verify(leaf, &root));
            prop_assert!(!proof.verify(leaf, &sha256(root.as_bytes())));
        }
        prop_assert!(build_merkle_proof(&hashes, count).is_none());
    }

    /// Difficulty 0 never passes, 1 always does, and easing never rejects a
    /// hash a harder target accepted
    #[test]
    fn prop_target_boundaries(bytes in any::<[u8; 32]>(), difficulty in 2u64..u64::MAX) {
        let hash = Hash(bytes);
        prop_assert!(!meets_target(&hash, 0));
        prop_assert!(meets_target(&hash, 1));
        if meets_target(&hash, difficulty) {
            prop_assert!(meets_target(&hash, difficulty - 1));
        }
    }

    /// Block hash is deterministic
    #[test]
    fn prop_block_hash_deterministic(
        timestamp in any::<u64>(),
        difficulty in 1u64..u64::MAX,
        nonce in any::<u64>()
    ) {
        prop_assert_eq!(header(timestamp, difficulty, nonce).hash(), header(timestamp, difficulty, nonce).hash());
    }

    /// Different nonces produce different hashes
    #[test]
    fn prop_different_nonce_different_hash(nonce1 in any::<u64>(), nonce2 in any::<u64>()) {
        prop_assume!(nonce1 != nonce2);
        prop_assert_ne!(header(1_000, 42, nonce1).hash(), header(1_000, 42, nonce2).hash());
    }

    /// One retarget moves difficulty at most 4x either way
    #[test]
    fn prop_retarget_clamped(
        current in 1u64..1_000_000_000_000u64,
        first in 0u64..1_000_000_000u64,
        span in 0u64..100_000_000u64
    ) {
        let next = calculate_next_difficulty(&RETARGET, current, first, first + span);
        prop_assert!(next >= 1);
        prop_assert!(next <= current * 4);
        prop_assert!(next >= (current / 4).max(1));
    }

    /// Applying then reverting a spend restores the ledger exactly
    #[test]
    fn prop_apply_revert_restores_digest(
        amounts in prop::collection::vec(1u64..1_000_000, 1..12),
        spend_mask in any::<u16>()
    ) {
        let key = PrivateKey::from_bytes(&[7u8; 32]).unwrap();
        let owner = key.public_key().to_address();
        let mut ledger = Ledger::new();
        let mut inputs = Vec::new();
        let mut total = 0;
        for (i, amount) in amounts.iter().enumerate() {
            let txid = hash_bytes(&(i as u64).to_le_bytes());
            prop_assert!(ledger.add_utxo(owner.clone(), txid, 0, *amount, None));
            if spend_mask & (1 << i) != 0 || i == 0 {
                inputs.push(OutPoint::new(txid, 0));
                total += amount;
            }
        }
        let before = ledger.snapshot_digest();
        let value = ledger.get_total_unspent_value();

        let tx = Transaction::transfer(
            key.public_key(),
            inputs,
            vec![TxOutput::new(Address::new("LNdest"), total)],
            0,
            0,
        );
        let undo = ledger.apply_transaction(&tx).unwrap();
        prop_assert_ne!(ledger.snapshot_digest(), before);
        prop_assert_eq!(ledger.get_total_unspent_value(), value);

        ledger.revert_transaction(&tx, &undo).unwrap();
        prop_assert_eq!(ledger.snapshot_digest(), before);
    }

    /// The digest depends on content, not insertion order
    #[test]
    fn prop_snapshot_digest_order_independent(
        amounts in prop::collection::vec(1u64..1_000_000, 1..20)
    ) {
        let entries: Vec<(Address, Hash, u64)> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| {
                (Address::new(format!("LNowner{}", i % 3)), hash_bytes(&(i as u64).to_le_bytes()), *amount)
            })
            .collect();

        let mut forward = Ledger::new();
        for (owner, txid, amount) in &entries {
            forward.add_utxo(owner.clone(), *txid, 0, *amount, None);
        }
        let mut backward = Ledger::new();
        for (owner, txid, amount) in entries.iter().rev() {
            backward.add_utxo(owner.clone(), *txid, 0, *amount, None);
        }

        prop_assert_eq!(forward.snapshot_digest(), backward.snapshot_digest());
        prop_assert_eq!(forward.snapshot().digest(), forward.snapshot_digest());
    }
}

// ============================================================================
// ADVERSARIAL TESTS
// ============================================================================

fn funded_chain() -> (ChainState, PrivateKey, Block) {
    let key = PrivateKey::generate();
    let mut config = NodeConfig::default();
    config.chain.initial_difficulty = 1;
    config.genesis.allocation_address = key.public_key().to_address().as_str().to_string();
    let genesis = create_genesis_block(&config);
    let chain = ChainState::new(genesis.clone(), ChainParams::from_config(&config)).unwrap();
    (chain, key, genesis)
}

fn spend(key: &PrivateKey, genesis: &Block, to: &str) -> Transaction {
    Transaction::transfer(
        key.public_key(),
        vec![OutPoint::new(genesis.transactions[0].txid(), 0)],
        vec![TxOutput::new(Address::new(to), GENESIS_ALLOCATION - 1_000)],
        1_000,
        0,
    )
    .signed(key)
}

fn mine(block: Block) -> Block {
    match Miner::new(Address::new("LNminer")).mine_block(block) {
        MiningResult::Success(block) => block,
        other => panic!("unexpected {other:?}"),
    }
}

/// Test: Time warp attack resistance
///
/// Claimed timestamps of zero or a century apart are clamped to 4x.
#[test]
fn test_time_warp_attack_resistance() {
    let current = 1_000_000;
    assert_eq!(calculate_next_difficulty(&RETARGET, current, 5_000, 5_000), current * 4);
    assert_eq!(calculate_next_difficulty(&RETARGET, current, 5_000, 0), current * 4);
    let century = 100 * 365 * 24 * 3600;
    assert_eq!(calculate_next_difficulty(&RETARGET, current, 0, century), current / 4);
}

/// Test: Difficulty oscillation attack
///
/// Alternating fast and slow periods cannot drift difficulty away.
#[test]
fn test_difficulty_oscillation_resistance() {
    let initial = 1_000_000;
    let expected = RETARGET.expected_window();
    let fast = calculate_next_difficulty(&RETARGET, initial, 0, expected / 4);
    let slow = calculate_next_difficulty(&RETARGET, fast, 0, expected * 4);
    let ratio = initial.max(slow) / initial.min(slow);
    assert!(ratio < 2);
}

/// Test: Double-spend inside one block
#[test]
fn test_double_spend_in_block_rejected() {
    let (mut chain, key, genesis) = funded_chain();
    let digest = chain.snapshot_digest();
    let miner = Miner::new(Address::new("LNminer"));

    let mut block = miner.assemble_block_at(&chain, vec![spend(&key, &genesis, "LNalice")], unix_now());
    block.transactions.push(spend(&key, &genesis, "LNbob"));
    block.transactions[0].amount += 1_000;
    block.transactions[0].outputs[0].amount += 1_000;
    block.header.merkle_root = block.compute_merkle_root();
    let block = mine(block);

    let err = chain.add_block(block, unix_now()).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Invalid {
            source: ValidationError::InvalidTransaction { index: 2, .. },
            ..
        }
    ));
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.snapshot_digest(), digest);
}

/// Test: Invalid block reward rejected
///
/// A coinbase claiming one unit more than reward plus fees fails.
#[test]
fn test_excess_reward_rejected() {
    let (mut chain, _, _) = funded_chain();
    let miner = Miner::new(Address::new("LNminer"));
    let mut block = miner.assemble_block_at(&chain, vec![], unix_now());
    let valid = block.transactions[0].amount;
    block.transactions[0].amount = valid + 1;
    block.transactions[0].outputs[0].amount = valid + 1;
    block.header.merkle_root = block.compute_merkle_root();
    let block = mine(block);

    let err = chain.add_block(block, unix_now()).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Invalid {
            source: ValidationError::InvalidBlockReward { expected, got },
            ..
        } if expected == valid && got == valid + 1
    ));
    assert_eq!(chain.get_balance(&Address::new("LNminer")), 0);
}

/// Test: Tampered transaction list breaks the merkle commitment
#[test]
fn test_reordered_transactions_rejected() {
    let (mut chain, key, genesis) = funded_chain();
    let miner = Miner::new(Address::new("LNminer"));
    let template = miner.assemble_block_at(&chain, vec![spend(&key, &genesis, "LNalice")], unix_now());
    let mut block = mine(template);
    block.transactions.swap(0, 1);

    let err = chain.add_block(block, unix_now()).unwrap_err();
    assert!(matches!(
        err,
        ChainError::Invalid {
            source: ValidationError::InvalidMerkleRoot,
            ..
        }
    ));
}

/// Test: Supply exhaustion
///
/// Rewards go to zero once public issuance is complete.
#[test]
fn test_supply_exhaustion() {
    assert_eq!(calculate_block_reward(10_000_000, PUBLIC_ISSUANCE), 0);
    assert_eq!(calculate_block_reward(10_000_001, PUBLIC_ISSUANCE), 0);
    assert_eq!(calculate_block_reward(1, PUBLIC_ISSUANCE - 1), 1);
}

/// Test: Total supply cap
#[test]
fn test_total_supply_cap() {
    assert_eq!(GENESIS_ALLOCATION + PUBLIC_ISSUANCE, TOTAL_SUPPLY);
}

/// Test: Genesis determinism
///
/// Genesis block must be reproducible byte-for-byte.
#[test]
fn test_genesis_determinism() {
    let config = NodeConfig::default();
    let genesis1 = create_genesis_block(&config);
    let genesis2 = create_genesis_block(&config);

    assert_eq!(genesis1.hash(), genesis2.hash());
    assert_eq!(genesis1.header.merkle_root, genesis2.header.merkle_root);
    assert_eq!(genesis1.header.timestamp, genesis2.header.timestamp);
    assert_eq!(
        serde_json::to_vec(&genesis1).unwrap(),
        serde_json::to_vec(&genesis2).unwrap()
    );
}
