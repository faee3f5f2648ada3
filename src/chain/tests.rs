use super::*;
use crate::consensus::{calculate_block_reward, Block, RetargetParams};
use crate::crypto::{Address, PrivateKey};
use crate::testutil::{genesis, grow, make_block, new_chain, params, spend_genesis, NOW};
use crate::validation::Transaction;

#[test]
fn test_genesis_state() {
    let (chain, key, genesis) = new_chain();
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.tip_hash(), genesis.hash());
    assert_eq!(chain.get_balance(&key.public_key().to_address()), 1_000_000);
    assert_eq!(chain.get_total_unspent_value(), 1_000_000);
    assert!(chain.find_transaction(&genesis.transactions[0].txid()).is_some());
}

#[test]
fn test_extend_tip() {
    let (mut chain, _, genesis) = new_chain();
    let block = make_block(&chain, genesis.hash(), "LNminer", vec![]);

    let update = chain.add_block(block.clone(), NOW).unwrap();
    assert_eq!(update.outcome, BlockOutcome::Extended);
    assert_eq!(update.connected, vec![block.clone()]);
    assert!(update.disconnected.is_empty());

    assert_eq!(chain.height(), 1);
    assert_eq!(chain.get_latest_block(), &block);
    assert_eq!(
        chain.get_balance(&Address::new("LNminer")),
        calculate_block_reward(1, 0)
    );
    assert_eq!(chain.get_stats().total_issued, calculate_block_reward(1, 0));
}

#[test]
fn test_transfer_moves_funds() {
    let (mut chain, key, genesis) = new_chain();
    let tx = spend_genesis(&key, &genesis, "LNdest", 400_000, 1_000);
    let block = make_block(&chain, genesis.hash(), "LNminer", vec![tx.clone()]);
    chain.add_block(block.clone(), NOW).unwrap();

    assert_eq!(chain.get_balance(&Address::new("LNdest")), 400_000);
    assert_eq!(chain.get_balance(&key.public_key().to_address()), 599_000);
    assert_eq!(
        chain.get_balance(&Address::new("LNminer")),
        calculate_block_reward(1, 0) + 1_000
    );
    let location = chain.find_transaction(&tx.txid()).unwrap();
    assert_eq!(location.height, 1);
    assert_eq!(location.block_hash, block.hash());
}

#[test]
fn test_invalid_block_leaves_state_untouched() {
    let (mut chain, _, genesis) = new_chain();
    let mut block = make_block(&chain, genesis.hash(), "LNminer", vec![]);
    block.transactions[0] = Transaction::coinbase(1, Address::new("LNminer"), 1);
    block.header.merkle_root = block.compute_merkle_root();
    let digest = chain.snapshot_digest();

    assert!(matches!(
        chain.add_block(block, NOW),
        Err(ChainError::Invalid { height: 1, .. })
    ));
    assert_eq!(chain.height(), 0);
    assert_eq!(chain.snapshot_digest(), digest);
}

#[test]
fn test_duplicate_and_future_blocks_rejected() {
    let (mut chain, _, genesis) = new_chain();
    let block = make_block(&chain, genesis.hash(), "LNminer", vec![]);
    chain.add_block(block.clone(), NOW).unwrap();
    assert_eq!(chain.add_block(block.clone(), NOW), Err(ChainError::Duplicate(block.hash())));

    let early = block.header.timestamp - 7_201;
    let next = make_block(&chain, block.hash(), "LNminer", vec![]);
    assert!(matches!(
        chain.add_block(next, early),
        Err(ChainError::TimestampTooFar { .. })
    ));
}

#[test]
fn test_orphans_connect_when_parent_arrives() {
    let (mut chain, _, genesis) = new_chain();
    let mut scratch = chain.clone();
    let blocks = grow(&mut scratch, genesis.hash(), "LNminer", 3);

    let update = chain.add_block(blocks[2].clone(), NOW).unwrap();
    assert_eq!(
        update.outcome,
        BlockOutcome::Orphaned {
            missing_parent: blocks[1].hash()
        }
    );
    chain.add_block(blocks[1].clone(), NOW).unwrap();
    assert_eq!(chain.orphan_count(), 2);
    assert_eq!(chain.height(), 0);

    let update = chain.add_block(blocks[0].clone(), NOW).unwrap();
    assert_eq!(update.outcome, BlockOutcome::Extended);
    assert_eq!(update.adopted_orphans, 2);
    assert_eq!(update.connected, blocks);
    assert_eq!(chain.height(), 3);
    assert_eq!(chain.orphan_count(), 0);
}

#[test]
fn test_orphan_pruning_by_age() {
    let (mut chain, _, genesis) = new_chain();
    let mut scratch = chain.clone();
    let blocks = grow(&mut scratch, genesis.hash(), "LNminer", 3);

    chain.add_block(blocks[1].clone(), NOW).unwrap();
    chain.add_block(blocks[2].clone(), NOW + 500).unwrap();

    assert_eq!(chain.prune_orphans(NOW + 700), 1);
    assert!(chain.orphans_waiting_on(&blocks[0].hash()).is_empty());
    assert_eq!(chain.orphans_waiting_on(&blocks[1].hash()), vec![&blocks[2]]);
}

#[test]
fn test_side_chain_then_reorg() {
    let (mut chain, key, genesis) = new_chain();
    let tx = spend_genesis(&key, &genesis, "LNdest", 400_000, 1_000);
    let first = make_block(&chain, genesis.hash(), "LNalice", vec![tx.clone()]);
    chain.add_block(first.clone(), NOW).unwrap();
    let mut main = vec![first.clone()];
    main.extend(grow(&mut chain, first.hash(), "LNalice", 2));

    let mut fork = Vec::new();
    let mut parent = genesis.hash();
    for i in 0..3 {
        let block = make_block(&chain, parent, "LNbob", vec![]);
        parent = block.hash();
        let update = chain.add_block(block.clone(), NOW).unwrap();
        assert_eq!(update.outcome, BlockOutcome::SideChain, "fork block {i}");
        fork.push(block);
    }
    // equal work is not enough
    assert_eq!(chain.tip_hash(), main[2].hash());

    let winner = make_block(&chain, parent, "LNbob", vec![]);
    fork.push(winner.clone());
    let update = chain.add_block(winner, NOW).unwrap();

    assert_eq!(update.outcome, BlockOutcome::Reorganized { fork_height: 0 });
    let disconnected: Vec<Block> = main.iter().rev().cloned().collect();
    assert_eq!(update.disconnected, disconnected);
    assert_eq!(update.connected, fork);
    assert_eq!(update.rewound_to(), Some(1));

    assert_eq!(chain.height(), 4);
    assert_eq!(chain.get_balance(&Address::new("LNalice")), 0);
    assert_eq!(chain.get_balance(&Address::new("LNdest")), 0);
    assert_eq!(chain.get_balance(&key.public_key().to_address()), 1_000_000);
    assert!(chain.find_transaction(&tx.txid()).is_none());
    assert!(chain.get_block(BlockId::Hash(main[0].hash())).is_none());
    assert!(chain.contains_block(&main[0].hash()));

    let mut replay_blocks = vec![genesis];
    replay_blocks.extend(fork);
    let replay = ChainState::from_blocks(replay_blocks, params()).unwrap();
    assert_eq!(chain.snapshot_digest(), replay.snapshot_digest());
}

#[test]
fn test_checkpoint_blocks_deep_fork_despite_more_work() {
    let (mut chain, _, genesis) = new_chain();
    let main = grow(&mut chain, genesis.hash(), "LNalice", 105);
    let fork_base = main[89].hash();

    // without a checkpoint the longer fork wins
    let mut open = chain.clone();
    let fork = grow(&mut open, fork_base, "LNbob", 20);
    assert_eq!(open.height(), 110);
    assert_eq!(open.tip_hash(), fork[19].hash());

    chain.set_finalized_height(100);
    assert_eq!(
        chain.add_block(fork[0].clone(), NOW),
        Err(ChainError::ForkBeforeCheckpoint {
            fork_height: 90,
            checkpoint: 100
        })
    );
    for block in &fork[1..] {
        assert!(chain.add_block(block.clone(), NOW).is_ok());
    }
    // the rest only sit as orphans of the rejected block
    assert_eq!(chain.tip_hash(), main[104].hash());
    assert_eq!(chain.height(), 105);
}

#[test]
fn test_fork_above_checkpoint_still_reorgs() {
    let (mut chain, _, genesis) = new_chain();
    let main = grow(&mut chain, genesis.hash(), "LNalice", 12);
    chain.set_finalized_height(10);

    let fork = grow(&mut chain, main[10].hash(), "LNbob", 2);
    assert_eq!(chain.tip_hash(), fork[1].hash());
    assert_eq!(chain.height(), 13);
}

#[test]
fn test_invalid_challenger_aborts_reorg() {
    let (mut chain, _, genesis) = new_chain();
    let main = grow(&mut chain, genesis.hash(), "LNalice", 2);
    let digest = chain.snapshot_digest();

    let b1 = make_block(&chain, genesis.hash(), "LNbob", vec![]);
    chain.add_block(b1.clone(), NOW).unwrap();

    // overpaying coinbase: header checks pass, full validation does not
    let mut b2 = make_block(&chain, b1.hash(), "LNbob", vec![]);
    b2.transactions[0] = Transaction::coinbase(2, Address::new("LNbob"), 999_999_999);
    b2.header.merkle_root = b2.compute_merkle_root();
    assert_eq!(chain.add_block(b2.clone(), NOW).unwrap().outcome, BlockOutcome::SideChain);

    let b3 = make_block(&chain, b2.hash(), "LNbob", vec![]);
    assert!(matches!(
        chain.add_block(b3.clone(), NOW),
        Err(ChainError::Invalid { height: 2, .. })
    ));
    assert_eq!(chain.tip_hash(), main[1].hash());
    assert_eq!(chain.snapshot_digest(), digest);

    let b4 = make_block(&chain, b3.hash(), "LNbob", vec![]);
    assert_eq!(
        chain.add_block(b4.clone(), NOW),
        Err(ChainError::InvalidAncestor(b4.hash()))
    );
    assert_eq!(chain.tip_hash(), main[1].hash());
}

#[test]
fn test_queries() {
    let (mut chain, _, genesis) = new_chain();
    let blocks = grow(&mut chain, genesis.hash(), "LNminer", 5);

    assert_eq!(chain.get_block(BlockId::Height(0)), Some(&genesis));
    assert_eq!(chain.get_block(BlockId::Height(3)), Some(&blocks[2]));
    assert_eq!(chain.get_block(BlockId::Hash(blocks[4].hash())), Some(&blocks[4]));
    assert_eq!(chain.get_block(BlockId::Height(6)), None);

    let headers = chain.header_range(2, 10);
    assert_eq!(headers.len(), 4);
    assert_eq!(headers[0], blocks[1].header);
    assert_eq!(chain.canonical_blocks().count(), 6);

    let stats = chain.get_stats();
    assert_eq!(stats.height, 5);
    assert_eq!(stats.cumulative_work, 6);
    assert_eq!(stats.next_difficulty, 1);
}

#[test]
fn test_from_blocks_rejects_tampering() {
    let (mut chain, _, genesis) = new_chain();
    let blocks = grow(&mut chain, genesis.hash(), "LNminer", 3);

    let mut all = vec![genesis.clone()];
    all.extend(blocks.clone());
    let replay = ChainState::from_blocks(all.clone(), params()).unwrap();
    assert_eq!(replay.snapshot_digest(), chain.snapshot_digest());

    all[2].transactions[0].outputs[0].amount += 1;
    all[2].transactions[0].amount += 1;
    assert!(ChainState::from_blocks(all, params()).is_err());
}

#[test]
fn test_difficulty_retargets() {
    let key = PrivateKey::generate();
    let mut p = params();
    p.retarget = RetargetParams {
        interval: 4,
        target_block_time: 120,
    };
    let genesis = genesis(&key.public_key().to_address());
    let mut chain = ChainState::new(genesis.clone(), p).unwrap();

    // blocks arrive every 60s against a 120s target
    let blocks = grow(&mut chain, genesis.hash(), "LNminer", 4);
    assert_eq!(blocks[2].header.difficulty, 1);
    assert_eq!(blocks[3].header.difficulty, 2);
    assert_eq!(chain.get_stats().cumulative_work, 1 + 3 + 2);
}

#[test]
fn test_anchor_chain_extends() {
    let (mut chain, _, genesis) = new_chain();
    let blocks = grow(&mut chain, genesis.hash(), "LNminer", 4);
    let tip = chain.tip_entry().clone();

    let mut anchored = ChainState::from_anchor(
        ChainAnchor {
            header: tip.block.header.clone(),
            ledger: chain.ledger().clone(),
            cumulative_work: tip.cumulative_work,
            total_issued: tip.total_issued,
            epoch_start: tip.epoch_start,
        },
        params(),
    );
    assert_eq!(anchored.base_height(), 4);
    assert_eq!(anchored.finalized_height(), Some(4));
    assert_eq!(anchored.get_block(BlockId::Height(2)), None);

    let next = make_block(&chain, blocks[3].hash(), "LNminer", vec![]);
    chain.add_block(next.clone(), NOW).unwrap();
    anchored.connect_tip(next).unwrap();
    assert_eq!(anchored.snapshot_digest(), chain.snapshot_digest());
    assert_eq!(anchored.get_stats().cumulative_work, chain.get_stats().cumulative_work);
}
