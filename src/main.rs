//! Ledger node
//!
//! Loads the configuration, recovers the chain and runs mining workers and
//! periodic maintenance until interrupted.

use ledger_node::config::NodeConfig;
use ledger_node::crypto::Address;
use ledger_node::mining::{Miner, MiningResult};
use ledger_node::node::{GenesisInfo, Node};
use ledger_node::unix_now;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("node.toml"));
    let config = match NodeConfig::load(&path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("cannot load configuration {}: {err}", path.display());
            return ExitCode::FAILURE;
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(config.log_level))
        .init();

    let genesis = GenesisInfo::new(&config);
    info!(
        hash = %genesis.hash,
        merkle_root = %genesis.merkle_root,
        timestamp = genesis.timestamp,
        difficulty = genesis.difficulty,
        allocation = genesis.allocation,
        "genesis"
    );

    let node = match Node::open(config.clone()) {
        Ok(node) => Arc::new(node),
        Err(err) => {
            error!(error = %err, "node failed to start");
            eprintln!("fatal: {err}");
            return ExitCode::FAILURE;
        }
    };
    let stats = node.get_stats();
    info!(
        height = stats.chain.height,
        tip = %stats.chain.tip_hash,
        utxos = stats.chain.utxo_count,
        supply = stats.chain.total_supply,
        source = %stats.recovered_from,
        "node ready"
    );

    let miner = Miner::new(Address::new(config.miner.reward_address.as_str()));
    let mut workers = Vec::new();
    if config.miner.enabled {
        let threads = config.miner.threads.max(1);
        info!(threads, address = %config.miner.reward_address, "mining enabled");
        for i in 0..threads {
            let worker = miner
                .clone()
                .with_start_nonce(i as u64 * (u64::MAX / threads as u64));
            let node = Arc::clone(&node);
            workers.push(tokio::task::spawn_blocking(move || mine(&node, &worker)));
        }
    }

    let maintenance = {
        let node = Arc::clone(&node);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                let node = Arc::clone(&node);
                match tokio::task::spawn_blocking(move || node.maintenance(unix_now())).await {
                    Ok(report) => debug!(?report, "maintenance pass"),
                    Err(err) => warn!(error = %err, "maintenance task failed"),
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for shutdown signal");
    }
    info!("shutting down");
    miner.stop();
    maintenance.abort();
    for worker in workers {
        if let Err(err) = worker.await {
            warn!(error = %err, "mining worker panicked");
        }
    }
    ExitCode::SUCCESS
}

/// Mine until the stop signal is raised
fn mine(node: &Node, miner: &Miner) {
    while !miner.is_stopped() {
        match node.mine_once(miner) {
            Ok(MiningResult::Success(block)) => {
                let stats = node.get_stats();
                info!(
                    height = block.height(),
                    supply = stats.chain.total_supply,
                    pending = stats.mempool_size,
                    "block committed"
                );
            }
            Ok(MiningResult::Stale { mined_on }) => debug!(%mined_on, "template went stale"),
            Ok(MiningResult::Interrupted) => break,
            Err(err) => {
                warn!(error = %err, "mining attempt failed");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
}
