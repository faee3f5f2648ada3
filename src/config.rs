//! Node configuration
//!
//! Loaded from TOML. Every section and field has a default, so an absent
//! file or a partial one both yield a runnable node.

use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::constants::{GENESIS_ALLOCATION, GENESIS_TIMESTAMP};
use crate::crypto::Address;
use crate::Amount;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub chain: ChainConfig,
    pub genesis: GenesisConfig,
    pub mempool: MempoolConfig,
    pub orphans: OrphanConfig,
    pub checkpoint: CheckpointConfig,
    pub index: IndexConfig,
    pub miner: MinerConfig,
    pub storage: StorageConfig,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Difficulty of the first retarget period
    pub initial_difficulty: u64,
    /// Blocks between difficulty adjustments
    pub retarget_interval: u64,
    /// Seconds
    pub target_block_time: u64,
    /// How far ahead of local time a block timestamp may be, in seconds
    pub max_future_drift: u64,
    /// Compare every reorg result against a full replay
    pub verify_reorg_replay: bool,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            initial_difficulty: 1_000,
            retarget_interval: 144,
            target_block_time: 60,
            max_future_drift: 2 * 60 * 60,
            verify_reorg_replay: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    pub timestamp: u64,
    /// Receives the genesis allocation
    pub allocation_address: String,
    pub allocation: Amount,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: GENESIS_TIMESTAMP,
            allocation_address: "LNgenesis".to_string(),
            allocation: GENESIS_ALLOCATION,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Pending transactions held at most
    pub max_size: usize,
    pub max_per_sender: usize,
    /// Smallest payment accepted, in base units
    pub dust_threshold: Amount,
    /// How far beyond the next expected nonce a transaction may reach
    pub max_nonce_gap: u64,
    /// Seconds a pending transaction may wait before it expires
    pub max_age_secs: u64,
    pub max_orphans: usize,
    pub orphan_max_age_secs: u64,
    /// Confirmed/expired ids remembered for status queries
    pub history_capacity: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_per_sender: 25,
            dust_threshold: 1_000,
            max_nonce_gap: 16,
            max_age_secs: 24 * 60 * 60,
            max_orphans: 1_000,
            orphan_max_age_secs: 20 * 60,
            history_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrphanConfig {
    pub max_blocks: usize,
    /// Seconds
    pub max_age_secs: u64,
    /// Blocks behind the tip
    pub max_depth: u64,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            max_blocks: 256,
            max_age_secs: 60 * 60,
            max_depth: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Blocks between checkpoints
    pub interval: u64,
    pub retained: usize,
    /// Blocks between full backups
    pub backup_interval: u64,
    pub backups_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: 100,
            retained: 5,
            backup_interval: 500,
            backups_retained: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub cache_capacity: usize,
    /// Bytes per block file before rolling over
    pub max_block_file_size: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            max_block_file_size: 128 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinerConfig {
    pub enabled: bool,
    pub threads: usize,
    pub reward_address: String,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: 1,
            reward_address: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn blocks_path(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl NodeConfig {
    /// Load and validate. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Self::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(bool, &str); 12] = [
            (self.chain.initial_difficulty == 0, "chain.initial_difficulty must be at least 1"),
            (self.chain.retarget_interval < 2, "chain.retarget_interval must be at least 2"),
            (self.chain.target_block_time == 0, "chain.target_block_time must be positive"),
            (self.genesis.allocation_address.is_empty(), "genesis.allocation_address must be set"),
            (self.mempool.max_size == 0, "mempool.max_size must be positive"),
            (self.mempool.max_per_sender == 0, "mempool.max_per_sender must be positive"),
            (self.orphans.max_blocks == 0, "orphans.max_blocks must be positive"),
            (self.checkpoint.interval == 0, "checkpoint.interval must be positive"),
            (self.checkpoint.retained == 0, "checkpoint.retained must be positive"),
            (self.checkpoint.backup_interval == 0, "checkpoint.backup_interval must be positive"),
            (self.index.cache_capacity == 0, "index.cache_capacity must be positive"),
            (
                self.miner.enabled && !Address::new(self.miner.reward_address.as_str()).is_well_formed(),
                "miner.reward_address must be a valid address when mining is enabled",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(ConfigError::Invalid(message.to_string())),
            None => Ok(()),
        }
    }
}
