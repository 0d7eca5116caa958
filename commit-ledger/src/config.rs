//! Configuration for the ledger

use crate::types::Address;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Operator wallet, registered at round 0
    pub operator: Address,

    /// Assets registered when the ledger opens
    pub assets: Vec<Address>,

    /// Hex seed of the operator's Ed25519 attestation key
    pub signing_seed: Option<String>,

    /// Actor configuration
    pub actor: ActorConfig,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "commit-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            data_dir: PathBuf::from("./data/ledger"),
            operator: Address::ZERO,
            assets: Vec::new(),
            signing_seed: None,
            actor: ActorConfig::default(),
            rocksdb: RocksDBConfig::default(),
        }
    }
}

/// Actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
    /// Bounded mailbox size
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1000,
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Sync the WAL before a write set is acknowledged
    pub sync_writes: bool,

    /// Flush memtables to SST files on shutdown
    pub flush_on_shutdown: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 4,
            sync_writes: true,
            flush_on_shutdown: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(operator) = std::env::var("LEDGER_OPERATOR") {
            config.operator = operator
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_OPERATOR: {}", e)))?;
        }

        if let Ok(assets) = std::env::var("LEDGER_ASSETS") {
            config.assets = assets
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse()
                        .map_err(|e| crate::Error::Config(format!("LEDGER_ASSETS: {}", e)))
                })
                .collect::<crate::Result<Vec<Address>>>()?;
        }

        if let Ok(seed) = std::env::var("LEDGER_SIGNING_SEED") {
            config.signing_seed = Some(seed);
        }

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(capacity) = std::env::var("LEDGER_MAILBOX_CAPACITY") {
            config.actor.mailbox_capacity = capacity
                .parse()
                .map_err(|e| crate::Error::Config(format!("LEDGER_MAILBOX_CAPACITY: {}", e)))?;
        }

        Ok(config)
    }
}
