//! Plain configuration values consumed by the coordinator and storage nodes.
//!
//! Nothing here parses arguments; the binary maps its command line onto these
//! structs and tests build them directly.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const COORDINATOR_JOURNAL: &str = "meta_journal";
pub const COORDINATOR_ID_FILE: &str = "meta_node.id";
pub const STORAGE_JOURNAL: &str = "data_journal";
pub const STORAGE_ID_FILE: &str = "data_node.id";
pub const STORAGE_BLOCK_DIR: &str = "blocks";

pub const DEFAULT_REPLICATION_FACTOR: usize = 2;
pub const DEFAULT_READ_BUDGET: usize = 1024;
pub const DEFAULT_BLOCK_CAPACITY: u64 = 64 * 1024 * 1024;

/// Socket timeouts. Every outbound connect and every read from a
/// non-interactive peer is bounded by one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub connect_timeout: Duration,
    /// Handshakes and single-reply reads.
    pub read_timeout: Duration,
    /// How long a storage-facing connection may sit without a command.
    pub idle_timeout: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    /// Owner recorded on every new file.
    pub owner: String,
    pub replication_factor: usize,
    pub net: NetConfig,
    /// Pause between broadcasting `shutdown` and stopping the server.
    pub shutdown_grace: Duration,
}

impl CoordinatorConfig {
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(COORDINATOR_JOURNAL)
    }

    pub fn id_path(&self) -> PathBuf {
        self.data_dir.join(COORDINATOR_ID_FILE)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7400)),
            data_dir: PathBuf::from("./meta"),
            owner: default_owner(),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            net: NetConfig::default(),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub listen: SocketAddr,
    /// Address the coordinator should dial back; defaults to the listen IP.
    pub advertise_address: Option<String>,
    pub coordinator: SocketAddr,
    pub data_dir: PathBuf,
    pub block_capacity: u64,
    /// Upper bound on bytes returned by `head` and `tail`.
    pub read_budget: usize,
    pub heartbeat_interval: Duration,
    pub net: NetConfig,
    pub shutdown_grace: Duration,
}

impl StorageConfig {
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join(STORAGE_JOURNAL)
    }

    pub fn id_path(&self) -> PathBuf {
        self.data_dir.join(STORAGE_ID_FILE)
    }

    pub fn block_dir(&self) -> PathBuf {
        self.data_dir.join(STORAGE_BLOCK_DIR)
    }

    pub fn advertised_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| self.listen.ip().to_string())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7500)),
            advertise_address: None,
            coordinator: SocketAddr::from(([127, 0, 0, 1], 7400)),
            data_dir: PathBuf::from("./data"),
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            read_budget: DEFAULT_READ_BUDGET,
            heartbeat_interval: Duration::from_secs(10),
            net: NetConfig::default(),
            shutdown_grace: Duration::from_secs(60),
        }
    }
}

pub fn default_owner() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "mini-dfs".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_paths_live_under_data_dir() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/srv/dfs"),
            ..Default::default()
        };
        assert_eq!(config.journal_path(), PathBuf::from("/srv/dfs/data_journal"));
        assert_eq!(config.block_dir(), PathBuf::from("/srv/dfs/blocks"));
        assert_eq!(config.advertised_address(), "127.0.0.1");
    }

    #[test]
    fn advertise_address_overrides_listen_ip() {
        let config = StorageConfig {
            listen: "0.0.0.0:7500".parse().expect("addr"),
            advertise_address: Some("10.1.2.3".into()),
            ..Default::default()
        };
        assert_eq!(config.advertised_address(), "10.1.2.3");
    }
}
