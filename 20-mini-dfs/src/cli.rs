use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    CoordinatorConfig, DEFAULT_BLOCK_CAPACITY, DEFAULT_READ_BUDGET, DEFAULT_REPLICATION_FACTOR,
    NetConfig, StorageConfig, default_owner,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the metadata coordinator that owns the namespace.
    Coordinator(CoordinatorArgs),
    /// Run a storage node that holds block files.
    Storage(StorageArgs),
    /// Connect to a coordinator and type commands.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct NetArgs {
    /// Seconds to wait for an outbound connection.
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Seconds to wait for a handshake or a single reply.
    #[arg(long, default_value_t = 10)]
    pub read_timeout_secs: u64,

    /// Seconds a node-to-node connection may stay silent.
    #[arg(long, default_value_t = 300)]
    pub idle_timeout_secs: u64,
}

impl NetArgs {
    fn into_config(self) -> NetConfig {
        NetConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CoordinatorArgs {
    /// Socket address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:7400")]
    pub listen: SocketAddr,

    /// Directory holding the journal and the node id file.
    #[arg(long, default_value = "./meta")]
    pub data_dir: PathBuf,

    /// Owner recorded on new files. Defaults to the current user.
    #[arg(long)]
    pub owner: Option<String>,

    /// Number of storage nodes each new file is placed on.
    #[arg(long, default_value_t = DEFAULT_REPLICATION_FACTOR)]
    pub replication: usize,

    /// Seconds between broadcasting `shutdown` and exiting.
    #[arg(long, default_value_t = 60)]
    pub shutdown_grace_secs: u64,

    #[command(flatten)]
    pub net: NetArgs,
}

impl CoordinatorArgs {
    pub fn into_config(self) -> CoordinatorConfig {
        CoordinatorConfig {
            listen: self.listen,
            data_dir: self.data_dir,
            owner: self.owner.unwrap_or_else(default_owner),
            replication_factor: self.replication,
            net: self.net.into_config(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct StorageArgs {
    /// Socket address to listen on for coordinator actions.
    #[arg(long, default_value = "127.0.0.1:7500")]
    pub listen: SocketAddr,

    /// Address the coordinator should dial back. Defaults to the listen IP.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Address of the coordinator to register with.
    #[arg(long, default_value = "127.0.0.1:7400")]
    pub coordinator: SocketAddr,

    /// Directory holding block files, the journal and the node id file.
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Bytes a block may hold before a new one is started.
    #[arg(long, default_value_t = DEFAULT_BLOCK_CAPACITY)]
    pub block_capacity: u64,

    /// Bytes returned by `head` and `tail`.
    #[arg(long, default_value_t = DEFAULT_READ_BUDGET)]
    pub read_budget: usize,

    /// Seconds between heartbeats.
    #[arg(long, default_value_t = 10)]
    pub heartbeat_secs: u64,

    /// Seconds between a `shutdown` action and exiting.
    #[arg(long, default_value_t = 60)]
    pub shutdown_grace_secs: u64,

    #[command(flatten)]
    pub net: NetArgs,
}

impl StorageArgs {
    pub fn into_config(self) -> StorageConfig {
        StorageConfig {
            listen: self.listen,
            advertise_address: self.advertise,
            coordinator: self.coordinator,
            data_dir: self.data_dir,
            block_capacity: self.block_capacity,
            read_budget: self.read_budget,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            net: self.net.into_config(),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the coordinator to connect to.
    #[arg(long, default_value = "127.0.0.1:7400")]
    pub server: SocketAddr,

    /// Seconds to wait for the connection.
    #[arg(long, default_value_t = 5)]
    pub connect_timeout_secs: u64,
}

impl ClientArgs {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_defaults_map_onto_config() {
        let cli = Cli::try_parse_from(["mini-dfs", "storage", "--data-dir", "/tmp/node1"]).expect("parse");
        let Command::Storage(args) = cli.command else {
            panic!("expected storage subcommand");
        };
        let config = args.into_config();
        assert_eq!(config.read_budget, DEFAULT_READ_BUDGET);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.block_dir(), PathBuf::from("/tmp/node1/blocks"));
        assert_eq!(config.net, NetConfig::default());
    }

    #[test]
    fn coordinator_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "mini-dfs",
            "coordinator",
            "--listen",
            "0.0.0.0:9000",
            "--replication",
            "3",
            "--owner",
            "ops",
            "--read-timeout-secs",
            "2",
        ])
        .expect("parse");
        let Command::Coordinator(args) = cli.command else {
            panic!("expected coordinator subcommand");
        };
        let config = args.into_config();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.replication_factor, 3);
        assert_eq!(config.owner, "ops");
        assert_eq!(config.net.read_timeout, Duration::from_secs(2));
    }
}
