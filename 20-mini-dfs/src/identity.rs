//! Participant descriptors exchanged in every handshake.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::DfsResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Storage,
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Coordinator => "coordinator",
            Role::Storage => "storage",
            Role::Client => "client",
        };
        f.write_str(name)
    }
}

/// Capacity figures a storage node reports about itself. Sizes are bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResourceStats {
    pub cores: usize,
    pub free_memory: u64,
    pub max_memory: u64,
    pub runtime_memory: u64,
    pub free_disk: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub address: String,
    pub port: u16,
    pub id: u64,
    pub role: Role,
    // Journals are bincode-encoded, so no skip_serializing_if here.
    #[serde(default)]
    pub stats: Option<NodeResourceStats>,
}

impl NodeIdentity {
    pub fn new(address: impl Into<String>, port: u16, id: u64, role: Role) -> Self {
        Self {
            address: address.into(),
            port,
            id,
            role,
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: NodeResourceStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// `address:port`, the key nodes are tracked by.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn same_endpoint(&self, other: &NodeIdentity) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{} (id {})", self.role, self.address, self.port, self.id)
    }
}

pub fn generate_id() -> u64 {
    rand::random::<u64>() >> 1
}

/// Reads the node id persisted at `path`, or writes a fresh one there.
pub fn load_or_generate_id(path: &Path) -> DfsResult<u64> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let id = contents.trim().parse::<u64>().map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("id file {} is corrupt: {err}", path.display()),
                )
            })?;
            Ok(id)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let id = generate_id();
            let mut file = std::fs::File::create(path)?;
            file.write_all(id.to_string().as_bytes())?;
            file.sync_all()?;
            info!(path = %path.display(), id, "no id file found, generated a new node id");
            Ok(id)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn handshake_json_carries_role_and_stats() {
        let identity = NodeIdentity::new("127.0.0.1", 7500, 9, Role::Storage).with_stats(
            NodeResourceStats {
                cores: 4,
                ..Default::default()
            },
        );
        let json = serde_json::to_string(&identity).expect("encode");
        assert!(json.contains("\"role\":\"storage\""));
        let back: NodeIdentity = serde_json::from_str(&json).expect("decode");
        assert_eq!(back, identity);
    }

    #[test]
    fn stats_default_when_absent() {
        let json = r#"{"address":"10.0.0.1","port":1,"id":2,"role":"client"}"#;
        let identity: NodeIdentity = serde_json::from_str(json).expect("decode");
        assert_eq!(identity.role, Role::Client);
        assert!(identity.stats.is_none());
    }

    #[test]
    fn id_file_is_reused_across_restarts() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("node.id");
        let first = load_or_generate_id(&path).expect("generate");
        let second = load_or_generate_id(&path).expect("reload");
        assert_eq!(first, second);
        assert!(first <= i64::MAX as u64);
    }

    #[test]
    fn corrupt_id_file_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("node.id");
        std::fs::write(&path, "not-a-number").expect("write");
        assert!(load_or_generate_id(&path).is_err());
    }
}
