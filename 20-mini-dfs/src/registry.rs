//! Coordinator-side bookkeeping of connected peers.
//!
//! Storage nodes are keyed by `address:port`. They are added by their
//! handshake, refreshed by `sysinfo`, and never evicted. At most one client
//! may be attached at a time.

use parking_lot::Mutex;

use crate::error::{DfsError, DfsResult};
use crate::identity::{NodeIdentity, NodeResourceStats};

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct Peers {
    storage: Vec<NodeIdentity>,
    client: Option<NodeIdentity>,
}

#[derive(Default)]
pub struct NodeRegistry {
    peers: Mutex<Peers>,
}

/// Resources summed over storage nodes on distinct hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterStats {
    pub hosts: usize,
    pub totals: NodeResourceStats,
}

impl ClusterStats {
    pub fn render(&self) -> Vec<String> {
        let totals = &self.totals;
        vec![
            format!("Current connected system count: {}", self.hosts),
            format!("Current available cores: {}", totals.cores),
            format!("Current available memory (MB): {}", totals.free_memory / MIB),
            format!("Current maximum memory (MB): {}", totals.max_memory / MIB),
            format!("Current process memory (MB): {}", totals.runtime_memory / MIB),
            format!("Current free disk space (MB): {}", totals.free_disk / MIB),
        ]
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a storage node. A node reconnecting from the same endpoint
    /// replaces its old entry instead of being listed twice.
    pub fn register_storage(&self, identity: NodeIdentity) {
        let mut peers = self.peers.lock();
        match peers
            .storage
            .iter_mut()
            .find(|known| known.same_endpoint(&identity))
        {
            Some(known) => *known = identity,
            None => peers.storage.push(identity),
        }
    }

    /// Replaces the entry with the same endpoint. Returns `false` and changes
    /// nothing when the node is unknown.
    pub fn update_storage(&self, identity: NodeIdentity) -> bool {
        let mut peers = self.peers.lock();
        match peers
            .storage
            .iter_mut()
            .find(|known| known.same_endpoint(&identity))
        {
            Some(known) => {
                *known = identity;
                true
            }
            None => false,
        }
    }

    pub fn storage_nodes(&self) -> Vec<NodeIdentity> {
        self.peers.lock().storage.clone()
    }

    pub fn storage_count(&self) -> usize {
        self.peers.lock().storage.len()
    }

    pub fn attach_client(&self, identity: NodeIdentity) -> DfsResult<()> {
        let mut peers = self.peers.lock();
        if let Some(current) = &peers.client {
            return Err(DfsError::ClientAlreadyAttached(current.endpoint()));
        }
        peers.client = Some(identity);
        Ok(())
    }

    pub fn detach_client(&self) -> Option<NodeIdentity> {
        self.peers.lock().client.take()
    }

    /// Clears the client slot only if it is still held by `identity`.
    pub fn detach_client_if(&self, identity: &NodeIdentity) -> bool {
        let mut peers = self.peers.lock();
        let held = peers
            .client
            .as_ref()
            .is_some_and(|current| current.same_endpoint(identity));
        if held {
            peers.client = None;
        }
        held
    }

    pub fn client(&self) -> Option<NodeIdentity> {
        self.peers.lock().client.clone()
    }

    /// Sums the last reported stats, counting each host address once.
    pub fn cluster_stats(&self) -> ClusterStats {
        let peers = self.peers.lock();
        let mut seen: Vec<&str> = Vec::new();
        let mut stats = ClusterStats::default();
        for node in &peers.storage {
            if seen.contains(&node.address.as_str()) {
                continue;
            }
            seen.push(&node.address);
            stats.hosts += 1;
            if let Some(reported) = &node.stats {
                let totals = &mut stats.totals;
                totals.cores += reported.cores;
                totals.free_memory += reported.free_memory;
                totals.max_memory += reported.max_memory;
                totals.runtime_memory += reported.runtime_memory;
                totals.free_disk += reported.free_disk;
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::identity::Role;

    fn storage(address: &str, port: u16) -> NodeIdentity {
        NodeIdentity::new(address, port, u64::from(port), Role::Storage)
    }

    #[test]
    fn register_replaces_same_endpoint() {
        let registry = NodeRegistry::new();
        registry.register_storage(storage("10.0.0.1", 1));
        registry.register_storage(storage("10.0.0.1", 2));
        let mut again = storage("10.0.0.1", 1);
        again.id = 99;
        registry.register_storage(again);

        let nodes = registry.storage_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, 99);
    }

    #[test]
    fn update_unknown_node_is_a_noop() {
        let registry = NodeRegistry::new();
        registry.register_storage(storage("10.0.0.1", 1));
        assert!(!registry.update_storage(storage("10.0.0.2", 1)));
        assert_eq!(registry.storage_count(), 1);

        let refreshed = storage("10.0.0.1", 1).with_stats(NodeResourceStats {
            cores: 8,
            ..Default::default()
        });
        assert!(registry.update_storage(refreshed));
        assert_eq!(registry.storage_nodes()[0].stats.map(|s| s.cores), Some(8));
    }

    #[test]
    fn second_client_is_rejected() {
        let registry = NodeRegistry::new();
        let first = NodeIdentity::new("127.0.0.1", 50000, 0, Role::Client);
        let second = NodeIdentity::new("127.0.0.1", 50001, 0, Role::Client);
        registry.attach_client(first.clone()).expect("attach");
        assert!(matches!(
            registry.attach_client(second.clone()),
            Err(DfsError::ClientAlreadyAttached(_))
        ));
        assert_eq!(registry.client(), Some(first.clone()));

        assert!(!registry.detach_client_if(&second));
        assert!(registry.detach_client_if(&first));
        registry.attach_client(second).expect("attach after detach");
        assert!(registry.detach_client().is_some());
        assert!(registry.client().is_none());
    }

    #[test]
    fn cluster_stats_count_hosts_once() {
        let registry = NodeRegistry::new();
        let stats = NodeResourceStats {
            cores: 2,
            free_memory: 3 * MIB,
            max_memory: 4 * MIB,
            runtime_memory: MIB,
            free_disk: 10 * MIB,
        };
        registry.register_storage(storage("10.0.0.1", 1).with_stats(stats));
        registry.register_storage(storage("10.0.0.1", 2).with_stats(stats));
        registry.register_storage(storage("10.0.0.2", 1).with_stats(stats));
        registry.register_storage(storage("10.0.0.3", 1));

        let cluster = registry.cluster_stats();
        assert_eq!(cluster.hosts, 3);
        assert_eq!(cluster.totals.cores, 4);
        let lines = cluster.render();
        assert_eq!(lines[0], "Current connected system count: 3");
        assert_eq!(lines[5], "Current free disk space (MB): 20");
    }

    #[test]
    fn concurrent_registration_keeps_every_node() {
        let registry = Arc::new(NodeRegistry::new());
        let handles: Vec<_> = (0..8u16)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for n in 0..25 {
                        registry.register_storage(storage("10.0.0.1", worker * 100 + n));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        assert_eq!(registry.storage_count(), 200);
    }
}
