//! Replica placement policies.

use rand::seq::SliceRandom;

use crate::error::{DfsError, DfsResult};
use crate::identity::NodeIdentity;
use crate::namespace::FileRecord;

/// Decides where new blocks live and which replica serves a read.
pub trait PlacementPolicy: Send + Sync {
    /// Picks the nodes that will host a new block.
    fn place(&self, candidates: &[NodeIdentity]) -> DfsResult<Vec<NodeIdentity>>;

    /// Picks the replica a read is sent to. Defaults to the first replica in
    /// placement order.
    fn read_target(&self, record: &FileRecord) -> Option<NodeIdentity> {
        record.replicas().into_iter().next()
    }
}

/// Chooses up to `replication_factor` distinct nodes uniformly at random.
#[derive(Debug, Clone, Copy)]
pub struct RandomPlacement {
    replication_factor: usize,
}

impl RandomPlacement {
    /// A factor of zero is treated as one.
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor: replication_factor.max(1),
        }
    }

    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

impl PlacementPolicy for RandomPlacement {
    fn place(&self, candidates: &[NodeIdentity]) -> DfsResult<Vec<NodeIdentity>> {
        if candidates.is_empty() {
            return Err(DfsError::NoStorageAvailable);
        }
        let mut rng = rand::thread_rng();
        Ok(candidates
            .choose_multiple(&mut rng, self.replication_factor)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::identity::Role;

    fn nodes(count: u16) -> Vec<NodeIdentity> {
        (0..count)
            .map(|port| NodeIdentity::new("127.0.0.1", 9000 + port, u64::from(port), Role::Storage))
            .collect()
    }

    #[test]
    fn empty_registry_has_no_placement() {
        let policy = RandomPlacement::new(2);
        assert!(matches!(policy.place(&[]), Err(DfsError::NoStorageAvailable)));
    }

    #[test]
    fn picks_distinct_nodes_up_to_factor() {
        let policy = RandomPlacement::new(3);
        let candidates = nodes(5);
        for _ in 0..32 {
            let chosen = policy.place(&candidates).expect("place");
            assert_eq!(chosen.len(), 3);
            let ports: HashSet<u16> = chosen.iter().map(|node| node.port).collect();
            assert_eq!(ports.len(), 3);
        }
    }

    #[test]
    fn fewer_nodes_than_factor_uses_all_of_them() {
        let policy = RandomPlacement::new(4);
        let chosen = policy.place(&nodes(2)).expect("place");
        assert_eq!(chosen.len(), 2);
    }

    #[test]
    fn zero_factor_still_places_one_replica() {
        let policy = RandomPlacement::new(0);
        assert_eq!(policy.replication_factor(), 1);
        assert_eq!(policy.place(&nodes(3)).expect("place").len(), 1);
    }
}
