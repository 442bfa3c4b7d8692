//! Cluster-controller view consumed by the data tier.
//!
//! The controller itself is an external collaborator; partitions only
//! need their replica set (leader first) refreshed from it. Tests plug
//! in a static view.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{DataNodeError, DataNodeResult};

/// Source of replica sets for data partitions.
pub trait ClusterView: Send + Sync {
    /// Replica hosts for `partition_id`, leader at index 0.
    fn data_partition_hosts(&self, partition_id: u32) -> DataNodeResult<Vec<String>>;

    /// This node's own serving address, used to decide leadership.
    fn local_addr(&self) -> String;
}

/// Fixed replica map, for tests and single-node deployments.
pub struct StaticClusterView {
    local: String,
    hosts: RwLock<HashMap<u32, Vec<String>>>,
}

impl StaticClusterView {
    /// Creates a view serving from `local`.
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            hosts: RwLock::new(HashMap::new()),
        }
    }

    /// Sets the replica set for a partition, leader first.
    pub fn set_hosts(&self, partition_id: u32, hosts: Vec<String>) {
        self.hosts.write().unwrap().insert(partition_id, hosts);
    }
}

impl ClusterView for StaticClusterView {
    fn data_partition_hosts(&self, partition_id: u32) -> DataNodeResult<Vec<String>> {
        self.hosts
            .read()
            .unwrap()
            .get(&partition_id)
            .cloned()
            .ok_or(DataNodeError::PartitionNotFound(partition_id))
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_view() {
        let view = StaticClusterView::new("10.0.0.1:17030");
        view.set_hosts(1, vec!["10.0.0.1:17030".into(), "10.0.0.2:17030".into()]);
        let hosts = view.data_partition_hosts(1).unwrap();
        assert_eq!(hosts[0], "10.0.0.1:17030");
        assert!(view.data_partition_hosts(2).is_err());
    }
}
