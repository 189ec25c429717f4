//! Cluster metadata interface.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::node::{Endpoint, NodeId};

/// A table that has been hash-partitioned across the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardedTable {
    pub relation: String,
    pub sharding_key: String,
    pub partitions_count: u32,
    /// DDL that recreates the parent table on another node.
    pub create_sql: String,
    pub initial_node: NodeId,
}

/// Read and write access to cluster metadata.
#[async_trait]
pub trait ClusterMetadata: Send + Sync {
    /// Node currently owning the partition, if the partition is known.
    async fn partition_owner(&self, partition: &str) -> Result<Option<NodeId>, StoreError>;

    /// Connection endpoint of a node, if the node is known.
    async fn node_endpoint(&self, node: NodeId) -> Result<Option<Endpoint>, StoreError>;

    /// Make `node` the owner of `partition`.
    async fn record_partition_owner(&self, partition: &str, node: NodeId)
        -> Result<(), StoreError>;

    /// Returns true if the relation has already been hash-partitioned.
    async fn is_table_sharded(&self, relation: &str) -> Result<bool, StoreError>;

    /// Record a freshly partitioned table.
    async fn record_sharded_table(&self, table: &ShardedTable) -> Result<(), StoreError>;
}
