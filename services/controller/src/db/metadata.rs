//! Cluster metadata stored in the `shardman` schema.

use async_trait::async_trait;
use pgshard_migrate::{ClusterMetadata, Endpoint, NodeId, ShardedTable, StoreError};
use sqlx::postgres::PgPool;
use tracing::debug;

use super::DbError;

/// [`ClusterMetadata`] backed by the metadata database.
#[derive(Clone)]
pub struct PgClusterMetadata {
    pool: PgPool,
}

impl PgClusterMetadata {
    /// Create a new metadata handle.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a node, or replace its connection string.
    pub async fn register_node(&self, node: NodeId, connstr: &str) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO shardman.nodes (id, connstr)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET connstr = EXCLUDED.connstr
            "#,
        )
        .bind(node.0)
        .bind(connstr)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(())
    }
}

#[async_trait]
impl ClusterMetadata for PgClusterMetadata {
    async fn partition_owner(&self, partition: &str) -> Result<Option<NodeId>, StoreError> {
        let owner: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT owner FROM shardman.partitions
            WHERE part_name = $1
            "#,
        )
        .bind(partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(owner.map(NodeId))
    }

    async fn node_endpoint(&self, node: NodeId) -> Result<Option<Endpoint>, StoreError> {
        let connstr: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT connstr FROM shardman.nodes
            WHERE id = $1
            "#,
        )
        .bind(node.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(connstr.flatten().map(Endpoint::new))
    }

    async fn record_partition_owner(
        &self,
        partition: &str,
        node: NodeId,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE shardman.partitions
            SET owner = $2
            WHERE part_name = $1
            "#,
        )
        .bind(partition)
        .bind(node.0)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::new(format!("partition {partition} not found")));
        }

        debug!(partition, owner = %node, "Recorded partition owner");
        Ok(())
    }

    async fn is_table_sharded(&self, relation: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (SELECT 1 FROM shardman.tables WHERE relation = $1)
            "#,
        )
        .bind(relation)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(exists)
    }

    async fn record_sharded_table(&self, table: &ShardedTable) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        sqlx::query(
            r#"
            INSERT INTO shardman.tables
                (relation, sharding_key, partitions_count, create_sql, initial_node)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&table.relation)
        .bind(&table.sharding_key)
        .bind(table.partitions_count as i32)
        .bind(&table.create_sql)
        .bind(table.initial_node.0)
        .execute(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        for i in 0..table.partitions_count {
            sqlx::query(
                r#"
                INSERT INTO shardman.partitions (part_name, relation, owner)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(format!("{}_{}", table.relation, i))
            .bind(&table.relation)
            .bind(table.initial_node.0)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }

        tx.commit().await.map_err(DbError::Query)?;
        Ok(())
    }
}
