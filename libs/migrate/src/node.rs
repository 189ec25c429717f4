//! Node identities and the database capability the engine drives.
//!
//! The engine never speaks a wire protocol itself. It issues typed
//! [`Statement`]s over a [`NodeSession`] obtained from a [`NodeConnector`];
//! the implementation renders them for its database and reports results as
//! text rows.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NodeError;

/// Identifier of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub i32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Connection string of a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self(conninfo.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which end of a move a session talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Dest,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => write!(f, "source"),
            Side::Dest => write!(f, "dest"),
        }
    }
}

/// A write-ahead log position, written `X/Y` in hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

/// Failure to parse an [`Lsn`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid LSN: {0:?}")]
pub struct ParseLsnError(String);

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseLsnError(s.to_string());
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Self((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// One column of a relation definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
}

/// A management statement issued by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Disable a subscription. Rejected with `undefined_object` if absent.
    DisableSubscription { subscription: String },

    /// Publish one table. Rejected with `duplicate_object` if present.
    CreatePublication { publication: String, table: String },

    /// Create a logical replication slot. Rejected with `duplicate_object` if present.
    CreateReplicationSlot { slot: String },

    /// One row per column: `(name, type)`.
    DescribeColumns { table: String },

    /// Create the table unless it exists.
    CreateTable { table: String, columns: Vec<ColumnDef> },

    /// Asynchronous subscription over an existing slot.
    CreateSubscription {
        subscription: String,
        publication: String,
        slot: String,
        source: Endpoint,
    },

    /// Enable a subscription.
    EnableSubscription { subscription: String },

    /// One row with the relation sync state (NULL until known); no rows if
    /// the subscription does not exist.
    InitialSyncState { subscription: String },

    /// Lock the table for the rest of the session's transaction and return
    /// one row with the current WAL position.
    LockAndReadLsn { table: String },

    /// One row, `true` while this session still holds the lock taken by
    /// [`Statement::LockAndReadLsn`] on the table.
    CutoverLockHeld { table: String },

    /// One row with the position the subscription has applied (NULL until
    /// known); no rows if the subscription does not exist.
    AppliedLsn { subscription: String },

    /// Hash-partition a relation in its own transaction.
    PartitionTable {
        relation: String,
        expression: String,
        partitions_count: u32,
    },

    /// One row, `true` if the relation is already partitioned.
    IsPartitioned { relation: String },

    /// One row with the DDL to recreate the relation from `conninfo`.
    TableDefinition { relation: String, conninfo: Endpoint },
}

/// Statement discriminant, for logs and accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    DisableSubscription,
    CreatePublication,
    CreateReplicationSlot,
    DescribeColumns,
    CreateTable,
    CreateSubscription,
    EnableSubscription,
    InitialSyncState,
    LockAndReadLsn,
    CutoverLockHeld,
    AppliedLsn,
    PartitionTable,
    IsPartitioned,
    TableDefinition,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DisableSubscription => "disable_subscription",
            Self::CreatePublication => "create_publication",
            Self::CreateReplicationSlot => "create_replication_slot",
            Self::DescribeColumns => "describe_columns",
            Self::CreateTable => "create_table",
            Self::CreateSubscription => "create_subscription",
            Self::EnableSubscription => "enable_subscription",
            Self::InitialSyncState => "initial_sync_state",
            Self::LockAndReadLsn => "lock_and_read_lsn",
            Self::CutoverLockHeld => "cutover_lock_held",
            Self::AppliedLsn => "applied_lsn",
            Self::PartitionTable => "partition_table",
            Self::IsPartitioned => "is_partitioned",
            Self::TableDefinition => "table_definition",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Statement {
    pub fn kind(&self) -> StatementKind {
        match self {
            Self::DisableSubscription { .. } => StatementKind::DisableSubscription,
            Self::CreatePublication { .. } => StatementKind::CreatePublication,
            Self::CreateReplicationSlot { .. } => StatementKind::CreateReplicationSlot,
            Self::DescribeColumns { .. } => StatementKind::DescribeColumns,
            Self::CreateTable { .. } => StatementKind::CreateTable,
            Self::CreateSubscription { .. } => StatementKind::CreateSubscription,
            Self::EnableSubscription { .. } => StatementKind::EnableSubscription,
            Self::InitialSyncState { .. } => StatementKind::InitialSyncState,
            Self::LockAndReadLsn { .. } => StatementKind::LockAndReadLsn,
            Self::CutoverLockHeld { .. } => StatementKind::CutoverLockHeld,
            Self::AppliedLsn { .. } => StatementKind::AppliedLsn,
            Self::PartitionTable { .. } => StatementKind::PartitionTable,
            Self::IsPartitioned { .. } => StatementKind::IsPartitioned,
            Self::TableDefinition { .. } => StatementKind::TableDefinition,
        }
    }
}

/// Result rows of a statement, every value as text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRows {
    rows: Vec<Vec<Option<String>>>,
}

impl QueryRows {
    pub fn new(rows: Vec<Vec<Option<String>>>) -> Self {
        Self { rows }
    }

    /// No rows at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single row holding a single value.
    pub fn single(value: Option<String>) -> Self {
        Self {
            rows: vec![vec![value]],
        }
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row. `None` if there is no row or the value is NULL.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

/// An open management connection to one node.
#[async_trait]
pub trait NodeSession: Send + Sync {
    /// Node this session is connected to.
    fn node(&self) -> NodeId;

    /// Execute one statement. Statements on one session never overlap.
    async fn execute(&self, statement: &Statement) -> Result<QueryRows, NodeError>;
}

/// Opens management connections. Dropping the returned session closes it.
#[async_trait]
pub trait NodeConnector: Send + Sync {
    async fn connect(
        &self,
        node: NodeId,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn NodeSession>, NodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!("0/0".parse::<Lsn>().unwrap(), Lsn(0));
    }

    #[test]
    fn test_lsn_ordering() {
        let a: Lsn = "0/FFFFFFFF".parse().unwrap();
        let b: Lsn = "1/0".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_lsn_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("16B374D848".parse::<Lsn>().is_err());
        assert!("zz/1".parse::<Lsn>().is_err());
        assert!("1/2/3".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_query_rows_first_value() {
        assert_eq!(QueryRows::empty().first_value(), None);
        assert_eq!(QueryRows::single(None).first_value(), None);
        assert_eq!(QueryRows::single(Some("r".into())).first_value(), Some("r"));
    }

    #[test]
    fn test_node_id_parse() {
        assert_eq!(" 42 ".parse::<NodeId>().unwrap(), NodeId(42));
        assert!("node2".parse::<NodeId>().is_err());
    }
}
