//! Migration task: one partition move and its resumable state.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::cancel::CancelReason;
use crate::clock;
use crate::error::MigrateError;
use crate::metadata::ClusterMetadata;
use crate::node::{ColumnDef, Endpoint, Lsn, NodeId, NodeSession, Side};

/// Step of the migration protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Open management connections to source and destination.
    Init,
    /// Make sure no stale subscription is active on the destination.
    DisableDestSubscription,
    /// Publication and replication slot on the source.
    EnsureSourcePublication,
    /// Destination table and asynchronous subscription.
    EnsureDestTableAndSubscription,
    /// Poll until the initial table copy has finished.
    WaitInitialSync,
    /// Block writes on the source and record the cutover position.
    LockSourceAndMarkCutover,
    /// Poll until the destination has applied the cutover position.
    WaitFinalSync,
    /// Record the new owner.
    Finalize,
    /// The move completed.
    Done,
    /// The move failed.
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::DisableDestSubscription => "disable_dest_subscription",
            Phase::EnsureSourcePublication => "ensure_source_publication",
            Phase::EnsureDestTableAndSubscription => "ensure_dest_table_and_subscription",
            Phase::WaitInitialSync => "wait_initial_sync",
            Phase::LockSourceAndMarkCutover => "lock_source_and_mark_cutover",
            Phase::WaitFinalSync => "wait_final_sync",
            Phase::Finalize => "finalize",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveResult {
    InProgress,
    Success,
    Failed,
}

impl MoveResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MoveResult::InProgress)
    }
}

/// Why a move failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No node owns the partition.
    UnknownPartition,
    /// The destination node is not in the cluster.
    UnknownNode,
    /// An object the move depends on disappeared or is unusable.
    Permanent(String),
    /// The batch was stopped before the move finished.
    Cancelled(CancelReason),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnknownPartition => write!(f, "unknown partition"),
            FailureReason::UnknownNode => write!(f, "unknown node"),
            FailureReason::Permanent(detail) => write!(f, "{detail}"),
            FailureReason::Cancelled(reason) => write!(f, "cancelled: {reason}"),
        }
    }
}

/// Handle of a registration in the scheduler's readiness table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(pub u64);

/// How a task is currently waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Re-invoke at `wake_at` even without any readiness event.
    Sleeping { wake_at: Instant },
    /// Re-invoke when the outstanding request behind `registration` completes.
    Socket { registration: Registration },
    /// Terminal; never invoked again.
    Idle,
}

impl WaitMode {
    pub fn wake_at(&self) -> Option<Instant> {
        match self {
            WaitMode::Sleeping { wake_at } => Some(*wake_at),
            _ => None,
        }
    }

    pub fn registration(&self) -> Option<Registration> {
        match self {
            WaitMode::Socket { registration } => Some(*registration),
            _ => None,
        }
    }
}

/// Resolved endpoints of a move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub source_node: NodeId,
    pub source_conn: Endpoint,
    pub dest_conn: Endpoint,
}

/// Protocol state owned by the phase engine between invocations.
#[derive(Default)]
pub(crate) struct ProtocolState {
    pub(crate) source: Option<Arc<dyn NodeSession>>,
    pub(crate) dest: Option<Arc<dyn NodeSession>>,
    /// Statement cursor within the current phase.
    pub(crate) step: u8,
    pub(crate) columns: Vec<ColumnDef>,
    pub(crate) cutover_lsn: Option<Lsn>,
    pub(crate) consecutive_failures: u32,
    pub(crate) transient_failures: u32,
    pub(crate) polls: u32,
}

impl ProtocolState {
    pub(crate) fn session(&self, side: Side) -> Option<&Arc<dyn NodeSession>> {
        match side {
            Side::Source => self.source.as_ref(),
            Side::Dest => self.dest.as_ref(),
        }
    }

    pub(crate) fn drop_session(&mut self, side: Side) {
        match side {
            Side::Source => self.source = None,
            Side::Dest => self.dest = None,
        }
    }

    /// Drops both sessions. Returns true if any was open.
    pub(crate) fn close_sessions(&mut self) -> bool {
        let had_any = self.source.is_some() || self.dest.is_some();
        self.source = None;
        self.dest = None;
        had_any
    }
}

/// One partition move in progress.
pub struct MigrationTask {
    partition: String,
    dest_node: NodeId,
    route: Option<Route>,
    pub(crate) phase: Phase,
    wait: WaitMode,
    result: MoveResult,
    pub(crate) failure: Option<FailureReason>,
    pub(crate) state: ProtocolState,
}

impl MigrationTask {
    /// Resolve a move of `partition` to `dest_node` against cluster metadata.
    ///
    /// Unknown partitions and nodes produce a task that has already failed.
    /// A source owner without an endpoint is an inconsistency and aborts.
    pub async fn resolve(
        metadata: &dyn ClusterMetadata,
        partition: &str,
        dest_node: NodeId,
    ) -> Result<Self, MigrateError> {
        let Some(source_node) = metadata.partition_owner(partition).await? else {
            warn!(partition = %partition, "Partition doesn't exist, not moving it");
            return Ok(Self::failed(partition, dest_node, FailureReason::UnknownPartition));
        };

        let Some(dest_conn) = metadata.node_endpoint(dest_node).await? else {
            warn!(
                partition = %partition,
                dest_node = %dest_node,
                "Destination node doesn't exist, not moving partition"
            );
            return Ok(Self::failed(partition, dest_node, FailureReason::UnknownNode));
        };

        // The owner comes from live ownership data, so it must have an endpoint.
        let source_conn = metadata
            .node_endpoint(source_node)
            .await?
            .ok_or_else(|| MigrateError::Inconsistent {
                partition: partition.to_string(),
                node: source_node,
            })?;

        info!(
            partition = %partition,
            source_node = %source_node,
            dest_node = %dest_node,
            "Resolved partition move"
        );

        Ok(Self::new(
            partition,
            dest_node,
            Route {
                source_node,
                source_conn,
                dest_conn,
            },
        ))
    }

    /// A resolved task, ready to run immediately.
    pub fn new(partition: &str, dest_node: NodeId, route: Route) -> Self {
        Self {
            partition: partition.to_string(),
            dest_node,
            route: Some(route),
            phase: Phase::Init,
            wait: WaitMode::Sleeping {
                wake_at: clock::now(),
            },
            result: MoveResult::InProgress,
            failure: None,
            state: ProtocolState::default(),
        }
    }

    /// A task that failed before doing anything.
    pub fn failed(partition: &str, dest_node: NodeId, reason: FailureReason) -> Self {
        Self {
            partition: partition.to_string(),
            dest_node,
            route: None,
            phase: Phase::Failed,
            wait: WaitMode::Idle,
            result: MoveResult::Failed,
            failure: Some(reason),
            state: ProtocolState::default(),
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn dest_node(&self) -> NodeId {
        self.dest_node
    }

    pub fn source_node(&self) -> Option<NodeId> {
        self.route.as_ref().map(|r| r.source_node)
    }

    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn wait(&self) -> WaitMode {
        self.wait
    }

    pub fn result(&self) -> MoveResult {
        self.result
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.result.is_terminal()
    }

    /// Cutover position recorded under the source lock, once taken.
    pub fn cutover_lsn(&self) -> Option<Lsn> {
        self.state.cutover_lsn
    }

    pub fn has_open_sessions(&self) -> bool {
        self.state.source.is_some() || self.state.dest.is_some()
    }

    /// Transient failures retried so far.
    pub fn transient_failures(&self) -> u32 {
        self.state.transient_failures
    }

    /// Sync polls issued so far.
    pub fn polls(&self) -> u32 {
        self.state.polls
    }

    pub(crate) fn set_wait(&mut self, wait: WaitMode) {
        debug_assert!(!self.is_terminal(), "terminal task cannot wait");
        self.wait = wait;
    }

    /// Record a terminal result. Results never change once terminal.
    pub(crate) fn complete(&mut self, result: MoveResult) {
        if self.is_terminal() {
            return;
        }
        self.result = result;
        self.wait = WaitMode::Idle;
        if result == MoveResult::Failed && self.phase != Phase::Failed {
            self.phase = Phase::Failed;
        }
    }

    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            partition: self.partition.clone(),
            source_node: self.source_node(),
            dest_node: self.dest_node,
            result: self.result,
            failure: self.failure.clone(),
            transient_failures: self.state.transient_failures,
            polls: self.state.polls,
        }
    }
}

impl fmt::Debug for MigrationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationTask")
            .field("partition", &self.partition)
            .field("dest_node", &self.dest_node)
            .field("route", &self.route)
            .field("phase", &self.phase)
            .field("wait", &self.wait)
            .field("result", &self.result)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

/// Final report for one move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub partition: String,
    pub source_node: Option<NodeId>,
    pub dest_node: NodeId,
    pub result: MoveResult,
    pub failure: Option<FailureReason>,
    pub transient_failures: u32,
    pub polls: u32,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;
    use crate::metadata::ShardedTable;

    struct StaticMetadata {
        owners: HashMap<String, NodeId>,
        endpoints: HashMap<NodeId, Endpoint>,
    }

    #[async_trait]
    impl ClusterMetadata for StaticMetadata {
        async fn partition_owner(&self, partition: &str) -> Result<Option<NodeId>, StoreError> {
            Ok(self.owners.get(partition).copied())
        }

        async fn node_endpoint(&self, node: NodeId) -> Result<Option<Endpoint>, StoreError> {
            Ok(self.endpoints.get(&node).cloned())
        }

        async fn record_partition_owner(&self, _: &str, _: NodeId) -> Result<(), StoreError> {
            Ok(())
        }

        async fn is_table_sharded(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn record_sharded_table(&self, _: &ShardedTable) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn metadata() -> StaticMetadata {
        StaticMetadata {
            owners: HashMap::from([
                ("p1".to_string(), NodeId(1)),
                ("orphan".to_string(), NodeId(7)),
            ]),
            endpoints: HashMap::from([
                (NodeId(1), Endpoint::new("host=node1")),
                (NodeId(2), Endpoint::new("host=node2")),
            ]),
        }
    }

    #[tokio::test]
    async fn test_resolve_ready_task() {
        let task = MigrationTask::resolve(&metadata(), "p1", NodeId(2)).await.unwrap();

        assert_eq!(task.phase(), Phase::Init);
        assert_eq!(task.result(), MoveResult::InProgress);
        assert_eq!(task.source_node(), Some(NodeId(1)));
        let route = task.route().unwrap();
        assert_eq!(route.source_conn.as_str(), "host=node1");
        assert_eq!(route.dest_conn.as_str(), "host=node2");
        assert!(task.wait().wake_at().is_some());
        assert!(task.wait().registration().is_none());
    }

    #[tokio::test]
    async fn test_resolve_unknown_partition() {
        let task = MigrationTask::resolve(&metadata(), "nope", NodeId(2)).await.unwrap();

        assert_eq!(task.result(), MoveResult::Failed);
        assert_eq!(task.failure(), Some(&FailureReason::UnknownPartition));
        assert!(task.route().is_none());
        assert_eq!(task.wait(), WaitMode::Idle);
    }

    #[tokio::test]
    async fn test_resolve_unknown_dest_node() {
        let task = MigrationTask::resolve(&metadata(), "p1", NodeId(99)).await.unwrap();

        assert_eq!(task.result(), MoveResult::Failed);
        assert_eq!(task.failure(), Some(&FailureReason::UnknownNode));
        assert!(task.source_node().is_none());
    }

    #[tokio::test]
    async fn test_resolve_owner_without_endpoint_is_fatal() {
        let err = MigrationTask::resolve(&metadata(), "orphan", NodeId(2))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrateError::Inconsistent { node: NodeId(7), .. }
        ));
    }

    #[test]
    fn test_complete_is_monotonic() {
        let mut task = MigrationTask::failed("p1", NodeId(2), FailureReason::UnknownNode);
        task.complete(MoveResult::Success);
        assert_eq!(task.result(), MoveResult::Failed);
    }
}
