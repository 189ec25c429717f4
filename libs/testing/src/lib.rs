//! Simulated cluster for migration tests.
//!
//! [`SimCluster`] implements every capability the migration engine needs
//! (cluster metadata, command queue, node connections) against in-memory
//! state. Nodes keep tables, publications, slots and subscriptions, so setup
//! statements behave idempotently the way a real node does. Faults can be
//! injected per connection target or per statement kind, and every connect
//! and statement is recorded for assertions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use pgshard_migrate::error::sqlstate;
use pgshard_migrate::{
    ClusterMetadata, Cmd, ColumnDef, CommandId, CommandQueue, CommandStatus, Endpoint, Lsn,
    NodeConnector, NodeError, NodeId, NodeSession, QueryRows, ShardedTable, Statement,
    StatementKind, StoreError,
};

/// SQLSTATE `lock_not_available`.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE `raise_exception`, used for refused partitioning.
const RAISE_EXCEPTION: &str = "P0001";

/// WAL position every simulated node starts at.
const INITIAL_WAL: u64 = 0x16B_3748;

/// WAL bytes written by each statement a node executes.
const WAL_PER_STATEMENT: u64 = 0x28;

/// Where an injected fault fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultTarget {
    /// Connecting to the node.
    Connect(NodeId),
    /// Executing a statement of this kind on the node.
    Statement(NodeId, StatementKind),
}

/// One statement execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedStatement {
    pub node: NodeId,
    pub session: u64,
    pub statement: Statement,
}

#[derive(Debug)]
struct Fault {
    target: FaultTarget,
    error: NodeError,
    remaining: u32,
}

#[derive(Debug, Clone)]
struct SimSubscription {
    enabled: bool,
    source: Endpoint,
    sync_polls: u32,
    apply_polls: u32,
}

#[derive(Debug)]
struct SimNode {
    endpoint: Endpoint,
    up: bool,
    tables: BTreeMap<String, Vec<ColumnDef>>,
    partitioned: BTreeSet<String>,
    /// Publication name to published table.
    publications: BTreeMap<String, String>,
    slots: BTreeSet<String>,
    subscriptions: BTreeMap<String, SimSubscription>,
    /// Table name to the session holding its lock.
    locks: HashMap<String, u64>,
    wal_lsn: u64,
    /// Open session IDs.
    sessions: BTreeSet<u64>,
    /// Sessions cut off by the node going down; they fail until dropped.
    severed: BTreeSet<u64>,
}

impl SimNode {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            up: true,
            tables: BTreeMap::new(),
            partitioned: BTreeSet::new(),
            publications: BTreeMap::new(),
            slots: BTreeSet::new(),
            subscriptions: BTreeMap::new(),
            locks: HashMap::new(),
            wal_lsn: INITIAL_WAL,
            sessions: BTreeSet::new(),
            severed: BTreeSet::new(),
        }
    }
}

#[derive(Debug)]
struct ClusterState {
    nodes: BTreeMap<NodeId, SimNode>,
    owners: HashMap<String, NodeId>,
    sharded: BTreeMap<String, ShardedTable>,
    statuses: Vec<(CommandId, CommandStatus)>,
    faults: Vec<Fault>,
    executed: Vec<ExecutedStatement>,
    connects: Vec<NodeId>,
    owner_writes: usize,
    owner_write_failures: u32,
    initial_sync_polls: u32,
    final_sync_polls: u32,
}

impl ClusterState {
    /// Consume one charge of a fault matching `target`, if any.
    fn take_fault(&mut self, target: FaultTarget) -> Option<NodeError> {
        let fault = self
            .faults
            .iter_mut()
            .find(|f| f.target == target && f.remaining > 0)?;
        fault.remaining -= 1;
        Some(fault.error.clone())
    }

    fn node_by_endpoint(&self, endpoint: &Endpoint) -> Option<&SimNode> {
        self.nodes.values().find(|n| &n.endpoint == endpoint)
    }
}

fn lock(state: &Mutex<ClusterState>) -> MutexGuard<'_, ClusterState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn undefined_table(table: &str) -> NodeError {
    NodeError::rejected(
        sqlstate::UNDEFINED_TABLE,
        format!("relation \"{table}\" does not exist"),
    )
}

fn undefined_subscription(subscription: &str) -> NodeError {
    NodeError::rejected(
        sqlstate::UNDEFINED_OBJECT,
        format!("subscription \"{subscription}\" does not exist"),
    )
}

fn duplicate(what: &str, name: &str) -> NodeError {
    NodeError::rejected(
        sqlstate::DUPLICATE_OBJECT,
        format!("{what} \"{name}\" already exists"),
    )
}

/// In-memory cluster implementing metadata, command queue and node access.
#[derive(Clone)]
pub struct SimCluster {
    state: Arc<Mutex<ClusterState>>,
    sessions: Arc<AtomicU64>,
    latency: Duration,
}

impl SimCluster {
    /// An empty cluster. Sync completes on the first poll.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                nodes: BTreeMap::new(),
                owners: HashMap::new(),
                sharded: BTreeMap::new(),
                statuses: Vec::new(),
                faults: Vec::new(),
                executed: Vec::new(),
                connects: Vec::new(),
                owner_writes: 0,
                owner_write_failures: 0,
                initial_sync_polls: 1,
                final_sync_polls: 1,
            })),
            sessions: Arc::new(AtomicU64::new(0)),
            latency: Duration::from_millis(1),
        }
    }

    /// Simulated round-trip time of every connect and statement.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// A cluster with nodes `1..=nodes`.
    pub fn with_nodes(nodes: i32) -> Self {
        let cluster = Self::new();
        for id in 1..=nodes {
            cluster.add_node(NodeId(id));
        }
        cluster
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        lock(&self.state)
    }

    // =========================================================================
    // Setup
    // =========================================================================

    pub fn endpoint_of(node: NodeId) -> Endpoint {
        Endpoint::new(format!("host=node{node} port=5432 dbname=shardman"))
    }

    pub fn add_node(&self, node: NodeId) {
        self.state()
            .nodes
            .insert(node, SimNode::new(Self::endpoint_of(node)));
    }

    /// Create the partition table on `owner` and record the ownership.
    pub fn add_partition(&self, partition: &str, owner: NodeId) {
        let mut state = self.state();
        if let Some(node) = state.nodes.get_mut(&owner) {
            node.tables.insert(partition.to_string(), default_columns());
        }
        state.owners.insert(partition.to_string(), owner);
    }

    /// Record an ownership that points at a node with no endpoint.
    pub fn add_dangling_partition(&self, partition: &str, owner: NodeId) {
        self.state().owners.insert(partition.to_string(), owner);
    }

    /// Create a plain table on a node without recording any ownership.
    pub fn create_table(&self, node: NodeId, table: &str) {
        if let Some(node) = self.state().nodes.get_mut(&node) {
            node.tables.insert(table.to_string(), default_columns());
        }
    }

    pub fn drop_table(&self, node: NodeId, table: &str) {
        if let Some(node) = self.state().nodes.get_mut(&node) {
            node.tables.remove(table);
        }
    }

    /// Mark a node reachable or not. Taking a node down ends every session
    /// open on it: their locks are released and they fail with I/O errors
    /// from then on, even once the node is back.
    pub fn set_node_up(&self, node: NodeId, up: bool) {
        if let Some(sim_node) = self.state().nodes.get_mut(&node) {
            sim_node.up = up;
            if !up {
                sim_node.locks.clear();
                let open = sim_node.sessions.clone();
                sim_node.severed.extend(open);
                debug!(node = %node, "[SIM] Node down, sessions severed");
            }
        }
    }

    /// Fail the next `times` matching operations with `error`.
    pub fn inject(&self, target: FaultTarget, error: NodeError, times: u32) {
        self.state().faults.push(Fault {
            target,
            error,
            remaining: times,
        });
    }

    /// Fail the next `times` ownership writes.
    pub fn fail_owner_writes(&self, times: u32) {
        self.state().owner_write_failures = times;
    }

    /// Polls needed before a subscription reports its initial copy done.
    pub fn set_initial_sync_polls(&self, polls: u32) {
        self.state().initial_sync_polls = polls;
    }

    /// Polls needed before a subscription reports the source position applied.
    pub fn set_final_sync_polls(&self, polls: u32) {
        self.state().final_sync_polls = polls;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn owner(&self, partition: &str) -> Option<NodeId> {
        self.state().owners.get(partition).copied()
    }

    pub fn owner_writes(&self) -> usize {
        self.state().owner_writes
    }

    /// Every status written for `id`, in order.
    pub fn statuses(&self, id: CommandId) -> Vec<CommandStatus> {
        self.state()
            .statuses
            .iter()
            .filter(|(cmd, _)| *cmd == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn last_status(&self, id: CommandId) -> Option<CommandStatus> {
        self.statuses(id).last().copied()
    }

    /// Connection attempts, including failed ones.
    pub fn connects(&self) -> usize {
        self.state().connects.len()
    }

    pub fn connects_to(&self, node: NodeId) -> usize {
        self.state().connects.iter().filter(|n| **n == node).count()
    }

    /// Sessions currently open across the cluster.
    pub fn open_sessions(&self) -> usize {
        self.state().nodes.values().map(|n| n.sessions.len()).sum()
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state().executed.clone()
    }

    /// Execution attempts of `kind` on `node`, including injected failures.
    pub fn executed_count(&self, node: NodeId, kind: StatementKind) -> usize {
        self.state()
            .executed
            .iter()
            .filter(|e| e.node == node && e.statement.kind() == kind)
            .count()
    }

    pub fn has_table(&self, node: NodeId, table: &str) -> bool {
        self.with_node(node, |n| n.tables.contains_key(table))
    }

    pub fn has_publication(&self, node: NodeId, publication: &str) -> bool {
        self.with_node(node, |n| n.publications.contains_key(publication))
    }

    pub fn has_slot(&self, node: NodeId, slot: &str) -> bool {
        self.with_node(node, |n| n.slots.contains(slot))
    }

    pub fn has_subscription(&self, node: NodeId, subscription: &str) -> bool {
        self.with_node(node, |n| n.subscriptions.contains_key(subscription))
    }

    pub fn subscription_enabled(&self, node: NodeId, subscription: &str) -> bool {
        self.with_node(node, |n| {
            n.subscriptions
                .get(subscription)
                .is_some_and(|s| s.enabled)
        })
    }

    pub fn is_locked(&self, node: NodeId, table: &str) -> bool {
        self.with_node(node, |n| n.locks.contains_key(table))
    }

    pub fn sharded_table(&self, relation: &str) -> Option<ShardedTable> {
        self.state().sharded.get(relation).cloned()
    }

    fn with_node(&self, node: NodeId, f: impl FnOnce(&SimNode) -> bool) -> bool {
        self.state().nodes.get(&node).is_some_and(f)
    }
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn default_columns() -> Vec<ColumnDef> {
    vec![
        ColumnDef {
            name: "id".to_string(),
            type_name: "bigint".to_string(),
        },
        ColumnDef {
            name: "payload".to_string(),
            type_name: "text".to_string(),
        },
    ]
}

// =============================================================================
// Metadata and command queue
// =============================================================================

#[async_trait]
impl ClusterMetadata for SimCluster {
    async fn partition_owner(&self, partition: &str) -> Result<Option<NodeId>, StoreError> {
        Ok(self.owner(partition))
    }

    async fn node_endpoint(&self, node: NodeId) -> Result<Option<Endpoint>, StoreError> {
        Ok(self.state().nodes.get(&node).map(|n| n.endpoint.clone()))
    }

    async fn record_partition_owner(
        &self,
        partition: &str,
        node: NodeId,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.latency).await;

        let mut state = self.state();
        if state.owner_write_failures > 0 {
            state.owner_write_failures -= 1;
            return Err(StoreError::new("metadata database unavailable"));
        }
        state.owner_writes += 1;
        state.owners.insert(partition.to_string(), node);
        debug!(partition = %partition, owner = %node, "[SIM] Ownership recorded");
        Ok(())
    }

    async fn is_table_sharded(&self, relation: &str) -> Result<bool, StoreError> {
        Ok(self.state().sharded.contains_key(relation))
    }

    async fn record_sharded_table(&self, table: &ShardedTable) -> Result<(), StoreError> {
        let mut state = self.state();
        for index in 0..table.partitions_count {
            state
                .owners
                .insert(format!("{}_{index}", table.relation), table.initial_node);
        }
        state.sharded.insert(table.relation.clone(), table.clone());
        Ok(())
    }
}

#[async_trait]
impl CommandQueue for SimCluster {
    async fn update_status(&self, id: CommandId, status: CommandStatus) -> Result<(), StoreError> {
        self.state().statuses.push((id, status));
        Ok(())
    }

    async fn cancel(&self, cmd: &Cmd) -> Result<(), StoreError> {
        self.state().statuses.push((cmd.id, CommandStatus::Canceled));
        Ok(())
    }
}

// =============================================================================
// Node sessions
// =============================================================================

#[async_trait]
impl NodeConnector for SimCluster {
    async fn connect(
        &self,
        node: NodeId,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn NodeSession>, NodeError> {
        tokio::time::sleep(self.latency).await;

        let mut state = self.state();
        state.connects.push(node);
        if let Some(err) = state.take_fault(FaultTarget::Connect(node)) {
            return Err(err);
        }
        let Some(sim_node) = state.nodes.get_mut(&node) else {
            return Err(NodeError::Connect(format!("unknown node {node}")));
        };
        if !sim_node.up || &sim_node.endpoint != endpoint {
            return Err(NodeError::Connect(format!(
                "could not connect to server at \"{endpoint}\""
            )));
        }
        let id = self.sessions.fetch_add(1, Ordering::SeqCst);
        sim_node.sessions.insert(id);

        debug!(node = %node, session = id, "[SIM] Session opened");
        Ok(Arc::new(SimSession {
            id,
            node,
            state: self.state.clone(),
            latency: self.latency,
        }))
    }
}

/// A session to one simulated node. Dropping it closes it and releases its locks.
struct SimSession {
    id: u64,
    node: NodeId,
    state: Arc<Mutex<ClusterState>>,
    latency: Duration,
}

impl Drop for SimSession {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if let Some(node) = state.nodes.get_mut(&self.node) {
            node.sessions.remove(&self.id);
            node.severed.remove(&self.id);
            node.locks.retain(|_, holder| *holder != self.id);
        }
        debug!(node = %self.node, session = self.id, "[SIM] Session closed");
    }
}

#[async_trait]
impl NodeSession for SimSession {
    fn node(&self) -> NodeId {
        self.node
    }

    async fn execute(&self, statement: &Statement) -> Result<QueryRows, NodeError> {
        tokio::time::sleep(self.latency).await;

        let mut state = lock(&self.state);
        state.executed.push(ExecutedStatement {
            node: self.node,
            session: self.id,
            statement: statement.clone(),
        });

        if let Some(err) = state.take_fault(FaultTarget::Statement(self.node, statement.kind())) {
            return Err(err);
        }

        let initial_sync_polls = state.initial_sync_polls;
        let final_sync_polls = state.final_sync_polls;

        // Applied position comes from the publishing node.
        let source_wal = match statement {
            Statement::AppliedLsn { subscription } => state
                .nodes
                .get(&self.node)
                .and_then(|n| n.subscriptions.get(subscription))
                .and_then(|s| state.node_by_endpoint(&s.source))
                .map(|n| n.wal_lsn),
            _ => None,
        };

        let node = match state.nodes.get_mut(&self.node) {
            Some(node) if node.up && !node.severed.contains(&self.id) => node,
            _ => return Err(NodeError::Io("server closed the connection unexpectedly".into())),
        };
        node.wal_lsn += WAL_PER_STATEMENT;

        match statement {
            Statement::DisableSubscription { subscription } => {
                let sub = node
                    .subscriptions
                    .get_mut(subscription)
                    .ok_or_else(|| undefined_subscription(subscription))?;
                sub.enabled = false;
                Ok(QueryRows::empty())
            }
            Statement::CreatePublication { publication, table } => {
                if !node.tables.contains_key(table) {
                    return Err(undefined_table(table));
                }
                if node.publications.contains_key(publication) {
                    return Err(duplicate("publication", publication));
                }
                node.publications.insert(publication.clone(), table.clone());
                Ok(QueryRows::empty())
            }
            Statement::CreateReplicationSlot { slot } => {
                if !node.slots.insert(slot.clone()) {
                    return Err(duplicate("replication slot", slot));
                }
                Ok(QueryRows::empty())
            }
            Statement::DescribeColumns { table } => {
                let columns = node.tables.get(table).ok_or_else(|| undefined_table(table))?;
                Ok(QueryRows::new(
                    columns
                        .iter()
                        .map(|c| vec![Some(c.name.clone()), Some(c.type_name.clone())])
                        .collect(),
                ))
            }
            Statement::CreateTable { table, columns } => {
                node.tables
                    .entry(table.clone())
                    .or_insert_with(|| columns.clone());
                Ok(QueryRows::empty())
            }
            Statement::CreateSubscription {
                subscription,
                source,
                ..
            } => {
                if node.subscriptions.contains_key(subscription) {
                    return Err(duplicate("subscription", subscription));
                }
                node.subscriptions.insert(
                    subscription.clone(),
                    SimSubscription {
                        enabled: true,
                        source: source.clone(),
                        sync_polls: 0,
                        apply_polls: 0,
                    },
                );
                Ok(QueryRows::empty())
            }
            Statement::EnableSubscription { subscription } => {
                let sub = node
                    .subscriptions
                    .get_mut(subscription)
                    .ok_or_else(|| undefined_subscription(subscription))?;
                sub.enabled = true;
                Ok(QueryRows::empty())
            }
            Statement::InitialSyncState { subscription } => {
                let Some(sub) = node.subscriptions.get_mut(subscription) else {
                    return Ok(QueryRows::empty());
                };
                if !sub.enabled {
                    return Ok(QueryRows::single(None));
                }
                sub.sync_polls += 1;
                let sync_state = if sub.sync_polls >= initial_sync_polls {
                    "r"
                } else {
                    "d"
                };
                Ok(QueryRows::single(Some(sync_state.to_string())))
            }
            Statement::LockAndReadLsn { table } => {
                if !node.tables.contains_key(table) {
                    return Err(undefined_table(table));
                }
                match node.locks.get(table) {
                    Some(holder) if *holder != self.id => Err(NodeError::rejected(
                        LOCK_NOT_AVAILABLE,
                        format!("could not obtain lock on relation \"{table}\""),
                    )),
                    _ => {
                        node.locks.insert(table.clone(), self.id);
                        Ok(QueryRows::single(Some(Lsn(node.wal_lsn).to_string())))
                    }
                }
            }
            Statement::CutoverLockHeld { table } => {
                let held = node.locks.get(table) == Some(&self.id);
                Ok(QueryRows::single(Some(held.to_string())))
            }
            Statement::AppliedLsn { subscription } => {
                let Some(sub) = node.subscriptions.get_mut(subscription) else {
                    return Ok(QueryRows::empty());
                };
                sub.apply_polls += 1;
                let applied = match source_wal {
                    Some(wal) if sub.enabled && sub.apply_polls >= final_sync_polls => Lsn(wal),
                    _ => Lsn(0),
                };
                Ok(QueryRows::single(Some(applied.to_string())))
            }
            Statement::PartitionTable {
                relation,
                partitions_count,
                ..
            } => {
                let columns = node
                    .tables
                    .get(relation)
                    .cloned()
                    .ok_or_else(|| undefined_table(relation))?;
                if !node.partitioned.insert(relation.clone()) {
                    return Err(NodeError::rejected(
                        RAISE_EXCEPTION,
                        format!("relation \"{relation}\" is already partitioned"),
                    ));
                }
                for index in 0..*partitions_count {
                    node.tables
                        .insert(format!("{relation}_{index}"), columns.clone());
                }
                Ok(QueryRows::single(Some(partitions_count.to_string())))
            }
            Statement::IsPartitioned { relation } => {
                if !node.tables.contains_key(relation) {
                    return Err(undefined_table(relation));
                }
                let partitioned = node.partitioned.contains(relation);
                Ok(QueryRows::single(Some(partitioned.to_string())))
            }
            Statement::TableDefinition { relation, .. } => {
                let columns = node
                    .tables
                    .get(relation)
                    .ok_or_else(|| undefined_table(relation))?;
                let body = columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.type_name))
                    .collect::<Vec<_>>()
                    .join(", ");
                Ok(QueryRows::single(Some(format!(
                    "CREATE TABLE {relation} ({body})"
                ))))
            }
        }
    }
}
