//! Command adapter.
//!
//! Turns queued commands into work and reports the terminal status back to
//! the command queue. Partition moves go through the [`Scheduler`];
//! hash-partitioning a table is a one-shot statement retried against a
//! single node until it succeeds or the command is cancelled.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::cancel::{CancelReason, Cancellation};
use crate::error::{CommandError, NodeError, StoreError};
use crate::metadata::{ClusterMetadata, ShardedTable};
use crate::node::{Endpoint, NodeConnector, NodeId, Statement};
use crate::phase::{EngineConfig, PhaseEngine};
use crate::scheduler::Scheduler;
use crate::task::{MigrationTask, TaskSummary};

/// Identifier of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(pub i64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Type of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Options: `[partition, dest_node]`, repeated for a batch.
    MovePartitions,
    /// Options: `[node, relation, expression, partitions_count]`.
    CreateHashPartitions,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::MovePartitions => "move_mpart",
            CommandKind::CreateHashPartitions => "create_hash_partitions",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown command type: {0}")]
pub struct UnknownCommandKind(pub String);

impl FromStr for CommandKind {
    type Err = UnknownCommandKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "move_mpart" => Ok(CommandKind::MovePartitions),
            "create_hash_partitions" => Ok(CommandKind::CreateHashPartitions),
            other => Err(UnknownCommandKind(other.to_string())),
        }
    }
}

/// A command taken from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub id: CommandId,
    pub kind: CommandKind,
    pub options: Vec<String>,
}

/// Terminal status written back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Failed,
    Canceled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Success => "success",
            CommandStatus::Failed => "failed",
            CommandStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reporting side of the command queue.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    async fn update_status(&self, id: CommandId, status: CommandStatus) -> Result<(), StoreError>;

    /// Mark a command abandoned before it made progress.
    async fn cancel(&self, cmd: &Cmd) -> Result<(), StoreError>;
}

/// Command adapter configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub engine: EngineConfig,

    /// Sleep between attempts of one-shot commands.
    pub cmd_retry_naptime: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            cmd_retry_naptime: Duration::from_secs(10),
        }
    }
}

/// Result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    /// Per-move summaries; empty for commands that move nothing.
    pub tasks: Vec<TaskSummary>,
    pub cancelled: Option<CancelReason>,
}

impl CommandOutcome {
    fn rejected() -> Self {
        Self {
            status: CommandStatus::Failed,
            tasks: Vec::new(),
            cancelled: None,
        }
    }
}

/// Executes queued commands against the cluster.
pub struct CommandExecutor {
    metadata: Arc<dyn ClusterMetadata>,
    queue: Arc<dyn CommandQueue>,
    connector: Arc<dyn NodeConnector>,
    config: ExecutorConfig,
}

impl CommandExecutor {
    pub fn new(
        metadata: Arc<dyn ClusterMetadata>,
        queue: Arc<dyn CommandQueue>,
        connector: Arc<dyn NodeConnector>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            metadata,
            queue,
            connector,
            config,
        }
    }

    /// Execute `cmd` and write its terminal status.
    #[instrument(skip_all, fields(command_id = %cmd.id, kind = %cmd.kind))]
    pub async fn execute(
        &self,
        cmd: &Cmd,
        cancel: &mut Cancellation,
    ) -> Result<CommandOutcome, CommandError> {
        match cmd.kind {
            CommandKind::MovePartitions => self.move_partitions(cmd, cancel).await,
            CommandKind::CreateHashPartitions => self.create_hash_partitions(cmd, cancel).await,
        }
    }

    /// Move every requested partition concurrently.
    ///
    /// The command succeeds only if every move succeeds.
    pub async fn move_partitions(
        &self,
        cmd: &Cmd,
        cancel: &mut Cancellation,
    ) -> Result<CommandOutcome, CommandError> {
        let moves = match parse_moves(&cmd.options) {
            Ok(moves) => moves,
            Err(detail) => {
                warn!(command_id = %cmd.id, error = %detail, "Invalid move request");
                self.queue.update_status(cmd.id, CommandStatus::Failed).await?;
                return Ok(CommandOutcome::rejected());
            }
        };

        let mut tasks = Vec::with_capacity(moves.len());
        for (partition, dest_node) in &moves {
            match MigrationTask::resolve(self.metadata.as_ref(), partition, *dest_node).await {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    error!(command_id = %cmd.id, error = %err, "Cannot start partition moves");
                    if let Err(store_err) =
                        self.queue.update_status(cmd.id, CommandStatus::Failed).await
                    {
                        warn!(command_id = %cmd.id, error = %store_err, "Failed to record command failure");
                    }
                    return Err(err.into());
                }
            }
        }

        let scheduler = Scheduler::new(PhaseEngine::new(
            self.connector.clone(),
            self.metadata.clone(),
            self.config.engine.clone(),
        ));
        let report = scheduler.run(tasks, cancel).await;

        let status = if report.all_succeeded() {
            CommandStatus::Success
        } else {
            CommandStatus::Failed
        };
        self.queue.update_status(cmd.id, status).await?;

        info!(command_id = %cmd.id, status = %status, moves = moves.len(), "Move command finished");
        Ok(CommandOutcome {
            status,
            tasks: report.summaries(),
            cancelled: report.cancelled,
        })
    }

    /// Hash-partition a table on one node and record it as sharded.
    pub async fn create_hash_partitions(
        &self,
        cmd: &Cmd,
        cancel: &mut Cancellation,
    ) -> Result<CommandOutcome, CommandError> {
        let request = match HashPartitionRequest::parse(&cmd.options) {
            Ok(request) => request,
            Err(detail) => {
                warn!(command_id = %cmd.id, error = %detail, "Invalid hash partition request");
                self.queue.update_status(cmd.id, CommandStatus::Failed).await?;
                return Ok(CommandOutcome::rejected());
            }
        };

        info!(relation = %request.relation, node = %request.node, "Sharding table");

        if self.metadata.is_table_sharded(&request.relation).await? {
            warn!(relation = %request.relation, "Table already sharded, won't partition it");
            self.queue.update_status(cmd.id, CommandStatus::Failed).await?;
            return Ok(CommandOutcome::rejected());
        }
        let Some(endpoint) = self.metadata.node_endpoint(request.node).await? else {
            warn!(node = %request.node, "No such worker node");
            self.queue.update_status(cmd.id, CommandStatus::Failed).await?;
            return Ok(CommandOutcome::rejected());
        };

        let mut attempt: u32 = 0;
        // Set once partitioning was sent; it may have committed even if the reply was lost.
        let mut partition_sent = false;
        let reason = loop {
            if let Some(reason) = cancel.reason() {
                break reason;
            }
            attempt += 1;

            match self
                .partition_table(&request, &endpoint, &mut partition_sent)
                .await
            {
                Ok(create_sql) => {
                    let table = ShardedTable {
                        relation: request.relation.clone(),
                        sharding_key: request.expression.clone(),
                        partitions_count: request.partitions_count,
                        create_sql,
                        initial_node: request.node,
                    };
                    self.metadata.record_sharded_table(&table).await?;
                    self.queue.update_status(cmd.id, CommandStatus::Success).await?;

                    info!(relation = %request.relation, attempts = attempt, "Table successfully partitioned");
                    return Ok(CommandOutcome {
                        status: CommandStatus::Success,
                        tasks: Vec::new(),
                        cancelled: None,
                    });
                }
                Err(err) => {
                    info!(
                        relation = %request.relation,
                        attempt,
                        error = %err,
                        delay_ms = self.config.cmd_retry_naptime.as_millis() as u64,
                        "Attempt to partition table failed, sleeping and retrying"
                    );
                }
            }

            tokio::select! {
                reason = cancel.triggered() => break reason,
                _ = tokio::time::sleep(self.config.cmd_retry_naptime) => {}
            }
        };

        warn!(relation = %request.relation, reason = %reason, "Hash partitioning cancelled");
        self.queue.cancel(cmd).await?;
        Ok(CommandOutcome {
            status: CommandStatus::Canceled,
            tasks: Vec::new(),
            cancelled: Some(reason),
        })
    }

    /// One attempt: partition the relation and return the DDL to recreate it.
    ///
    /// After an attempt that sent the partitioning, the node is asked first
    /// whether it already took effect, and only the definition is fetched if so.
    async fn partition_table(
        &self,
        request: &HashPartitionRequest,
        endpoint: &Endpoint,
        partition_sent: &mut bool,
    ) -> Result<String, NodeError> {
        let session = self.connector.connect(request.node, endpoint).await?;

        let partitioned = if *partition_sent {
            let rows = session
                .execute(&Statement::IsPartitioned {
                    relation: request.relation.clone(),
                })
                .await?;
            rows.first_value() == Some("true")
        } else {
            false
        };

        if partitioned {
            info!(relation = %request.relation, "Table partitioned by an earlier attempt");
        } else {
            *partition_sent = true;
            session
                .execute(&Statement::PartitionTable {
                    relation: request.relation.clone(),
                    expression: request.expression.clone(),
                    partitions_count: request.partitions_count,
                })
                .await?;
        }

        let rows = session
            .execute(&Statement::TableDefinition {
                relation: request.relation.clone(),
                conninfo: endpoint.clone(),
            })
            .await?;
        rows.first_value()
            .map(str::to_string)
            .ok_or_else(|| NodeError::Rejected {
                code: None,
                message: "no table definition returned".to_string(),
            })
    }
}

/// Parsed options of a hash partition command.
#[derive(Debug, Clone, PartialEq, Eq)]
struct HashPartitionRequest {
    node: NodeId,
    relation: String,
    expression: String,
    partitions_count: u32,
}

impl HashPartitionRequest {
    fn parse(options: &[String]) -> Result<Self, String> {
        let [node, relation, expression, count] = options else {
            return Err(format!("expected 4 options, got {}", options.len()));
        };
        let node: NodeId = node
            .parse()
            .map_err(|_| format!("invalid node id: {node:?}"))?;
        let partitions_count = count
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| format!("invalid partitions count: {count:?}"))?;

        Ok(Self {
            node,
            relation: relation.clone(),
            expression: expression.clone(),
            partitions_count,
        })
    }
}

/// Parse `[partition, dest_node]` pairs.
fn parse_moves(options: &[String]) -> Result<Vec<(String, NodeId)>, String> {
    if options.is_empty() || options.len() % 2 != 0 {
        return Err(format!(
            "expected partition/node pairs, got {} options",
            options.len()
        ));
    }
    options
        .chunks_exact(2)
        .map(|pair| -> Result<(String, NodeId), String> {
            let node: NodeId = pair[1]
                .parse()
                .map_err(|_| format!("invalid node id: {:?}", pair[1]))?;
            Ok((pair[0].clone(), node))
        })
        .collect()
}
