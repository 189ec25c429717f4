//! Partition migration engine.
//!
//! Moves table partitions between cluster nodes using logical replication,
//! with a short write-blocking cutover at the end. Key pieces:
//!
//! - **Task**: one partition move and its resumable protocol state.
//! - **Phase engine**: the per-task state machine (setup, sync waits, cutover).
//! - **Scheduler**: a single-threaded reactor that multiplexes every in-flight
//!   move over readiness of outstanding requests and wake timers.
//! - **Command adapter**: turns queued commands into tasks and reports the
//!   terminal status back to the command queue.
//!
//! # Invariants
//!
//! - A non-terminal task is either sleeping until a deadline or waiting on
//!   exactly one outstanding request, never both and never neither
//! - Setup statements are idempotent, so a restarted move can replay them
//! - A task failure never changes the result of a sibling task

pub mod backoff;
pub mod cancel;
pub mod clock;
pub mod command;
pub mod error;
pub mod metadata;
pub mod node;
pub mod phase;
pub mod scheduler;
pub mod task;

pub use backoff::BackoffPolicy;
pub use cancel::{CancelReason, Cancellation};
pub use command::{
    Cmd, CommandExecutor, CommandId, CommandKind, CommandOutcome, CommandQueue, CommandStatus,
    ExecutorConfig,
};
pub use error::{CommandError, MigrateError, NodeError, StoreError};
pub use metadata::{ClusterMetadata, ShardedTable};
pub use node::{
    ColumnDef, Endpoint, Lsn, NodeConnector, NodeId, NodeSession, QueryRows, Side, Statement,
    StatementKind,
};
pub use phase::{EngineConfig, PhaseEngine, ReplicationNames};
pub use scheduler::{BatchReport, Scheduler};
pub use task::{FailureReason, MigrationTask, MoveResult, Phase, Registration, TaskSummary, WaitMode};
