//! Phase engine: the per-task migration protocol.
//!
//! The engine is a step function. Each call to [`PhaseEngine::resume`] looks
//! at the task's phase and protocol state, starts at most one request and
//! returns a [`Directive`] telling the scheduler how the task waits next.
//! Requests are returned as boxed futures so the scheduler can poll every
//! in-flight request from a single control loop.
//!
//! Protocol, in order:
//!
//! 1. `Init`: open management sessions to source and destination
//! 2. `DisableDestSubscription`: disable any subscription left on the destination
//! 3. `EnsureSourcePublication`: create publication and replication slot
//! 4. `EnsureDestTableAndSubscription`: copy the table definition, subscribe
//! 5. `WaitInitialSync`: poll until the initial copy finished
//! 6. `LockSourceAndMarkCutover`: lock the source table, read the WAL position
//! 7. `WaitFinalSync`: poll until the destination applied that position
//! 8. `Finalize`: confirm the lock is still held, record the destination as owner
//!
//! The cutover lock lives in the source session's open transaction. Every
//! final sync poll and the owner write are preceded by a check that the
//! session still holds it; once it is gone the source accepts writes past
//! the cutover position, so the task locks again and waits for a new one.
//!
//! Setup statements are create-if-absent, so retrying a phase from its first
//! statement is always safe.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::cancel::CancelReason;
use crate::clock;
use crate::error::{NodeError, StoreError};
use crate::metadata::ClusterMetadata;
use crate::node::{
    ColumnDef, Endpoint, Lsn, NodeConnector, NodeId, NodeSession, QueryRows, Side, Statement,
    StatementKind,
};
use crate::task::{FailureReason, MigrationTask, MoveResult, Phase};

/// Maximum identifier length accepted by the database.
const MAX_IDENT_LEN: usize = 63;

/// Subscription relation states that mean the initial copy is complete.
const SYNCED_STATES: [&str; 2] = ["r", "s"];

/// Phase engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between sync polls.
    pub poll_interval: Duration,

    /// Backoff applied after transient failures.
    pub backoff: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Names of the replication objects created for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationNames {
    pub publication: String,
    pub slot: String,
    pub subscription: String,
}

impl ReplicationNames {
    pub fn for_partition(partition: &str) -> Self {
        let mut name: String = format!("pgshard_{partition}")
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        name.truncate(MAX_IDENT_LEN);

        Self {
            publication: name.clone(),
            slot: name.clone(),
            subscription: name,
        }
    }
}

/// Why a task is being resumed.
pub(crate) enum Wake {
    /// Its wake deadline passed.
    Timer,
    /// Its outstanding request completed.
    Ready(Reply),
}

/// Completion of an outstanding request.
pub(crate) enum Reply {
    /// Connection attempts; `None` for a side that was already connected.
    Connected {
        source: Option<Result<Arc<dyn NodeSession>, NodeError>>,
        dest: Option<Result<Arc<dyn NodeSession>, NodeError>>,
    },
    Executed {
        side: Side,
        result: Result<QueryRows, NodeError>,
    },
    OwnerRecorded(Result<(), StoreError>),
}

/// A request the task is waiting on.
pub(crate) struct InFlight {
    pub(crate) label: &'static str,
    pub(crate) future: BoxFuture<'static, Reply>,
}

/// What the scheduler should do with a task after resuming it.
pub(crate) enum Directive {
    AwaitSocket(InFlight),
    AwaitTime(Instant),
    Finished(MoveResult),
}

/// Drives [`MigrationTask`]s through the migration protocol.
#[derive(Clone)]
pub struct PhaseEngine {
    connector: Arc<dyn NodeConnector>,
    metadata: Arc<dyn ClusterMetadata>,
    config: EngineConfig,
}

impl PhaseEngine {
    pub fn new(
        connector: Arc<dyn NodeConnector>,
        metadata: Arc<dyn ClusterMetadata>,
        config: EngineConfig,
    ) -> Self {
        Self {
            connector,
            metadata,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one step of `task`. Never called on a terminal task.
    pub(crate) fn resume(&self, task: &mut MigrationTask, wake: Wake) -> Directive {
        debug_assert!(!task.is_terminal(), "terminal task resumed");

        let directive = match wake {
            Wake::Timer => self.kick(task),
            Wake::Ready(reply) => self.on_reply(task, reply),
        };

        if let Directive::Finished(result) = &directive {
            Self::finish(task, *result);
        }
        directive
    }

    /// Tear down a task that will not be resumed again.
    pub(crate) fn abort(task: &mut MigrationTask, reason: CancelReason) {
        if task.is_terminal() {
            return;
        }
        warn!(
            partition = %task.partition(),
            phase = %task.phase(),
            reason = %reason,
            "Aborting partition move"
        );
        task.failure = Some(FailureReason::Cancelled(reason));
        Self::finish(task, MoveResult::Failed);
    }

    fn finish(task: &mut MigrationTask, result: MoveResult) {
        if task.state.close_sessions() {
            debug!(partition = %task.partition(), "Closed node sessions");
        }
        if result == MoveResult::Success {
            task.phase = Phase::Done;
        }
        task.complete(result);
    }

    // =========================================================================
    // Issuing requests
    // =========================================================================

    /// Start (or restart) the current phase.
    fn kick(&self, task: &mut MigrationTask) -> Directive {
        match task.phase {
            // The cutover lock lived in the source session's transaction.
            Phase::WaitFinalSync | Phase::Finalize if task.state.source.is_none() => {
                warn!(
                    partition = %task.partition(),
                    phase = %task.phase,
                    "Source session lost while holding the cutover lock, locking again"
                );
                task.state.cutover_lsn = None;
                Self::enter(task, Phase::LockSourceAndMarkCutover);
            }
            _ => {}
        }

        if let Some(connect) = self.connect_missing(task) {
            return connect;
        }

        if task.phase == Phase::Init {
            Self::enter(task, Phase::DisableDestSubscription);
        }
        self.issue(task)
    }

    /// Open sessions for every side that has none.
    fn connect_missing(&self, task: &MigrationTask) -> Option<Directive> {
        let route = task.route()?;
        let want_source = task.state.source.is_none();
        let want_dest = task.state.dest.is_none();
        if !want_source && !want_dest {
            return None;
        }

        debug!(
            partition = %task.partition(),
            source = want_source,
            dest = want_dest,
            "Connecting to nodes"
        );

        let source = want_source.then(|| (route.source_node, route.source_conn.clone()));
        let dest = want_dest.then(|| (task.dest_node(), route.dest_conn.clone()));
        let connector = self.connector.clone();

        let future = async move {
            let (source, dest) = futures_util::join!(
                connect_side(connector.as_ref(), source),
                connect_side(connector.as_ref(), dest)
            );
            Reply::Connected { source, dest }
        }
        .boxed();

        Some(Directive::AwaitSocket(InFlight {
            label: "connect",
            future,
        }))
    }

    /// Send the statement for the current phase and step.
    fn issue(&self, task: &mut MigrationTask) -> Directive {
        let Some((side, statement)) = self.next_statement(task) else {
            return self.fail(
                task,
                format!("no statement for phase {} step {}", task.phase, task.state.step),
            );
        };
        let Some(session) = task.state.session(side).cloned() else {
            // Reconnect before retrying.
            return Directive::AwaitTime(clock::now());
        };

        let kind = statement.kind();
        if matches!(kind, StatementKind::InitialSyncState | StatementKind::AppliedLsn) {
            task.state.polls = task.state.polls.saturating_add(1);
        }
        debug!(
            partition = %task.partition(),
            phase = %task.phase,
            side = %side,
            statement = %kind,
            "Issuing statement"
        );

        let future = async move {
            let result = session.execute(&statement).await;
            Reply::Executed { side, result }
        }
        .boxed();

        Directive::AwaitSocket(InFlight {
            label: kind.as_str(),
            future,
        })
    }

    fn record_owner(&self, task: &MigrationTask) -> Directive {
        let metadata = self.metadata.clone();
        let partition = task.partition().to_string();
        let dest = task.dest_node();

        let future = async move {
            Reply::OwnerRecorded(metadata.record_partition_owner(&partition, dest).await)
        }
        .boxed();

        Directive::AwaitSocket(InFlight {
            label: "record_partition_owner",
            future,
        })
    }

    /// Statement for the task's current phase and step.
    fn next_statement(&self, task: &MigrationTask) -> Option<(Side, Statement)> {
        let table = task.partition().to_string();
        let names = ReplicationNames::for_partition(&table);

        let next = match (task.phase, task.state.step) {
            (Phase::DisableDestSubscription, 0) => (
                Side::Dest,
                Statement::DisableSubscription {
                    subscription: names.subscription,
                },
            ),
            (Phase::EnsureSourcePublication, 0) => (
                Side::Source,
                Statement::CreatePublication {
                    publication: names.publication,
                    table,
                },
            ),
            (Phase::EnsureSourcePublication, 1) => (
                Side::Source,
                Statement::CreateReplicationSlot { slot: names.slot },
            ),
            (Phase::EnsureDestTableAndSubscription, 0) => {
                (Side::Source, Statement::DescribeColumns { table })
            }
            (Phase::EnsureDestTableAndSubscription, 1) => (
                Side::Dest,
                Statement::CreateTable {
                    table,
                    columns: task.state.columns.clone(),
                },
            ),
            (Phase::EnsureDestTableAndSubscription, 2) => (
                Side::Dest,
                Statement::CreateSubscription {
                    subscription: names.subscription,
                    publication: names.publication,
                    slot: names.slot,
                    source: task.route()?.source_conn.clone(),
                },
            ),
            (Phase::EnsureDestTableAndSubscription, 3) => (
                Side::Dest,
                Statement::EnableSubscription {
                    subscription: names.subscription,
                },
            ),
            (Phase::WaitInitialSync, 0) => (
                Side::Dest,
                Statement::InitialSyncState {
                    subscription: names.subscription,
                },
            ),
            (Phase::LockSourceAndMarkCutover, 0) => {
                (Side::Source, Statement::LockAndReadLsn { table })
            }
            (Phase::WaitFinalSync, 0) | (Phase::Finalize, 0) => {
                (Side::Source, Statement::CutoverLockHeld { table })
            }
            (Phase::WaitFinalSync, 1) => (
                Side::Dest,
                Statement::AppliedLsn {
                    subscription: names.subscription,
                },
            ),
            _ => return None,
        };
        Some(next)
    }

    // =========================================================================
    // Handling replies
    // =========================================================================

    fn on_reply(&self, task: &mut MigrationTask, reply: Reply) -> Directive {
        match reply {
            Reply::Connected { source, dest } => {
                let mut failure = None;
                for (side, outcome) in [(Side::Source, source), (Side::Dest, dest)] {
                    match outcome {
                        Some(Ok(session)) => match side {
                            Side::Source => task.state.source = Some(session),
                            Side::Dest => task.state.dest = Some(session),
                        },
                        Some(Err(err)) => {
                            if failure.is_none() {
                                failure = Some((side, err));
                            }
                        }
                        None => {}
                    }
                }

                match failure {
                    Some((side, err)) => self.on_error(task, side, err),
                    None => {
                        task.state.consecutive_failures = 0;
                        self.kick(task)
                    }
                }
            }
            Reply::Executed { side, result } => match result {
                Ok(rows) => {
                    task.state.consecutive_failures = 0;
                    self.on_rows(task, rows)
                }
                Err(err) => self.on_error(task, side, err),
            },
            Reply::OwnerRecorded(Ok(())) => {
                info!(
                    partition = %task.partition(),
                    source_node = ?task.source_node(),
                    dest_node = %task.dest_node(),
                    transient_failures = task.state.transient_failures,
                    polls = task.state.polls,
                    "Partition moved"
                );
                Directive::Finished(MoveResult::Success)
            }
            Reply::OwnerRecorded(Err(err)) => {
                // Phase stays Finalize: the lock is checked again, then the write retried.
                self.retry_later(task, &err.to_string())
            }
        }
    }

    fn on_rows(&self, task: &mut MigrationTask, rows: QueryRows) -> Directive {
        match (task.phase, task.state.step) {
            (Phase::EnsureDestTableAndSubscription, 0) => {
                if rows.is_empty() {
                    return self.fail(task, "source partition has no columns");
                }
                match parse_columns(&rows) {
                    Ok(columns) => {
                        task.state.columns = columns;
                        self.step_done(task)
                    }
                    Err(detail) => self.retry_later(task, &detail),
                }
            }
            (Phase::WaitInitialSync, _) => {
                if rows.is_empty() {
                    return self.fail(task, "subscription disappeared during initial sync");
                }
                match rows.first_value() {
                    Some(state) if SYNCED_STATES.contains(&state) => {
                        info!(partition = %task.partition(), "Initial sync complete");
                        self.step_done(task)
                    }
                    state => {
                        debug!(partition = %task.partition(), state = ?state, "Initial sync in progress");
                        self.poll_later(task)
                    }
                }
            }
            (Phase::LockSourceAndMarkCutover, _) => {
                let lsn = rows.first_value().map(str::parse::<Lsn>);
                match lsn {
                    Some(Ok(lsn)) => {
                        info!(partition = %task.partition(), cutover_lsn = %lsn, "Source locked");
                        task.state.cutover_lsn = Some(lsn);
                        self.step_done(task)
                    }
                    Some(Err(err)) => {
                        task.state.drop_session(Side::Source);
                        self.retry_later(task, &format!("cutover position: {err}"))
                    }
                    None => {
                        task.state.drop_session(Side::Source);
                        self.retry_later(task, "source returned no WAL position")
                    }
                }
            }
            (Phase::WaitFinalSync | Phase::Finalize, 0) => match rows.first_value() {
                Some("true") if task.phase == Phase::Finalize => self.record_owner(task),
                Some("true") => self.step_done(task),
                held => {
                    let detail = format!("cutover lock not held (reply {held:?})");
                    self.relock(task, &detail)
                }
            },
            (Phase::WaitFinalSync, _) => {
                if rows.is_empty() {
                    return self.fail(task, "subscription disappeared during final sync");
                }
                let Some(cutover) = task.state.cutover_lsn else {
                    Self::enter(task, Phase::LockSourceAndMarkCutover);
                    return self.kick(task);
                };
                match rows.first_value().map(str::parse::<Lsn>) {
                    Some(Ok(applied)) if applied >= cutover => {
                        info!(
                            partition = %task.partition(),
                            applied_lsn = %applied,
                            cutover_lsn = %cutover,
                            "Final sync complete"
                        );
                        self.step_done(task)
                    }
                    Some(Err(err)) => self.retry_later(task, &format!("applied position: {err}")),
                    applied => {
                        debug!(
                            partition = %task.partition(),
                            applied_lsn = ?applied.and_then(Result::ok).map(|l| l.to_string()),
                            cutover_lsn = %cutover,
                            "Final sync in progress"
                        );
                        self.poll_later(task)
                    }
                }
            }
            _ => self.step_done(task),
        }
    }

    fn on_error(&self, task: &mut MigrationTask, side: Side, err: NodeError) -> Directive {
        let phase = task.phase;

        if phase == Phase::DisableDestSubscription && err.is_undefined_object() {
            debug!(partition = %task.partition(), "No subscription on destination");
            task.state.consecutive_failures = 0;
            return self.step_done(task);
        }
        if matches!(
            phase,
            Phase::EnsureSourcePublication | Phase::EnsureDestTableAndSubscription
        ) && err.is_duplicate()
        {
            debug!(partition = %task.partition(), phase = %phase, error = %err, "Already exists");
            task.state.consecutive_failures = 0;
            return self.step_done(task);
        }
        if err.is_undefined_table() {
            return self.fail(task, format!("partition missing on {side} node: {err}"));
        }
        if matches!(phase, Phase::WaitInitialSync | Phase::WaitFinalSync) && err.is_undefined_object()
        {
            return self.fail(task, format!("subscription missing: {err}"));
        }

        // A failed statement in the lock transaction ends it, and with it the lock.
        let holds_lock = matches!(
            phase,
            Phase::LockSourceAndMarkCutover | Phase::WaitFinalSync | Phase::Finalize
        ) && side == Side::Source;
        if err.loses_session() || holds_lock {
            task.state.drop_session(side);
        }
        self.retry_later(task, &format!("{side}: {err}"))
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// The current statement succeeded; move to the next one.
    fn step_done(&self, task: &mut MigrationTask) -> Directive {
        task.state.step += 1;
        if task.state.step < steps_in(task.phase) {
            return self.issue(task);
        }

        let next = next_phase(task.phase);
        Self::enter(task, next);
        match next {
            Phase::Done => Directive::Finished(MoveResult::Success),
            _ => self.issue(task),
        }
    }

    /// The source no longer holds the cutover lock; take it again.
    fn relock(&self, task: &mut MigrationTask, detail: &str) -> Directive {
        task.state.drop_session(Side::Source);
        task.state.cutover_lsn = None;
        Self::enter(task, Phase::LockSourceAndMarkCutover);
        self.retry_later(task, detail)
    }

    fn enter(task: &mut MigrationTask, phase: Phase) {
        debug!(partition = %task.partition(), from = %task.phase, to = %phase, "Phase transition");
        task.phase = phase;
        task.state.step = 0;
    }

    /// Poll again from the phase's first statement.
    fn poll_later(&self, task: &mut MigrationTask) -> Directive {
        task.state.step = 0;
        Directive::AwaitTime(clock::now() + self.config.poll_interval)
    }

    /// Schedule a retry of the current phase after backoff.
    fn retry_later(&self, task: &mut MigrationTask, error: &str) -> Directive {
        let attempt = task.state.consecutive_failures;
        task.state.consecutive_failures = attempt.saturating_add(1);
        task.state.transient_failures = task.state.transient_failures.saturating_add(1);
        task.state.step = 0;

        let delay = self.config.backoff.delay(attempt);
        warn!(
            partition = %task.partition(),
            phase = %task.phase,
            error = %error,
            attempt = task.state.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying phase"
        );
        Directive::AwaitTime(clock::now() + delay)
    }

    fn fail(&self, task: &mut MigrationTask, detail: impl Into<String>) -> Directive {
        let detail = detail.into();
        error!(
            partition = %task.partition(),
            phase = %task.phase,
            error = %detail,
            "Partition move failed"
        );
        task.failure = Some(FailureReason::Permanent(detail));
        Directive::Finished(MoveResult::Failed)
    }
}

async fn connect_side(
    connector: &dyn NodeConnector,
    target: Option<(NodeId, Endpoint)>,
) -> Option<Result<Arc<dyn NodeSession>, NodeError>> {
    let (node, endpoint) = target?;
    Some(connector.connect(node, &endpoint).await)
}

/// Number of statements a phase issues.
fn steps_in(phase: Phase) -> u8 {
    match phase {
        Phase::EnsureSourcePublication => 2,
        Phase::EnsureDestTableAndSubscription => 4,
        Phase::DisableDestSubscription
        | Phase::WaitInitialSync
        | Phase::LockSourceAndMarkCutover
        | Phase::Finalize => 1,
        Phase::WaitFinalSync => 2,
        Phase::Init | Phase::Done | Phase::Failed => 0,
    }
}

fn next_phase(phase: Phase) -> Phase {
    match phase {
        Phase::Init => Phase::DisableDestSubscription,
        Phase::DisableDestSubscription => Phase::EnsureSourcePublication,
        Phase::EnsureSourcePublication => Phase::EnsureDestTableAndSubscription,
        Phase::EnsureDestTableAndSubscription => Phase::WaitInitialSync,
        Phase::WaitInitialSync => Phase::LockSourceAndMarkCutover,
        Phase::LockSourceAndMarkCutover => Phase::WaitFinalSync,
        Phase::WaitFinalSync => Phase::Finalize,
        Phase::Finalize | Phase::Done => Phase::Done,
        Phase::Failed => Phase::Failed,
    }
}

fn parse_columns(rows: &QueryRows) -> Result<Vec<ColumnDef>, String> {
    if rows.is_empty() {
        return Err("source partition has no columns".to_string());
    }
    rows.rows()
        .iter()
        .map(|row| match (row.first(), row.get(1)) {
            (Some(Some(name)), Some(Some(type_name))) => Ok(ColumnDef {
                name: name.clone(),
                type_name: type_name.clone(),
            }),
            _ => Err(format!("malformed column description: {row:?}")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rstest::rstest;

    use super::*;
    use crate::error::sqlstate;
    use crate::metadata::ShardedTable;
    use crate::task::Route;

    /// Answers statements from a per-kind script. Unscripted lock checks
    /// report the lock held; other unscripted kinds succeed with no rows.
    #[derive(Default)]
    struct Script {
        replies: Mutex<HashMap<StatementKind, Vec<Result<QueryRows, NodeError>>>>,
        executed: Mutex<Vec<StatementKind>>,
        owners: Mutex<Vec<(String, NodeId)>>,
    }

    impl Script {
        fn push(&self, kind: StatementKind, reply: Result<QueryRows, NodeError>) {
            self.replies
                .lock()
                .unwrap()
                .entry(kind)
                .or_default()
                .push(reply);
        }
    }

    struct ScriptSession {
        node: NodeId,
        script: Arc<Script>,
    }

    #[async_trait]
    impl NodeSession for ScriptSession {
        fn node(&self) -> NodeId {
            self.node
        }

        async fn execute(&self, statement: &Statement) -> Result<QueryRows, NodeError> {
            let kind = statement.kind();
            self.script.executed.lock().unwrap().push(kind);
            let mut replies = self.script.replies.lock().unwrap();
            match replies.get_mut(&kind) {
                Some(queue) if !queue.is_empty() => queue.remove(0),
                _ if kind == StatementKind::CutoverLockHeld => {
                    Ok(QueryRows::single(Some("true".into())))
                }
                _ => Ok(QueryRows::empty()),
            }
        }
    }

    #[async_trait]
    impl NodeConnector for Arc<Script> {
        async fn connect(
            &self,
            node: NodeId,
            _endpoint: &Endpoint,
        ) -> Result<Arc<dyn NodeSession>, NodeError> {
            Ok(Arc::new(ScriptSession {
                node,
                script: self.clone(),
            }))
        }
    }

    #[async_trait]
    impl ClusterMetadata for Arc<Script> {
        async fn partition_owner(&self, _: &str) -> Result<Option<NodeId>, StoreError> {
            Ok(None)
        }

        async fn node_endpoint(&self, _: NodeId) -> Result<Option<Endpoint>, StoreError> {
            Ok(None)
        }

        async fn record_partition_owner(
            &self,
            partition: &str,
            node: NodeId,
        ) -> Result<(), StoreError> {
            self.owners
                .lock()
                .unwrap()
                .push((partition.to_string(), node));
            Ok(())
        }

        async fn is_table_sharded(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn record_sharded_table(&self, _: &ShardedTable) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn engine(script: &Arc<Script>) -> PhaseEngine {
        PhaseEngine::new(
            Arc::new(script.clone()),
            Arc::new(script.clone()),
            EngineConfig {
                poll_interval: Duration::from_millis(100),
                backoff: BackoffPolicy {
                    base: Duration::from_millis(10),
                    max: Duration::from_millis(80),
                    jitter: 0.0,
                },
            },
        )
    }

    fn task() -> MigrationTask {
        MigrationTask::new(
            "p1",
            NodeId(2),
            Route {
                source_node: NodeId(1),
                source_conn: Endpoint::new("host=node1"),
                dest_conn: Endpoint::new("host=node2"),
            },
        )
    }

    fn columns() -> QueryRows {
        QueryRows::new(vec![
            vec![Some("id".into()), Some("integer".into())],
            vec![Some("payload".into()), Some("text".into())],
        ])
    }

    /// Resume the task until it sleeps or finishes, awaiting every request inline.
    async fn drive(engine: &PhaseEngine, task: &mut MigrationTask, wake: Wake) -> Directive {
        let mut directive = engine.resume(task, wake);
        loop {
            match directive {
                Directive::AwaitSocket(inflight) => {
                    let reply = inflight.future.await;
                    directive = engine.resume(task, Wake::Ready(reply));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn test_replication_names() {
        let names = ReplicationNames::for_partition("Orders-2024.p1");
        assert_eq!(names.publication, "pgshard_orders_2024_p1");
        assert_eq!(names.slot, names.publication);
        assert_eq!(names.subscription, names.publication);

        let long = ReplicationNames::for_partition(&"x".repeat(200));
        assert_eq!(long.slot.len(), MAX_IDENT_LEN);
    }

    #[test]
    fn test_phase_order() {
        let mut phase = Phase::Init;
        let mut seen = vec![phase];
        while phase != Phase::Done {
            phase = next_phase(phase);
            seen.push(phase);
        }
        assert_eq!(
            seen,
            vec![
                Phase::Init,
                Phase::DisableDestSubscription,
                Phase::EnsureSourcePublication,
                Phase::EnsureDestTableAndSubscription,
                Phase::WaitInitialSync,
                Phase::LockSourceAndMarkCutover,
                Phase::WaitFinalSync,
                Phase::Finalize,
                Phase::Done,
            ]
        );
    }

    #[test]
    fn test_parse_columns() {
        let parsed = parse_columns(&columns()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].type_name, "text");

        assert!(parse_columns(&QueryRows::empty()).is_err());
        assert!(parse_columns(&QueryRows::new(vec![vec![Some("id".into()), None]])).is_err());
    }

    /// Resume through every sleep until the task finishes.
    async fn run_to_end(engine: &PhaseEngine, task: &mut MigrationTask) -> MoveResult {
        let mut directive = drive(engine, task, Wake::Timer).await;
        loop {
            match directive {
                Directive::Finished(result) => return result,
                _ => directive = drive(engine, task, Wake::Timer).await,
            }
        }
    }

    fn count(script: &Script, kind: StatementKind) -> usize {
        script
            .executed
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_protocol() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("d".into()))));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("r".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/200".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(None)));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/200".into()))));

        let engine = engine(&script);
        let mut task = task();

        let mut directive = drive(&engine, &mut task, Wake::Timer).await;
        while let Directive::AwaitTime(_) = directive {
            directive = drive(&engine, &mut task, Wake::Timer).await;
        }

        assert!(matches!(directive, Directive::Finished(MoveResult::Success)));
        assert_eq!(task.result(), MoveResult::Success);
        assert_eq!(task.phase(), Phase::Done);
        assert_eq!(task.cutover_lsn(), Some(Lsn(0x200)));
        assert_eq!(task.polls(), 4);
        assert!(!task.has_open_sessions());
        assert_eq!(
            script.owners.lock().unwrap().as_slice(),
            &[("p1".to_string(), NodeId(2))]
        );
        assert_eq!(
            script.executed.lock().unwrap()[..7],
            [
                StatementKind::DisableSubscription,
                StatementKind::CreatePublication,
                StatementKind::CreateReplicationSlot,
                StatementKind::DescribeColumns,
                StatementKind::CreateTable,
                StatementKind::CreateSubscription,
                StatementKind::EnableSubscription,
            ]
        );
    }

    #[rstest]
    #[case(StatementKind::DisableSubscription, sqlstate::UNDEFINED_OBJECT)]
    #[case(StatementKind::CreatePublication, sqlstate::DUPLICATE_OBJECT)]
    #[case(StatementKind::CreateReplicationSlot, sqlstate::DUPLICATE_OBJECT)]
    #[case(StatementKind::CreateTable, sqlstate::DUPLICATE_TABLE)]
    #[case(StatementKind::CreateSubscription, sqlstate::DUPLICATE_OBJECT)]
    #[tokio::test(start_paused = true)]
    async fn test_existing_objects_count_as_success(
        #[case] kind: StatementKind,
        #[case] code: &str,
    ) {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(kind, Err(NodeError::rejected(code, "already there")));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("s".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/10".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/11".into()))));

        let engine = engine(&script);
        let mut task = task();
        let directive = drive(&engine, &mut task, Wake::Timer).await;

        assert!(matches!(directive, Directive::Finished(MoveResult::Success)));
        assert_eq!(task.transient_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_table_is_permanent() {
        let script = Arc::new(Script::default());
        script.push(
            StatementKind::CreatePublication,
            Err(NodeError::rejected(sqlstate::UNDEFINED_TABLE, "relation \"p1\" does not exist")),
        );

        let engine = engine(&script);
        let mut task = task();
        let directive = drive(&engine, &mut task, Wake::Timer).await;

        assert!(matches!(directive, Directive::Finished(MoveResult::Failed)));
        assert_eq!(task.phase(), Phase::Failed);
        assert!(matches!(task.failure(), Some(FailureReason::Permanent(_))));
        assert!(!task.has_open_sessions());
        assert!(script.owners.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_error_retries_phase_with_backoff() {
        let script = Arc::new(Script::default());
        script.push(
            StatementKind::CreateReplicationSlot,
            Err(NodeError::Io("connection reset".into())),
        );

        let engine = engine(&script);
        let mut task = task();
        let before = clock::now();
        let directive = drive(&engine, &mut task, Wake::Timer).await;

        let Directive::AwaitTime(wake_at) = directive else {
            panic!("expected a backoff sleep");
        };
        assert_eq!(wake_at - before, Duration::from_millis(10));
        assert_eq!(task.phase(), Phase::EnsureSourcePublication);
        assert_eq!(task.transient_failures(), 1);
        assert!(task.state.source.is_none());
        assert!(task.state.dest.is_some());

        // The retry reconnects the source and replays the phase from the publication.
        script.executed.lock().unwrap().clear();
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("d".into()))));
        let directive = drive(&engine, &mut task, Wake::Timer).await;
        assert!(matches!(directive, Directive::AwaitTime(_)));
        assert_eq!(task.phase(), Phase::WaitInitialSync);
        assert_eq!(
            script.executed.lock().unwrap()[..2],
            [StatementKind::CreatePublication, StatementKind::CreateReplicationSlot]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_cutover_lock_locks_again() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("r".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/100".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/180".into()))));
        script.push(StatementKind::CutoverLockHeld, Ok(QueryRows::single(Some("true".into()))));
        script.push(StatementKind::CutoverLockHeld, Ok(QueryRows::single(Some("false".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/0".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/180".into()))));

        let engine = engine(&script);
        let mut task = task();
        let result = run_to_end(&engine, &mut task).await;

        assert_eq!(result, MoveResult::Success);
        assert_eq!(count(&script, StatementKind::LockAndReadLsn), 2);
        assert_eq!(task.cutover_lsn(), Some(Lsn(0x180)));
        assert_eq!(task.transient_failures(), 1);

        // The owner write follows a lock check on the second lock's session.
        let executed = script.executed.lock().unwrap();
        let relock = executed
            .iter()
            .rposition(|k| *k == StatementKind::LockAndReadLsn)
            .unwrap();
        assert_eq!(executed.last(), Some(&StatementKind::CutoverLockHeld));
        assert!(executed.len() > relock + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_error_in_final_sync_locks_again() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("r".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/100".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/140".into()))));
        script.push(
            StatementKind::CutoverLockHeld,
            Err(NodeError::Io("server closed the connection unexpectedly".into())),
        );
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/140".into()))));

        let engine = engine(&script);
        let mut task = task();

        let directive = drive(&engine, &mut task, Wake::Timer).await;
        assert!(matches!(directive, Directive::AwaitTime(_)));
        assert_eq!(task.phase(), Phase::WaitFinalSync);
        assert!(task.state.source.is_none());

        let result = run_to_end(&engine, &mut task).await;
        assert_eq!(result, MoveResult::Success);
        assert_eq!(count(&script, StatementKind::LockAndReadLsn), 2);
        assert_eq!(task.cutover_lsn(), Some(Lsn(0x140)));
        assert_eq!(script.owners.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_lost_before_owner_write_locks_again() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("r".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/100".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/100".into()))));
        // Poll check, then the check before the owner write fails.
        script.push(StatementKind::CutoverLockHeld, Ok(QueryRows::single(Some("true".into()))));
        script.push(StatementKind::CutoverLockHeld, Ok(QueryRows::single(Some("false".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/120".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/120".into()))));

        let engine = engine(&script);
        let mut task = task();
        let result = run_to_end(&engine, &mut task).await;

        assert_eq!(result, MoveResult::Success);
        assert_eq!(count(&script, StatementKind::LockAndReadLsn), 2);
        assert_eq!(count(&script, StatementKind::AppliedLsn), 2);
        assert_eq!(task.cutover_lsn(), Some(Lsn(0x120)));
        assert_eq!(script.owners.lock().unwrap().len(), 1);
    }

    #[rstest]
    #[case::column_description(
        StatementKind::DescribeColumns,
        QueryRows::new(vec![vec![Some("id".into()), None]])
    )]
    #[case::cutover_position(StatementKind::LockAndReadLsn, QueryRows::single(Some("garbage".into())))]
    #[case::missing_cutover_position(StatementKind::LockAndReadLsn, QueryRows::single(None))]
    #[case::applied_position(StatementKind::AppliedLsn, QueryRows::single(Some("garbage".into())))]
    #[tokio::test(start_paused = true)]
    async fn test_malformed_reply_is_retried(#[case] kind: StatementKind, #[case] reply: QueryRows) {
        let script = Arc::new(Script::default());
        script.push(kind, Ok(reply));
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("r".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("0/200".into()))));
        script.push(StatementKind::AppliedLsn, Ok(QueryRows::single(Some("0/200".into()))));

        let engine = engine(&script);
        let mut task = task();
        let result = run_to_end(&engine, &mut task).await;

        assert_eq!(result, MoveResult::Success);
        assert_eq!(task.failure(), None);
        assert_eq!(task.transient_failures(), 1);
        assert_eq!(count(&script, kind), 2);
        assert_eq!(task.cutover_lsn(), Some(Lsn(0x200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_cutover_position_releases_lock_session() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(Some("r".into()))));
        script.push(StatementKind::LockAndReadLsn, Ok(QueryRows::single(Some("garbage".into()))));

        let engine = engine(&script);
        let mut task = task();
        let directive = drive(&engine, &mut task, Wake::Timer).await;

        assert!(matches!(directive, Directive::AwaitTime(_)));
        assert_eq!(task.phase(), Phase::LockSourceAndMarkCutover);
        assert!(task.state.source.is_none());
        assert!(task.state.dest.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_columns_without_rows_are_permanent() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(QueryRows::empty()));

        let engine = engine(&script);
        let mut task = task();
        let directive = drive(&engine, &mut task, Wake::Timer).await;

        assert!(matches!(directive, Directive::Finished(MoveResult::Failed)));
        assert!(matches!(task.failure(), Some(FailureReason::Permanent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_closes_sessions() {
        let script = Arc::new(Script::default());
        script.push(StatementKind::DescribeColumns, Ok(columns()));
        script.push(StatementKind::InitialSyncState, Ok(QueryRows::single(None)));
        let engine = engine(&script);
        let mut task = task();

        let directive = drive(&engine, &mut task, Wake::Timer).await;
        assert!(matches!(directive, Directive::AwaitTime(_)));
        assert_eq!(task.phase(), Phase::WaitInitialSync);
        assert!(task.has_open_sessions());

        PhaseEngine::abort(&mut task, CancelReason::Command);

        assert_eq!(task.result(), MoveResult::Failed);
        assert_eq!(
            task.failure(),
            Some(&FailureReason::Cancelled(CancelReason::Command))
        );
        assert!(!task.has_open_sessions());
    }
}
