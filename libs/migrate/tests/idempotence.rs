//! Setup phases must tolerate objects left behind by an earlier attempt.

use std::sync::Arc;
use std::time::Duration;

use pgshard_migrate::{
    BackoffPolicy, CancelReason, Cancellation, Cmd, CommandExecutor, CommandId, CommandKind,
    CommandStatus, EngineConfig, ExecutorConfig, NodeConnector, NodeId, ReplicationNames,
    Statement, StatementKind,
};
use pgshard_testing::SimCluster;
use tokio::sync::watch;

fn executor(sim: &SimCluster) -> CommandExecutor {
    CommandExecutor::new(
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        ExecutorConfig {
            engine: EngineConfig {
                poll_interval: Duration::from_millis(100),
                backoff: BackoffPolicy {
                    base: Duration::from_millis(50),
                    max: Duration::from_secs(1),
                    jitter: 0.0,
                },
            },
            cmd_retry_naptime: Duration::from_secs(10),
        },
    )
}

fn move_cmd(id: i64) -> Cmd {
    Cmd {
        id: CommandId(id),
        kind: CommandKind::MovePartitions,
        options: vec!["p1".to_string(), "2".to_string()],
    }
}

#[tokio::test(start_paused = true)]
async fn test_existing_replication_objects_are_reused() {
    let sim = SimCluster::with_nodes(2);
    sim.add_partition("p1", NodeId(1));
    let names = ReplicationNames::for_partition("p1");

    // Leftovers of an interrupted move, with the subscription disabled.
    {
        let source = sim
            .connect(NodeId(1), &SimCluster::endpoint_of(NodeId(1)))
            .await
            .unwrap();
        let dest = sim
            .connect(NodeId(2), &SimCluster::endpoint_of(NodeId(2)))
            .await
            .unwrap();
        source
            .execute(&Statement::CreatePublication {
                publication: names.publication.clone(),
                table: "p1".to_string(),
            })
            .await
            .unwrap();
        source
            .execute(&Statement::CreateReplicationSlot {
                slot: names.slot.clone(),
            })
            .await
            .unwrap();
        sim.create_table(NodeId(2), "p1");
        dest.execute(&Statement::CreateSubscription {
            subscription: names.subscription.clone(),
            publication: names.publication.clone(),
            slot: names.slot.clone(),
            source: SimCluster::endpoint_of(NodeId(1)),
        })
        .await
        .unwrap();
        dest.execute(&Statement::DisableSubscription {
            subscription: names.subscription.clone(),
        })
        .await
        .unwrap();
    }
    assert_eq!(sim.open_sessions(), 0);

    let cmd = move_cmd(1);
    let outcome = executor(&sim)
        .execute(&cmd, &mut Cancellation::never())
        .await
        .unwrap();

    assert_eq!(outcome.status, CommandStatus::Success);
    assert_eq!(outcome.tasks[0].transient_failures, 0);
    assert_eq!(sim.owner("p1"), Some(NodeId(2)));
    assert!(sim.subscription_enabled(NodeId(2), &names.subscription));
}

#[tokio::test(start_paused = true)]
async fn test_rerun_after_cancellation_completes() {
    let sim = SimCluster::with_nodes(2);
    sim.add_partition("p1", NodeId(1));
    sim.set_initial_sync_polls(6);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut cancel = Cancellation::new(shutdown_rx, cancel_rx);

    let first = move_cmd(1);
    let executor = executor(&sim);
    let run = executor.execute(&first, &mut cancel);
    let trigger = async {
        while sim.executed_count(NodeId(2), StatementKind::InitialSyncState) < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel_tx.send(true).unwrap();
    };
    let (outcome, ()) = tokio::join!(run, trigger);
    let outcome = outcome.unwrap();
    assert_eq!(outcome.cancelled, Some(CancelReason::Command));
    assert_eq!(sim.owner("p1"), Some(NodeId(1)));

    // The controller restarts the protocol from the beginning.
    let second = move_cmd(2);
    let outcome = executor
        .execute(&second, &mut Cancellation::never())
        .await
        .unwrap();

    assert_eq!(outcome.status, CommandStatus::Success);
    assert_eq!(sim.owner("p1"), Some(NodeId(2)));
    assert_eq!(sim.last_status(first.id), Some(CommandStatus::Failed));
    assert_eq!(sim.last_status(second.id), Some(CommandStatus::Success));
    assert_eq!(sim.executed_count(NodeId(1), StatementKind::CreatePublication), 2);
    assert_eq!(sim.open_sessions(), 0);
}
