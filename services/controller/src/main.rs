//! shardlord: the shard controller.
//!
//! Executes one queued cluster command per invocation. SIGINT and SIGTERM
//! shut the controller down; SIGUSR1 cancels the running command.

use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use pgshard_controller::{config::Config, db::Database, node::PgConnector};
use pgshard_migrate::{
    Cancellation, Cmd, CommandExecutor, CommandId, CommandKind, CommandStatus,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Shard controller for a Postgres cluster.
#[derive(Debug, Parser)]
#[command(name = "shardlord")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute a command already in the command queue.
    Run {
        /// Command ID.
        command_id: i64,
    },

    /// Move partitions to other nodes.
    ///
    /// Takes pairs of partition name and destination node ID.
    MovePartition {
        /// Partition and destination node pairs.
        #[arg(required = true, num_args = 2..)]
        moves: Vec<String>,
    },

    /// Hash-partition a table on one node.
    CreateHashPartitions {
        /// Node holding the table.
        node: i32,

        /// Table to partition.
        relation: String,

        /// Partitioning expression.
        expression: String,

        /// Number of partitions.
        partitions_count: u32,
    },

    /// Run metadata migrations and exit.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SHARDLORD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting shardlord");

    let db = match Database::connect(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "Failed to connect to metadata database");
            return Err(e.into());
        }
    };

    let migrate_only = matches!(cli.command, Commands::Migrate);
    if config.dev_mode || migrate_only {
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
        if migrate_only {
            return Ok(());
        }
    }

    let queue = db.commands();
    let cmd = match cli.command {
        Commands::Run { command_id } => queue
            .load(CommandId(command_id))
            .await?
            .ok_or_else(|| anyhow!("command {command_id} not found"))?,
        Commands::MovePartition { moves } => {
            queue.enqueue(CommandKind::MovePartitions, &moves).await?
        }
        Commands::CreateHashPartitions {
            node,
            relation,
            expression,
            partitions_count,
        } => {
            let options = [
                node.to_string(),
                relation,
                expression,
                partitions_count.to_string(),
            ];
            queue
                .enqueue(CommandKind::CreateHashPartitions, &options)
                .await?
        }
        Commands::Migrate => return Ok(()),
    };

    // Shutdown and cancel flags for the running command
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = forward_signals(shutdown_tx, cancel_tx).await {
            error!(error = %e, "Failed to install signal handlers");
        }
    });

    let executor = CommandExecutor::new(
        Arc::new(db.metadata()),
        Arc::new(queue),
        Arc::new(PgConnector::new(config.sessions.clone())),
        config.executor.clone(),
    );

    execute(&executor, &cmd, Cancellation::new(shutdown_rx, cancel_rx)).await
}

async fn execute(executor: &CommandExecutor, cmd: &Cmd, mut cancel: Cancellation) -> Result<()> {
    info!(command_id = %cmd.id, kind = %cmd.kind, options = ?cmd.options, "Executing command");

    let outcome = executor.execute(cmd, &mut cancel).await?;

    for task in &outcome.tasks {
        info!(
            partition = %task.partition,
            source_node = ?task.source_node,
            dest_node = %task.dest_node,
            result = ?task.result,
            failure = ?task.failure.as_ref().map(|f| f.to_string()),
            transient_failures = task.transient_failures,
            polls = task.polls,
            "Move finished"
        );
    }
    if let Some(reason) = outcome.cancelled {
        warn!(command_id = %cmd.id, reason = %reason, "Command interrupted");
    }

    info!(command_id = %cmd.id, status = %outcome.status, "Command finished");
    if outcome.status != CommandStatus::Success {
        bail!("command {} finished with status {}", cmd.id, outcome.status);
    }
    Ok(())
}

/// Turn process signals into the shutdown and cancel flags.
async fn forward_signals(
    shutdown: watch::Sender<bool>,
    cancel: watch::Sender<bool>,
) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                let _ = shutdown.send(true);
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                let _ = shutdown.send(true);
            }
            _ = sigusr1.recv() => {
                info!("Received SIGUSR1, canceling command");
                let _ = cancel.send(true);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_move_pairs() {
        let cli = Cli::try_parse_from(["shardlord", "move-partition", "p1", "2", "p2", "3"]).unwrap();
        match cli.command {
            Commands::MovePartition { moves } => assert_eq!(moves, ["p1", "2", "p2", "3"]),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_hash_partitioning() {
        let cli = Cli::try_parse_from([
            "shardlord",
            "create-hash-partitions",
            "1",
            "orders",
            "customer_id",
            "8",
        ])
        .unwrap();
        match cli.command {
            Commands::CreateHashPartitions {
                node,
                relation,
                partitions_count,
                ..
            } => {
                assert_eq!(node, 1);
                assert_eq!(relation, "orders");
                assert_eq!(partitions_count, 8);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_command_id() {
        assert!(Cli::try_parse_from(["shardlord", "run"]).is_err());
        assert!(Cli::try_parse_from(["shardlord", "run", "abc"]).is_err());
    }
}
