//! The command queue: `cmd_log` rows and their ordered options.

use async_trait::async_trait;
use pgshard_migrate::{Cmd, CommandId, CommandKind, CommandQueue, CommandStatus, StoreError};
use sqlx::postgres::PgPool;
use tracing::info;

use super::DbError;

/// [`CommandQueue`] backed by the metadata database.
#[derive(Clone)]
pub struct PgCommandQueue {
    pool: PgPool,
}

impl PgCommandQueue {
    /// Create a new command queue handle.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Load a command and its options.
    pub async fn load(&self, id: CommandId) -> Result<Option<Cmd>, DbError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, cmd_type FROM shardman.cmd_log
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let Some((id, cmd_type)) = row else {
            return Ok(None);
        };
        let kind: CommandKind = cmd_type
            .parse()
            .map_err(|_| DbError::UnknownCommandType { id, cmd_type })?;

        let options: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT opt FROM shardman.cmd_opts
            WHERE cmd_id = $1
            ORDER BY opt_idx
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(Some(Cmd {
            id: CommandId(id),
            kind,
            options,
        }))
    }

    /// Append a new waiting command.
    pub async fn enqueue(&self, kind: CommandKind, options: &[String]) -> Result<Cmd, DbError> {
        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO shardman.cmd_log (cmd_type)
            VALUES ($1)
            RETURNING id
            "#,
        )
        .bind(kind.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        for (idx, opt) in options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO shardman.cmd_opts (cmd_id, opt_idx, opt)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id)
            .bind(idx as i32)
            .bind(opt)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;
        }

        tx.commit().await.map_err(DbError::Query)?;

        info!(command_id = id, kind = %kind, "Enqueued command");
        Ok(Cmd {
            id: CommandId(id),
            kind,
            options: options.to_vec(),
        })
    }

    /// Current status of a command.
    pub async fn status(&self, id: CommandId) -> Result<Option<String>, DbError> {
        sqlx::query_scalar(
            r#"
            SELECT status FROM shardman.cmd_log
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)
    }
}

#[async_trait]
impl CommandQueue for PgCommandQueue {
    async fn update_status(&self, id: CommandId, status: CommandStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE shardman.cmd_log
            SET status = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::new(format!("command {id} not found")));
        }
        Ok(())
    }

    async fn cancel(&self, cmd: &Cmd) -> Result<(), StoreError> {
        info!(command_id = %cmd.id, "Command canceled");
        self.update_status(cmd.id, CommandStatus::Canceled).await
    }
}
