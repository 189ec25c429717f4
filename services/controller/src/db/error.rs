//! Database error types.

use pgshard_migrate::StoreError;
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A stored command has a type this controller does not execute.
    #[error("command {id} has unknown type {cmd_type:?}")]
    UnknownCommandType { id: i64, cmd_type: String },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::new(err.to_string())
    }
}
