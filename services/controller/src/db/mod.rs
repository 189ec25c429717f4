//! Metadata database access.
//!
//! One [`PgPool`] backs both the cluster metadata ([`PgClusterMetadata`]) and
//! the command queue ([`PgCommandQueue`]). Node management sessions do not go
//! through this pool; see [`crate::node`].

mod commands;
mod error;
mod metadata;

pub use commands::PgCommandQueue;
pub use error::DbError;
pub use metadata::PgClusterMetadata;

use std::path::PathBuf;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Metadata database settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,

    /// Pool size. The controller runs one command at a time, so this stays small.
    pub max_connections: u32,

    pub acquire_timeout: Duration,

    /// Directory holding the metadata migrations.
    pub migrations_dir: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/shardman".to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            migrations_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `SHARDLORD_MIGRATIONS_DIR`,
    /// each falling back to the default when unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_connections),
            migrations_dir: std::env::var_os("SHARDLORD_MIGRATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.migrations_dir),
            ..defaults
        }
    }
}

/// Handle to the metadata database.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    migrations_dir: PathBuf,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(max_connections = config.max_connections, "Connecting to metadata database");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self {
            pool,
            migrations_dir: config.migrations_dir.clone(),
        })
    }

    /// The pool, for queries outside the metadata and queue adapters.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending metadata migrations.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = Migrator::new(self.migrations_dir.clone())
            .await
            .map_err(DbError::Migration)?;
        info!(
            migrations_dir = %self.migrations_dir.display(),
            migrations = migrator.iter().count(),
            "Running metadata migrations"
        );
        migrator.run(&self.pool).await.map_err(DbError::Migration)
    }

    pub fn metadata(&self) -> PgClusterMetadata {
        PgClusterMetadata::new(self.pool.clone())
    }

    pub fn commands(&self) -> PgCommandQueue {
        PgCommandQueue::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_migrations_ship_with_the_crate() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 5);
        assert!(config.migrations_dir.ends_with("migrations"));
        assert!(config
            .migrations_dir
            .join("0001_shardman_metadata.sql")
            .is_file());
    }
}
