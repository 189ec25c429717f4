use std::time::Duration;

use anyhow::Result;
use pgshard_migrate::{BackoffPolicy, EngineConfig, ExecutorConfig};

use crate::db::DbConfig;
use crate::node::SessionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub sessions: SessionConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level =
            std::env::var("SHARDLORD_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("SHARDLORD_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        let sessions = SessionConfig {
            connect_timeout: millis_var("SHARDLORD_CONNECT_TIMEOUT_MS", 5_000)?,
            query_timeout: millis_var("SHARDLORD_QUERY_TIMEOUT_MS", 30_000)?,
        };

        let defaults = BackoffPolicy::default();
        let executor = ExecutorConfig {
            engine: EngineConfig {
                poll_interval: millis_var("SHARDLORD_POLL_INTERVAL_MS", 1_000)?,
                backoff: BackoffPolicy {
                    base: millis_var("SHARDLORD_BACKOFF_BASE_MS", 200)?,
                    max: millis_var("SHARDLORD_BACKOFF_MAX_MS", 30_000)?,
                    ..defaults
                },
            },
            cmd_retry_naptime: millis_var("SHARDLORD_CMD_RETRY_NAPTIME_MS", 10_000)?,
        };

        Ok(Self {
            log_level,
            dev_mode,
            database,
            sessions,
            executor,
        })
    }
}

/// Read a duration in milliseconds, falling back to `default` when unset.
fn millis_var(name: &str, default: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(value) => {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("{name}={value:?}: {e}"))?;
            Ok(Duration::from_millis(ms))
        }
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_var_default() {
        let value = millis_var("SHARDLORD_TEST_UNSET_VARIABLE", 1_500).unwrap();
        assert_eq!(value, Duration::from_millis(1_500));
    }
}
