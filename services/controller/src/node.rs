//! Management sessions to cluster nodes over the Postgres protocol.
//!
//! Each session owns one dedicated `PgConnection`, never a pooled one: the
//! cutover lock lives in the session's open transaction and must die with
//! the connection. Statements are rendered to SQL here and sent with the
//! simple query protocol; every result column is cast to text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pgshard_migrate::{
    Endpoint, NodeConnector, NodeError, NodeId, NodeSession, QueryRows, Statement,
};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Executor, Row};
use tokio::sync::Mutex;
use tracing::debug;

/// Node session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,

    /// Upper bound on one statement, including any batch it expands to.
    pub query_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens one Postgres connection per session.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    config: SessionConfig,
}

impl PgConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl NodeConnector for PgConnector {
    async fn connect(
        &self,
        node: NodeId,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn NodeSession>, NodeError> {
        let options = connect_options(endpoint)?;
        let conn = tokio::time::timeout(self.config.connect_timeout, options.connect())
            .await
            .map_err(|_| {
                NodeError::Connect(format!("timed out after {:?}", self.config.connect_timeout))
            })?
            .map_err(|e| NodeError::Connect(e.to_string()))?;

        debug!(node = %node, "Opened node session");
        Ok(Arc::new(PgSession {
            node,
            conn: Mutex::new(conn),
            query_timeout: self.config.query_timeout,
        }))
    }
}

/// A management session to one node.
pub struct PgSession {
    node: NodeId,
    conn: Mutex<PgConnection>,
    query_timeout: Duration,
}

#[async_trait]
impl NodeSession for PgSession {
    fn node(&self) -> NodeId {
        self.node
    }

    async fn execute(&self, statement: &Statement) -> Result<QueryRows, NodeError> {
        let sql = render(statement);
        let mut conn = self.conn.lock().await;

        let run = async {
            let rows = (&mut *conn)
                .fetch_all(sqlx::raw_sql(&sql))
                .await
                .map_err(node_error)?;
            rows.iter().map(text_row).collect::<Result<Vec<_>, _>>()
        };

        let rows = tokio::time::timeout(self.query_timeout, run)
            .await
            .map_err(|_| NodeError::Timeout(self.query_timeout))??;
        Ok(QueryRows::new(rows))
    }
}

fn text_row(row: &PgRow) -> Result<Vec<Option<String>>, NodeError> {
    (0..row.len())
        .map(|i| row.try_get::<Option<String>, _>(i).map_err(node_error))
        .collect()
}

/// Map a driver error, keeping the server's SQLSTATE.
fn node_error(err: sqlx::Error) -> NodeError {
    match err {
        sqlx::Error::Database(db) => NodeError::Rejected {
            code: db.code().map(|c| c.into_owned()),
            message: db.message().to_string(),
        },
        sqlx::Error::Io(e) => NodeError::Io(e.to_string()),
        sqlx::Error::Tls(e) => NodeError::Io(e.to_string()),
        sqlx::Error::Protocol(msg) => NodeError::Io(msg),
        other => NodeError::Rejected {
            code: None,
            message: other.to_string(),
        },
    }
}

/// Parse a node connection string: a `postgres://` URL or libpq
/// `key=value` pairs.
pub fn connect_options(endpoint: &Endpoint) -> Result<PgConnectOptions, NodeError> {
    let conninfo = endpoint.as_str().trim();
    if conninfo.starts_with("postgres://") || conninfo.starts_with("postgresql://") {
        let options: PgConnectOptions = conninfo
            .parse()
            .map_err(|e: sqlx::Error| NodeError::Connect(e.to_string()))?;
        return Ok(options.application_name("shardlord"));
    }

    let mut options = PgConnectOptions::new().application_name("shardlord");
    for pair in conninfo.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| NodeError::Connect(format!("malformed conninfo entry {pair:?}")))?;
        options = match key {
            "host" | "hostaddr" => options.host(value),
            "port" => options.port(
                value
                    .parse()
                    .map_err(|_| NodeError::Connect(format!("invalid port {value:?}")))?,
            ),
            "dbname" => options.database(value),
            "user" => options.username(value),
            "password" => options.password(value),
            "application_name" => options.application_name(value),
            _ => options,
        };
    }
    Ok(options)
}

/// Render a statement into the SQL sent for it. The rows of its last
/// query are the statement's result.
pub fn render(statement: &Statement) -> String {
    match statement {
        Statement::DisableSubscription { subscription } => {
            format!("ALTER SUBSCRIPTION {} DISABLE", quote_ident(subscription))
        }
        Statement::CreatePublication { publication, table } => format!(
            "CREATE PUBLICATION {} FOR TABLE {}",
            quote_ident(publication),
            quote_qualified(table)
        ),
        Statement::CreateReplicationSlot { slot } => format!(
            "SELECT lsn::text FROM pg_create_logical_replication_slot({}, 'pgoutput')",
            quote_literal(slot)
        ),
        Statement::DescribeColumns { table } => format!(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
             FROM pg_attribute a \
             WHERE a.attrelid = {}::regclass AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
            quote_literal(&quote_qualified(table))
        ),
        Statement::CreateTable { table, columns } => {
            let columns = columns
                .iter()
                .map(|c| format!("{} {}", quote_ident(&c.name), c.type_name))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({columns})",
                quote_qualified(table)
            )
        }
        Statement::CreateSubscription {
            subscription,
            publication,
            slot,
            source,
        } => format!(
            "CREATE SUBSCRIPTION {} CONNECTION {} PUBLICATION {} \
             WITH (create_slot = false, slot_name = {}, synchronous_commit = off)",
            quote_ident(subscription),
            quote_literal(source.as_str()),
            quote_ident(publication),
            quote_literal(slot)
        ),
        Statement::EnableSubscription { subscription } => {
            format!("ALTER SUBSCRIPTION {} ENABLE", quote_ident(subscription))
        }
        Statement::InitialSyncState { subscription } => format!(
            "SELECT sr.srsubstate::text \
             FROM pg_subscription s \
             LEFT JOIN pg_subscription_rel sr ON sr.srsubid = s.oid \
             WHERE s.subname = {}",
            quote_literal(subscription)
        ),
        Statement::LockAndReadLsn { table } => format!(
            "BEGIN; LOCK TABLE {} IN ACCESS EXCLUSIVE MODE; SELECT pg_current_wal_lsn()::text",
            quote_qualified(table)
        ),
        Statement::CutoverLockHeld { table } => format!(
            "SELECT EXISTS (\
               SELECT 1 FROM pg_locks \
               WHERE locktype = 'relation' AND relation = {}::regclass \
               AND mode = 'AccessExclusiveLock' AND granted AND pid = pg_backend_pid()\
             )::text",
            quote_literal(&quote_qualified(table))
        ),
        Statement::AppliedLsn { subscription } => format!(
            "SELECT st.latest_end_lsn::text \
             FROM pg_subscription s \
             LEFT JOIN pg_stat_subscription st ON st.subid = s.oid AND st.relid IS NULL \
             WHERE s.subname = {}",
            quote_literal(subscription)
        ),
        Statement::PartitionTable {
            relation,
            expression,
            partitions_count,
        } => format!(
            "BEGIN; SELECT create_hash_partitions({}, {}, {partitions_count})::text; COMMIT",
            quote_literal(relation),
            quote_literal(expression)
        ),
        Statement::IsPartitioned { relation } => format!(
            "SELECT EXISTS (SELECT 1 FROM pathman_config WHERE partrel = {}::regclass)::text",
            quote_literal(&quote_qualified(relation))
        ),
        Statement::TableDefinition { relation, conninfo } => format!(
            "SELECT shardman.gen_create_table_sql({}, {})",
            quote_literal(relation),
            quote_literal(conninfo.as_str())
        ),
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote each part of a possibly schema-qualified name.
pub fn quote_qualified(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

/// Quote a string literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    if value.contains('\\') {
        format!("E'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    } else {
        format!("'{}'", value.replace('\'', "''"))
    }
}
