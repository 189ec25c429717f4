//! Error types for the migration engine.

use std::time::Duration;

use thiserror::Error;

use crate::node::NodeId;

/// SQLSTATE codes the engine interprets.
pub mod sqlstate {
    /// `undefined_table`: the relation does not exist.
    pub const UNDEFINED_TABLE: &str = "42P01";

    /// `undefined_object`: e.g. the subscription does not exist.
    pub const UNDEFINED_OBJECT: &str = "42704";

    /// `duplicate_object`: publication, slot or subscription already exists.
    pub const DUPLICATE_OBJECT: &str = "42710";

    /// `duplicate_table`: the relation already exists.
    pub const DUPLICATE_TABLE: &str = "42P07";
}

/// Errors raised by a node connection or a statement executed over it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// Could not establish the connection.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection broke while a statement was in flight.
    #[error("connection lost: {0}")]
    Io(String),

    /// The statement did not complete in time.
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected the statement.
    #[error("statement rejected [{}]: {message}", .code.as_deref().unwrap_or("-"))]
    Rejected {
        code: Option<String>,
        message: String,
    },
}

impl NodeError {
    /// Build a rejection carrying a SQLSTATE code.
    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// SQLSTATE of a rejection, if the server supplied one.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Self::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Returns true if the session this error came from is no longer usable.
    pub fn loses_session(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Io(_) | Self::Timeout(_))
    }

    /// The referenced relation does not exist.
    pub fn is_undefined_table(&self) -> bool {
        self.sqlstate() == Some(sqlstate::UNDEFINED_TABLE)
    }

    /// The referenced non-relation object does not exist.
    pub fn is_undefined_object(&self) -> bool {
        self.sqlstate() == Some(sqlstate::UNDEFINED_OBJECT)
    }

    /// The object being created already exists.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.sqlstate(),
            Some(sqlstate::DUPLICATE_OBJECT) | Some(sqlstate::DUPLICATE_TABLE)
        )
    }
}

/// Error reported by the metadata store or the command queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Fatal errors that abort a whole batch of moves.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Ownership data references a node that has no endpoint.
    #[error("partition {partition} is owned by node {node} which has no connection endpoint")]
    Inconsistent { partition: String, node: NodeId },

    /// The metadata store could not be read.
    #[error("metadata lookup failed: {0}")]
    Metadata(#[from] StoreError),
}

/// Errors returned by the command adapter.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Fatal migration error; the command was marked failed.
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// The command queue or metadata store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let missing = NodeError::rejected(sqlstate::UNDEFINED_TABLE, "relation \"p1\" does not exist");
        assert!(missing.is_undefined_table());
        assert!(!missing.loses_session());

        let dup = NodeError::rejected(sqlstate::DUPLICATE_OBJECT, "publication exists");
        assert!(dup.is_duplicate());
        assert!(NodeError::rejected(sqlstate::DUPLICATE_TABLE, "table exists").is_duplicate());

        assert!(NodeError::Io("reset by peer".into()).loses_session());
        assert!(NodeError::Timeout(Duration::from_secs(1)).loses_session());
        assert!(NodeError::Connect("refused".into()).loses_session());
        assert_eq!(NodeError::Io("x".into()).sqlstate(), None);
    }

    #[test]
    fn test_rejected_display() {
        let err = NodeError::rejected("42704", "subscription \"s\" does not exist");
        assert_eq!(
            err.to_string(),
            "statement rejected [42704]: subscription \"s\" does not exist"
        );

        let err = NodeError::Rejected {
            code: None,
            message: "bad row".into(),
        };
        assert_eq!(err.to_string(), "statement rejected [-]: bad row");
    }
}
