//! Typed errors shared by every rowtap crate.

use thiserror::Error;

/// Errors surfaced by query compilation, connector resolution and execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Malformed or unsafe filter/sort/fields/format input. Always raised
    /// before any read executes.
    #[error("invalid query: {0}")]
    Validation(String),

    /// No connector is registered for the dialect, or constructing or
    /// connecting the connector failed.
    #[error("connector resolution failed: {0}")]
    ConnectorResolution(String),

    /// The backend rejected an accepted query.
    #[error("query execution failed: {0}")]
    Execution(String),

    /// The surrounding request was aborted while the query was running.
    #[error("query cancelled")]
    Cancelled,
}

impl QueryError {
    pub fn validation(msg: impl Into<String>) -> Self {
        QueryError::Validation(msg.into())
    }

    pub fn resolution(msg: impl Into<String>) -> Self {
        QueryError::ConnectorResolution(msg.into())
    }

    pub fn execution(msg: impl std::fmt::Display) -> Self {
        QueryError::Execution(msg.to_string())
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            QueryError::Validation(_) => "validation",
            QueryError::ConnectorResolution(_) => "resolution",
            QueryError::Execution(_) => "execution",
            QueryError::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Execution(format!("json encoding: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, QueryError>;
