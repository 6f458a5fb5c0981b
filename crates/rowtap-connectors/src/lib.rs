//! Rowtap Connectors - backend adapters and query orchestration
//!
//! This crate provides:
//! - The `Connector` capability trait and connection descriptors
//! - SQL rendering with every literal bound as a parameter
//! - SQLite and PostgreSQL connectors (sqlx)
//! - A registry of connector factories and a cache of live instances
//! - The long-poll select executor and the `QueryService` entry point

pub mod executor;
pub mod postgres;
pub mod query;
pub mod registry;
pub mod sql;
pub mod sqlite;
pub mod store;

pub use executor::{perform_select_with_polling, MIN_POLL_INTERVAL};
pub use postgres::{PostgresConnector, PostgresDialect, PostgresFactory};
pub use query::QueryService;
pub use registry::{default_registry, ConnectorFactory, ConnectorRegistration, ConnectorRegistry};
pub use sqlite::{SqliteConnector, SqliteDialect, SqliteFactory};
pub use store::{ConnectorInstance, ConnectorStore};

use async_trait::async_trait;
use rowtap_core::{Dialect, FieldCatalog, FieldRef, FilterSpec, Result, SelectResult, SortSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a source lives: `{dialect|type?, uri, table, marker?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub dialect: Option<String>,
    pub uri: String,
    pub table: String,
    /// Monotonically increasing column used to continue polling reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
}

impl ConnectionDescriptor {
    pub fn new(uri: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dialect: None,
            uri: uri.into(),
            table: table.into(),
            marker: None,
        }
    }

    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = Some(dialect.into());
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    /// Dialect named by the URI scheme, ignoring any `+driver` suffix.
    pub fn scheme_dialect(&self) -> Option<String> {
        let scheme = self.uri.split_once(':')?.0;
        let dialect = scheme.split('+').next().unwrap_or(scheme);
        if dialect.is_empty() {
            return None;
        }
        Some(dialect.to_ascii_lowercase())
    }
}

/// One compiled read against a connector.
#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub catalog: &'a FieldCatalog,
    /// Resolved projection; never empty.
    pub fields: &'a [FieldRef],
    pub filters: &'a [FilterSpec],
    pub sort: Option<&'a [SortSpec]>,
    /// 0 means unlimited.
    pub limit: u64,
    pub offset: u64,
    /// Only rows whose marker is greater than this are returned.
    pub after: Option<&'a Value>,
    /// Append the marker column to each row and report the largest one.
    pub track_marker: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOutcome {
    pub result: SelectResult,
    pub last_marker: Option<Value>,
}

/// A live backend bound to one table.
#[async_trait]
pub trait Connector: Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    /// Continuation column, if the source declares one.
    fn marker(&self) -> Option<&str>;

    /// Current field set. Never cached.
    async fn field_info(&self) -> Result<FieldCatalog>;

    async fn read(&self, request: &ReadRequest<'_>) -> Result<ReadOutcome>;

    /// Release pooled connections.
    async fn close(&self) {}
}
