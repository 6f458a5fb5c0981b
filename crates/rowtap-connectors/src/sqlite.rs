//! SQLite connector (sqlx, read-only, with REGEXP support).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rowtap_core::{
    Datatype, Dialect, FieldCatalog, FieldDescriptor, FunctionAllowlist, NativeOperator, Operator, OperatorTable,
    QueryError, Result,
};
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, info};

use crate::registry::{ConnectorFactory, ConnectorRegistration};
use crate::sql::{build_select, finish_read, no_literal_cast, quote_table, Placeholder, RowShape, SqlFlavor};
use crate::{ConnectionDescriptor, Connector, ReadOutcome, ReadRequest};

pub const SQLITE_OPERATORS: OperatorTable = &[
    (Operator::Eq, NativeOperator::Compare("=")),
    (Operator::Ne, NativeOperator::Compare("!=")),
    (Operator::Gte, NativeOperator::Compare(">=")),
    (Operator::Gt, NativeOperator::Compare(">")),
    (Operator::Lte, NativeOperator::Compare("<=")),
    (Operator::Lt, NativeOperator::Compare("<")),
    (Operator::In, NativeOperator::List { negated: false }),
    (Operator::NotIn, NativeOperator::List { negated: true }),
    (
        Operator::Regex,
        NativeOperator::Pattern {
            keyword: "REGEXP",
            prefix: None,
        },
    ),
    (
        Operator::NotRegex,
        NativeOperator::Pattern {
            keyword: "NOT REGEXP",
            prefix: None,
        },
    ),
    (
        Operator::Search,
        NativeOperator::Pattern {
            keyword: "REGEXP",
            prefix: Some("(?i)"),
        },
    ),
    (
        Operator::NotSearch,
        NativeOperator::Pattern {
            keyword: "NOT REGEXP",
            prefix: Some("(?i)"),
        },
    ),
];

pub static SQLITE_FUNCTIONS: FunctionAllowlist = FunctionAllowlist::new(
    &[
        "cast",
        "count",
        "distinct",
        // core scalar functions
        "abs",
        "char",
        "coalesce",
        "glob",
        "hex",
        "ifnull",
        "instr",
        "length",
        "like",
        "likelihood",
        "likely",
        "lower",
        "ltrim",
        "max",
        "min",
        "nullif",
        "printf",
        "quote",
        "replace",
        "round",
        "rtrim",
        "soundex",
        "substr",
        "trim",
        "typeof",
        "unicode",
        "unlikely",
        "upper",
        // date and time
        "date",
        "datetime",
        "julianday",
        "strftime",
        "time",
        // aggregates
        "avg",
        "group_concat",
        "sum",
        "total",
        // json1
        "json",
        "json_array",
        "json_array_length",
        "json_extract",
        "json_insert",
        "json_group_array",
        "json_group_object",
        "json_object",
        "json_patch",
        "json_quote",
        "json_remove",
        "json_replace",
        "json_set",
        "json_type",
        "json_valid",
    ],
    &["integer", "real", "text", "blob", "numeric"],
);

pub const SQLITE_FLAVOR: SqlFlavor = SqlFlavor {
    placeholder: Placeholder::Question,
    rows: RowShape::Columns,
    unlimited: Some("LIMIT -1"),
    literal_cast: no_literal_cast,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn operators(&self) -> OperatorTable {
        SQLITE_OPERATORS
    }

    fn functions(&self) -> &FunctionAllowlist {
        &SQLITE_FUNCTIONS
    }
}

/// Map a declared column type to a [`Datatype`], following SQLite's
/// affinity rules plus the common date/boolean spellings.
pub fn declared_type_to_datatype(declared: &str) -> Datatype {
    let t = declared.to_ascii_uppercase();
    if t.is_empty() {
        Datatype::Unknown
    } else if t.contains("BOOL") {
        Datatype::Boolean
    } else if t.contains("DATETIME") || t.contains("TIMESTAMP") {
        Datatype::Datetime
    } else if t.contains("DATE") {
        Datatype::Date
    } else if t.contains("INT") {
        Datatype::Number
    } else if t.contains("CHAR") || t.contains("CLOB") || t.contains("TEXT") {
        Datatype::String
    } else if t.contains("BLOB") {
        Datatype::Binary
    } else if t.contains("REAL") || t.contains("FLOA") || t.contains("DOUB") || t.contains("NUM") || t.contains("DEC")
    {
        Datatype::Number
    } else {
        Datatype::Unknown
    }
}

pub struct SqliteConnector {
    pool: SqlitePool,
    table: String,
    marker: Option<String>,
}

impl SqliteConnector {
    /// Open a read-only pool on `uri` (any form sqlx accepts, normally the
    /// canonical `sqlite:///<absolute path>`).
    pub async fn connect(uri: &str, table: &str, marker: Option<&str>) -> Result<Self> {
        quote_table(table)?;
        let options = SqliteConnectOptions::from_str(uri)
            .map_err(|e| QueryError::resolution(format!("invalid sqlite uri '{}': {}", uri, e)))?
            .read_only(true)
            .with_regexp();
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| QueryError::resolution(format!("failed to open '{}': {}", uri, e)))?;
        info!("Opened sqlite source {} (table '{}')", uri, table);
        Ok(Self {
            pool,
            table: table.to_string(),
            marker: marker.map(String::from),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_value<'q>(query: Query<'q, Sqlite, SqliteArguments<'q>>, value: &Value) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Decode one column by the value's storage class.
fn decode_column(row: &SqliteRow, index: usize) -> Result<Value> {
    let raw = row.try_get_raw(index).map_err(QueryError::execution)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let value = match storage.as_str() {
        "INTEGER" | "INT" | "INT8" | "BIGINT" | "BOOLEAN" => {
            Value::from(row.try_get::<i64, _>(index).map_err(QueryError::execution)?)
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
            let f = row.try_get::<f64, _>(index).map_err(QueryError::execution)?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        "BLOB" => {
            let bytes = row.try_get::<Vec<u8>, _>(index).map_err(QueryError::execution)?;
            Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
        }
        _ => Value::String(row.try_get::<String, _>(index).map_err(QueryError::execution)?),
    };
    Ok(value)
}

fn decode_row(row: &SqliteRow) -> Result<Vec<Value>> {
    (0..row.len()).map(|i| decode_column(row, i)).collect()
}

#[async_trait]
impl Connector for SqliteConnector {
    fn dialect(&self) -> &dyn Dialect {
        &SqliteDialect
    }

    fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    async fn field_info(&self) -> Result<FieldCatalog> {
        let (schema, table) = match self.table.split_once('.') {
            Some((schema, table)) => (schema, table),
            None => ("main", self.table.as_str()),
        };
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT name, type FROM pragma_table_info(?, ?) ORDER BY cid")
            .bind(table)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(QueryError::execution)?;
        if rows.is_empty() {
            return Err(QueryError::execution(format!("No columns found for table '{}'", self.table)));
        }
        debug!("sqlite table '{}' has {} column(s)", self.table, rows.len());
        Ok(FieldCatalog::new(
            rows.into_iter()
                .map(|(name, declared)| FieldDescriptor::new(name, declared_type_to_datatype(&declared)))
                .collect(),
        ))
    }

    async fn read(&self, request: &ReadRequest<'_>) -> Result<ReadOutcome> {
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, &self.table, self.marker(), request)?;
        let mut query = sqlx::query(&stmt.sql);
        for value in &stmt.binds {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(QueryError::execution)?;
        let data = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
        Ok(finish_read(request.fields, data, request.track_marker && self.marker.is_some()))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Builds [`SqliteConnector`]s, resolving relative database paths against
/// `base_dir`.
#[derive(Debug, Clone)]
pub struct SqliteFactory {
    base_dir: PathBuf,
}

impl SqliteFactory {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn absolute(&self, path: &Path) -> Result<PathBuf> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        };
        std::path::absolute(&joined)
            .map_err(|e| QueryError::resolution(format!("cannot resolve '{}': {}", joined.display(), e)))
    }
}

#[async_trait]
impl ConnectorFactory for SqliteFactory {
    /// `sqlite:` and `sqlitedb:` URIs become `sqlite:///<absolute path>`.
    /// A path after `://` is always absolute, however many slashes lead it;
    /// a path after a bare `:` is relative to the base directory.
    fn canonical_uri(&self, uri: &str) -> Result<String> {
        let (scheme, rest) = uri
            .split_once(':')
            .ok_or_else(|| QueryError::resolution(format!("'{}' is not a sqlite uri", uri)))?;
        let dialect = scheme.split('+').next().unwrap_or(scheme).to_ascii_lowercase();
        if dialect != "sqlite" && dialect != "sqlitedb" {
            return Err(QueryError::resolution(format!("'{}' is not a sqlite uri", uri)));
        }
        let (location, params) = match rest.split_once('?') {
            Some((location, params)) => (location, Some(params)),
            None => (rest, None),
        };
        let canonical = if location.trim_start_matches('/') == ":memory:" {
            "sqlite::memory:".to_string()
        } else if let Some(path) = location.strip_prefix("//") {
            format!("sqlite:///{}", path.trim_start_matches('/'))
        } else if location.is_empty() {
            return Err(QueryError::resolution(format!("'{}' names no database file", uri)));
        } else {
            let path = self.absolute(Path::new(location))?;
            format!("sqlite://{}", path.display())
        };
        Ok(match params {
            Some(params) => format!("{}?{}", canonical, params),
            None => canonical,
        })
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connector>> {
        let connector = SqliteConnector::connect(&descriptor.uri, &descriptor.table, descriptor.marker.as_deref()).await?;
        Ok(Arc::new(connector))
    }
}

/// Registration for `sqlite` / `sqlitedb` descriptors.
pub fn sqlite_registration(base_dir: impl Into<PathBuf>) -> ConnectorRegistration {
    ConnectorRegistration {
        name: "sqlx_sqlite".to_string(),
        factory: Arc::new(SqliteFactory::new(base_dir)),
        dialects: HashMap::from([
            ("sqlite".to_string(), "sqlite".to_string()),
            ("sqlitedb".to_string(), "sqlite".to_string()),
        ]),
        default_dialect: "sqlite".to_string(),
        priority: 0,
    }
}
