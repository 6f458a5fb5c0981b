//! PostgreSQL connector (sqlx, read-only sessions, rows as jsonb arrays).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rowtap_core::{
    Datatype, Dialect, FieldCatalog, FieldDescriptor, FunctionAllowlist, NativeOperator, Operator, OperatorTable,
    QueryError, Result,
};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Postgres, Row};
use tracing::{debug, info};

use crate::registry::{ConnectorFactory, ConnectorRegistration};
use crate::sql::{build_select, finish_read, quote_table, Placeholder, RowShape, SqlFlavor};
use crate::{ConnectionDescriptor, Connector, ReadOutcome, ReadRequest};

pub const POSTGRES_OPERATORS: OperatorTable = &[
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
            keyword: "~",
            prefix: None,
        },
    ),
    (
        Operator::NotRegex,
        NativeOperator::Pattern {
            keyword: "!~",
            prefix: None,
        },
    ),
    (
        Operator::Search,
        NativeOperator::Pattern {
            keyword: "~*",
            prefix: None,
        },
    ),
    (
        Operator::NotSearch,
        NativeOperator::Pattern {
            keyword: "!~*",
            prefix: None,
        },
    ),
];

pub static POSTGRES_FUNCTIONS: FunctionAllowlist = FunctionAllowlist::new(
    &[
        "cast",
        "count",
        "distinct",
        // math
        "abs",
        "ceil",
        "floor",
        "round",
        "trunc",
        "sign",
        "sqrt",
        "power",
        "mod",
        "greatest",
        "least",
        // conditional
        "coalesce",
        "nullif",
        // strings
        "lower",
        "upper",
        "length",
        "char_length",
        "substr",
        "trim",
        "ltrim",
        "rtrim",
        "btrim",
        "replace",
        "concat",
        "left",
        "right",
        "strpos",
        "split_part",
        "md5",
        // date and time
        "to_char",
        "to_date",
        "to_timestamp",
        "date_trunc",
        "date_part",
        "age",
        // aggregates
        "avg",
        "sum",
        "min",
        "max",
        "string_agg",
        "array_agg",
        // json
        "json_agg",
        "jsonb_agg",
        "json_extract_path",
        "json_extract_path_text",
        "jsonb_extract_path",
        "jsonb_extract_path_text",
        "json_array_length",
        "jsonb_array_length",
        "json_typeof",
        "jsonb_typeof",
        "to_json",
        "to_jsonb",
    ],
    &[
        "smallint",
        "integer",
        "bigint",
        "numeric",
        "real",
        "double precision",
        "text",
        "varchar",
        "boolean",
        "date",
        "timestamp",
        "timestamptz",
        "interval",
        "json",
        "jsonb",
    ],
);

/// Bound literals are sent as text/number/bool; date-like comparisons need
/// an explicit cast on the placeholder.
pub fn postgres_literal_cast(datatype: Datatype) -> Option<&'static str> {
    match datatype {
        Datatype::Date => Some("date"),
        Datatype::Datetime => Some("timestamptz"),
        Datatype::Duration => Some("interval"),
        _ => None,
    }
}

/// Postgres caps function arguments at 100.
pub const POSTGRES_FLAVOR: SqlFlavor = SqlFlavor {
    placeholder: Placeholder::Numbered,
    rows: RowShape::JsonArray {
        function: "jsonb_build_array",
        max_args: 90,
    },
    unlimited: None,
    literal_cast: postgres_literal_cast,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn operators(&self) -> OperatorTable {
        POSTGRES_OPERATORS
    }

    fn functions(&self) -> &FunctionAllowlist {
        &POSTGRES_FUNCTIONS
    }
}

/// Map an `information_schema.columns.data_type` value to a [`Datatype`].
pub fn info_schema_type_to_datatype(data_type: &str) -> Datatype {
    match data_type.to_lowercase().as_str() {
        "smallint" | "integer" | "bigint" | "numeric" | "decimal" | "real" | "double precision" | "money" => {
            Datatype::Number
        }
        "boolean" => Datatype::Boolean,
        "character varying" | "varchar" | "character" | "char" | "text" | "name" | "citext" => Datatype::String,
        "date" => Datatype::Date,
        "timestamp without time zone" | "timestamp with time zone" => Datatype::Datetime,
        "interval" => Datatype::Duration,
        "array" => Datatype::Array,
        "json" | "jsonb" => Datatype::Object,
        "bytea" => Datatype::Binary,
        _ => Datatype::Unknown,
    }
}

pub struct PostgresConnector {
    pool: PgPool,
    table: String,
    marker: Option<String>,
}

impl PostgresConnector {
    /// Connect a small pool whose sessions default to read-only transactions.
    pub async fn connect(uri: &str, table: &str, marker: Option<&str>) -> Result<Self> {
        quote_table(table)?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(uri)
            .await
            .map_err(|e| QueryError::resolution(format!("failed to connect to postgres: {}", e)))?;
        info!("Connected postgres source (table '{}')", table);
        Ok(Self {
            pool,
            table: table.to_string(),
            marker: marker.map(String::from),
        })
    }
}

fn bind_value<'q>(query: Query<'q, Postgres, PgArguments>, value: &Value) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(Json(other.clone())),
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    fn dialect(&self) -> &dyn Dialect {
        &PostgresDialect
    }

    fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    async fn field_info(&self) -> Result<FieldCatalog> {
        let (schema, table) = match self.table.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, self.table.as_str()),
        };
        let query = r#"
            SELECT column_name, data_type
            FROM information_schema.columns
            WHERE table_name = $1 AND table_schema = COALESCE($2, current_schema())
            ORDER BY ordinal_position
        "#;
        let rows: Vec<(String, String)> = sqlx::query_as(query)
            .bind(table)
            .bind(schema)
            .fetch_all(&self.pool)
            .await
            .map_err(QueryError::execution)?;
        if rows.is_empty() {
            return Err(QueryError::execution(format!(
                "No columns found for table '{}' in information_schema.columns",
                self.table
            )));
        }
        debug!("postgres table '{}' has {} column(s)", self.table, rows.len());
        Ok(FieldCatalog::new(
            rows.into_iter()
                .map(|(name, data_type)| FieldDescriptor::new(name, info_schema_type_to_datatype(&data_type)))
                .collect(),
        ))
    }

    async fn read(&self, request: &ReadRequest<'_>) -> Result<ReadOutcome> {
        let stmt = build_select(&POSTGRES_FLAVOR, &PostgresDialect, &self.table, self.marker(), request)?;
        let mut query = sqlx::query(&stmt.sql);
        for value in &stmt.binds {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(QueryError::execution)?;
        let data = rows
            .iter()
            .map(|row| {
                row.try_get::<Json<Vec<Value>>, _>(0)
                    .map(|Json(values)| values)
                    .map_err(QueryError::execution)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(finish_read(request.fields, data, request.track_marker && self.marker.is_some()))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresFactory;

#[async_trait]
impl ConnectorFactory for PostgresFactory {
    /// Normalize `postgresql` and `+driver` schemes to `postgres://`.
    fn canonical_uri(&self, uri: &str) -> Result<String> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| QueryError::resolution(format!("invalid postgres uri: {}", e)))?;
        let scheme = parsed.scheme();
        let dialect = scheme.split('+').next().unwrap_or(scheme);
        if dialect != "postgres" && dialect != "postgresql" {
            return Err(QueryError::resolution(format!(
                "'{}' is not a postgres uri",
                scheme
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(QueryError::resolution("postgres uri has no host"));
        }
        Ok(format!("postgres{}", &parsed.as_str()[scheme.len()..]))
    }

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn Connector>> {
        let connector =
            PostgresConnector::connect(&descriptor.uri, &descriptor.table, descriptor.marker.as_deref()).await?;
        Ok(Arc::new(connector))
    }
}

/// Registration for `postgres` / `postgresql` descriptors.
pub fn postgres_registration() -> ConnectorRegistration {
    ConnectorRegistration {
        name: "sqlx_postgres".to_string(),
        factory: Arc::new(PostgresFactory),
        dialects: HashMap::from([
            ("postgres".to_string(), "postgresql".to_string()),
            ("postgresql".to_string(), "postgresql".to_string()),
        ]),
        default_dialect: "postgresql".to_string(),
        priority: 0,
    }
}
