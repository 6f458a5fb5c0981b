//! SQL rendering shared by the sqlx connectors.
//!
//! Statements are assembled only from quoted catalog identifiers, allowlisted
//! function names and operator tokens from the dialect's table. Every literal
//! a caller supplies is bound as a parameter.

use std::cmp::Ordering;

use rowtap_core::{
    Datatype, Dialect, FieldCatalog, FieldRef, FilterSpec, FuncExpr, FuncParam, NativeOperator, Operand, QueryError,
    Result, SelectResult,
};
use serde_json::Value;
use tracing::debug;

use crate::{ReadOutcome, ReadRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Numbered,
}

/// How rows come back from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    /// One result column per projected field.
    Columns,
    /// One JSON array per row. Calls are split every `max_args` columns and
    /// concatenated with `||`.
    JsonArray { function: &'static str, max_args: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct SqlFlavor {
    pub placeholder: Placeholder,
    pub rows: RowShape,
    /// LIMIT clause meaning "no limit", for backends that need one before OFFSET.
    pub unlimited: Option<&'static str>,
    /// SQL type bound literals are cast to, by the datatype of the compared field.
    pub literal_cast: fn(Datatype) -> Option<&'static str>,
}

pub fn no_literal_cast(_: Datatype) -> Option<&'static str> {
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub sql: String,
    pub binds: Vec<Value>,
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote `table` or `schema.table`. Each segment must be alphanumeric or `_`.
pub fn quote_table(table: &str) -> Result<String> {
    let segments: Vec<&str> = table.split('.').collect();
    let valid = segments.len() <= 2
        && segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if !valid {
        return Err(QueryError::resolution(format!(
            "Invalid table name '{}': only alphanumeric characters and underscores are allowed",
            table
        )));
    }
    Ok(segments
        .iter()
        .map(|s| quote_identifier(s))
        .collect::<Vec<_>>()
        .join("."))
}

struct SqlWriter<'a> {
    flavor: &'a SqlFlavor,
    dialect: &'a dyn Dialect,
    catalog: &'a FieldCatalog,
    binds: Vec<Value>,
}

impl<'a> SqlWriter<'a> {
    fn bind(&mut self, value: Value, datatype: Option<Datatype>) -> String {
        self.binds.push(value);
        let placeholder = match self.flavor.placeholder {
            Placeholder::Question => "?".to_string(),
            Placeholder::Numbered => format!("${}", self.binds.len()),
        };
        match datatype.and_then(self.flavor.literal_cast) {
            Some(sql_type) => format!("CAST({} AS {})", placeholder, sql_type),
            None => placeholder,
        }
    }

    fn field(&mut self, field: &FieldRef) -> Result<String> {
        match field {
            FieldRef::Name(name) => Ok(quote_identifier(name)),
            FieldRef::Value(value) => Ok(self.bind(value.clone(), None)),
            FieldRef::Func(func) => self.func(func),
        }
    }

    fn param(&mut self, param: &FuncParam) -> Result<String> {
        match param {
            FuncParam::Field(name) => Ok(quote_identifier(name)),
            FuncParam::Value(value) => Ok(self.bind(value.clone(), None)),
            FuncParam::Func(inner) => self.func(inner),
        }
    }

    fn func(&mut self, func: &FuncExpr) -> Result<String> {
        let dialect: &'a dyn Dialect = self.dialect;
        let allowlist = dialect.functions();
        let name = allowlist.canonical(&func.func).ok_or_else(|| {
            QueryError::validation(format!(
                "Function '{}' is not allowed for the {} dialect",
                func.func,
                dialect.name()
            ))
        })?;
        match (name, func.params.as_slice()) {
            ("cast", [expr, FuncParam::Value(Value::String(target))]) => {
                let sql_type = allowlist
                    .cast_type(target)
                    .ok_or_else(|| QueryError::validation(format!("Cannot cast to '{}'", target)))?;
                Ok(format!("CAST({} AS {})", self.param(expr)?, sql_type.to_ascii_uppercase()))
            }
            ("cast", _) => Err(QueryError::validation(
                "cast takes an expression and one of the dialect's cast types",
            )),
            ("distinct", [single]) => Ok(format!("DISTINCT {}", self.param(single)?)),
            ("count", []) => Ok("count(*)".to_string()),
            _ => {
                let args = func
                    .params
                    .iter()
                    .map(|p| self.param(p))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{}({})", name, args.join(", ")))
            }
        }
    }

    fn operand(&mut self, operand: &Operand, datatype: Option<Datatype>) -> Result<String> {
        match operand {
            Operand::Value(value) => Ok(self.bind(value.clone(), datatype)),
            Operand::Func(func) => self.func(func),
        }
    }

    fn filter(&mut self, filter: &FilterSpec) -> Result<String> {
        let native = self.dialect.native_operator(filter.operator).ok_or_else(|| {
            QueryError::validation(format!(
                "Operator '{}' is not supported by the {} dialect",
                filter.operator,
                self.dialect.name()
            ))
        })?;
        let datatype = self.catalog.datatype_of(&filter.field);
        let lhs = self.field(&filter.field)?;
        let clause = match native {
            NativeOperator::Compare(token) => {
                let rhs = self.operand(&filter.value, datatype)?;
                format!("{} {} {}", lhs, token, rhs)
            }
            NativeOperator::Pattern { keyword, prefix } => {
                let pattern = match (&filter.value, prefix) {
                    (Operand::Value(value), prefix) => {
                        let text = match value {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        self.bind(Value::String(format!("{}{}", prefix.unwrap_or(""), text)), None)
                    }
                    (Operand::Func(func), Some(prefix)) => {
                        let prefix = self.bind(Value::String(prefix.to_string()), None);
                        format!("({} || {})", prefix, self.func(func)?)
                    }
                    (Operand::Func(func), None) => self.func(func)?,
                };
                format!("{} {} {}", lhs, keyword, pattern)
            }
            NativeOperator::List { negated } => {
                let items = match &filter.value {
                    Operand::Value(Value::Array(items)) if items.is_empty() => {
                        return Err(QueryError::validation(format!(
                            "Operator '{}' needs a non-empty list",
                            filter.operator
                        )))
                    }
                    Operand::Value(Value::Array(items)) => items
                        .iter()
                        .map(|item| self.bind(item.clone(), datatype))
                        .collect::<Vec<_>>()
                        .join(", "),
                    other => self.operand(other, datatype)?,
                };
                let keyword = if negated { "NOT IN" } else { "IN" };
                format!("{} {} ({})", lhs, keyword, items)
            }
        };
        if filter.negate {
            Ok(format!("NOT ({})", clause))
        } else {
            Ok(clause)
        }
    }
}

/// Render one read as a parameterized SELECT.
pub fn build_select(
    flavor: &SqlFlavor,
    dialect: &dyn Dialect,
    table: &str,
    marker: Option<&str>,
    request: &ReadRequest<'_>,
) -> Result<SelectStatement> {
    let mut writer = SqlWriter {
        flavor,
        dialect,
        catalog: request.catalog,
        binds: Vec::new(),
    };
    let tracked = marker.filter(|_| request.track_marker);

    let mut columns = request
        .fields
        .iter()
        .map(|f| writer.field(f))
        .collect::<Result<Vec<_>>>()?;
    if let Some(marker) = tracked {
        columns.push(quote_identifier(marker));
    }
    let projection = match flavor.rows {
        RowShape::Columns => columns.join(", "),
        RowShape::JsonArray { function, max_args } => columns
            .chunks(max_args.max(1))
            .map(|chunk| format!("{}({})", function, chunk.join(", ")))
            .collect::<Vec<_>>()
            .join(" || "),
    };
    let source = quote_table(table)?;

    let mut conditions = request
        .filters
        .iter()
        .map(|f| writer.filter(f))
        .collect::<Result<Vec<_>>>()?;
    if let (Some(marker), Some(after)) = (tracked, request.after) {
        let datatype = request.catalog.get(marker).map(|d| d.datatype);
        let placeholder = writer.bind(after.clone(), datatype);
        conditions.push(format!("{} > {}", quote_identifier(marker), placeholder));
    }
    let selection = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    let order = match request.sort {
        Some(sort) => sort
            .iter()
            .map(|s| -> Result<String> { Ok(format!("{} {}", writer.field(&s.field)?, s.direction.as_sql())) })
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };
    let paging = paging_clause(flavor, request.limit, request.offset);

    // A tracked page is always cut in marker order, so the cursor never
    // skips past rows the page left out. A caller sort only reorders it.
    let sql = match tracked {
        Some(marker) if !order.is_empty() => format!(
            "SELECT {} FROM (SELECT * FROM {}{} ORDER BY {} ASC{}) AS \"page\" ORDER BY {}",
            projection,
            source,
            selection,
            quote_identifier(marker),
            paging,
            order.join(", ")
        ),
        Some(marker) => format!(
            "SELECT {} FROM {}{} ORDER BY {} ASC{}",
            projection,
            source,
            selection,
            quote_identifier(marker),
            paging
        ),
        None if !order.is_empty() => format!(
            "SELECT {} FROM {}{} ORDER BY {}{}",
            projection,
            source,
            selection,
            order.join(", "),
            paging
        ),
        None => format!("SELECT {} FROM {}{}{}", projection, source, selection, paging),
    };

    debug!("Rendered {} select: {} ({} bind(s))", dialect.name(), sql, writer.binds.len());
    Ok(SelectStatement {
        sql,
        binds: writer.binds,
    })
}

fn paging_clause(flavor: &SqlFlavor, limit: u64, offset: u64) -> String {
    let mut clause = String::new();
    if limit > 0 {
        clause.push_str(&format!(" LIMIT {}", limit));
    } else if offset > 0 {
        if let Some(unlimited) = flavor.unlimited {
            clause.push(' ');
            clause.push_str(unlimited);
        }
    }
    if offset > 0 {
        clause.push_str(&format!(" OFFSET {}", offset));
    }
    clause
}

/// Order two marker values. Numbers compare numerically, strings
/// lexicographically; anything else is treated as equal.
pub fn compare_markers(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Package fetched rows. When the marker was tracked, it is popped off the
/// end of every row and the largest non-null one is reported.
pub fn finish_read(fields: &[FieldRef], mut rows: Vec<Vec<Value>>, track_marker: bool) -> ReadOutcome {
    let mut last_marker: Option<Value> = None;
    if track_marker {
        for row in rows.iter_mut() {
            let Some(marker) = row.pop() else { continue };
            if marker.is_null() {
                continue;
            }
            let newer = last_marker
                .as_ref()
                .map_or(true, |seen| compare_markers(&marker, seen) == Ordering::Greater);
            if newer {
                last_marker = Some(marker);
            }
        }
    }
    ReadOutcome {
        result: SelectResult::new(fields.to_vec(), rows),
        last_marker,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::{PostgresDialect, POSTGRES_FLAVOR};
    use crate::sqlite::{SqliteDialect, SQLITE_FLAVOR};
    use rowtap_core::{FieldDescriptor, Operator, SortDirection, SortSpec};
    use serde_json::json;

    fn catalog() -> FieldCatalog {
        FieldCatalog::new(vec![
            FieldDescriptor::new("a", Datatype::Number),
            FieldDescriptor::new("b", Datatype::String),
            FieldDescriptor::new("c", Datatype::String),
            FieldDescriptor::new("d", Datatype::Date),
            FieldDescriptor::new("seq", Datatype::Number),
        ])
    }

    fn filter(field: &str, operator: Operator, value: Value) -> FilterSpec {
        FilterSpec {
            field: FieldRef::name(field),
            operator,
            value: Operand::Value(value),
            negate: false,
        }
    }

    fn request<'a>(catalog: &'a FieldCatalog, fields: &'a [FieldRef], filters: &'a [FilterSpec]) -> ReadRequest<'a> {
        ReadRequest {
            catalog,
            fields,
            filters,
            sort: None,
            limit: 50,
            offset: 0,
            after: None,
            track_marker: false,
        }
    }

    #[test]
    fn sqlite_select_binds_literals() {
        let cat = catalog();
        let fields = [FieldRef::name("a"), FieldRef::name("b")];
        let filters = [filter("a", Operator::Gt, json!(3))];
        let mut req = request(&cat, &fields, &filters);
        req.limit = 2;
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &req).unwrap();
        assert_eq!(stmt.sql, r#"SELECT "a", "b" FROM "t" WHERE "a" > ? LIMIT 2"#);
        assert_eq!(stmt.binds, vec![json!(3)]);
    }

    #[test]
    fn postgres_select_numbers_placeholders_and_builds_json_rows() {
        let cat = catalog();
        let fields = [FieldRef::name("a"), FieldRef::name("b")];
        let filters = [
            filter("a", Operator::Gt, json!(3)),
            filter("b", Operator::Search, json!("ab")),
            filter("d", Operator::Gte, json!("2024-01-01")),
        ];
        let sort = [SortSpec::new(FieldRef::name("a"), SortDirection::Descending)];
        let mut req = request(&cat, &fields, &filters);
        req.sort = Some(&sort);
        let stmt = build_select(&POSTGRES_FLAVOR, &PostgresDialect, "public.t", None, &req).unwrap();
        assert_eq!(
            stmt.sql,
            concat!(
                r#"SELECT jsonb_build_array("a", "b") FROM "public"."t" "#,
                r#"WHERE "a" > $1 AND "b" ~* $2 AND "d" >= CAST($3 AS date) "#,
                r#"ORDER BY "a" DESC LIMIT 50"#
            )
        );
        assert_eq!(stmt.binds, vec![json!(3), json!("ab"), json!("2024-01-01")]);
    }

    #[test]
    fn sqlite_search_gets_case_insensitive_prefix() {
        let cat = catalog();
        let fields = [FieldRef::name("b")];
        let filters = [
            filter("b", Operator::Search, json!("abc")),
            filter("c", Operator::NotRegex, json!("^x")),
        ];
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &request(&cat, &fields, &filters)).unwrap();
        assert!(stmt.sql.contains(r#"WHERE "b" REGEXP ? AND "c" NOT REGEXP ?"#), "{}", stmt.sql);
        assert_eq!(stmt.binds, vec![json!("(?i)abc"), json!("^x")]);
    }

    #[test]
    fn negated_list_membership() {
        let cat = catalog();
        let fields = [FieldRef::name("a")];
        let mut f = filter("a", Operator::In, json!([1, 2]));
        f.negate = true;
        let filters = [f, filter("b", Operator::NotIn, json!(["x"]))];
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &request(&cat, &fields, &filters)).unwrap();
        assert!(stmt.sql.contains(r#"WHERE NOT ("a" IN (?, ?)) AND "b" NOT IN (?)"#), "{}", stmt.sql);
        assert_eq!(stmt.binds, vec![json!(1), json!(2), json!("x")]);
    }

    #[test]
    fn functions_render_from_the_allowlist() {
        let cat = catalog();
        let fields = [
            FieldRef::Func(FuncExpr::new(
                "CAST",
                vec![FuncParam::Field("b".to_string()), FuncParam::Value(json!("integer"))],
            )),
            FieldRef::Func(FuncExpr::new("count", vec![])),
            FieldRef::Func(FuncExpr::new(
                "count",
                vec![FuncParam::Func(FuncExpr::new("distinct", vec![FuncParam::Field("c".to_string())]))],
            )),
        ];
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &request(&cat, &fields, &[])).unwrap();
        assert_eq!(
            stmt.sql,
            r#"SELECT CAST("b" AS INTEGER), count(*), count(DISTINCT "c") FROM "t" LIMIT 50"#
        );

        let bad = [FieldRef::Func(FuncExpr::new("load_extension", vec![FuncParam::Value(json!("x.so"))]))];
        assert!(build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &request(&cat, &bad, &[])).is_err());
    }

    #[test]
    fn function_operands_keep_bind_order() {
        let cat = catalog();
        let fields = [FieldRef::name("a")];
        let filters = [FilterSpec {
            field: FieldRef::Func(FuncExpr::new("lower", vec![FuncParam::Field("b".to_string())])),
            operator: Operator::Search,
            value: Operand::Func(FuncExpr::new("lower", vec![FuncParam::Value(json!("X"))])),
            negate: false,
        }];
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &request(&cat, &fields, &filters)).unwrap();
        assert!(stmt.sql.contains(r#"WHERE lower("b") REGEXP (? || lower(?))"#), "{}", stmt.sql);
        assert_eq!(stmt.binds, vec![json!("(?i)"), json!("X")]);
    }

    #[test]
    fn marker_tracking_appends_column_and_orders() {
        let cat = catalog();
        let fields = [FieldRef::name("a")];
        let after = json!(7);
        let mut req = request(&cat, &fields, &[]);
        req.track_marker = true;
        req.after = Some(&after);
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", Some("seq"), &req).unwrap();
        assert_eq!(
            stmt.sql,
            r#"SELECT "a", "seq" FROM "t" WHERE "seq" > ? ORDER BY "seq" ASC LIMIT 50"#
        );
        assert_eq!(stmt.binds, vec![json!(7)]);

        req.track_marker = false;
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", Some("seq"), &req).unwrap();
        assert_eq!(stmt.sql, r#"SELECT "a" FROM "t" LIMIT 50"#);
    }

    #[test]
    fn tracked_pages_are_cut_in_marker_order_before_sorting() {
        let cat = catalog();
        let fields = [FieldRef::name("a")];
        let filters = [filter("b", Operator::Eq, json!("x"))];
        let sort = [SortSpec::new(FieldRef::name("a"), SortDirection::Descending)];
        let after = json!(7);
        let mut req = request(&cat, &fields, &filters);
        req.sort = Some(&sort);
        req.limit = 1;
        req.track_marker = true;
        req.after = Some(&after);
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", Some("seq"), &req).unwrap();
        assert_eq!(
            stmt.sql,
            concat!(
                r#"SELECT "a", "seq" FROM (SELECT * FROM "t" WHERE "b" = ? AND "seq" > ? "#,
                r#"ORDER BY "seq" ASC LIMIT 1) AS "page" ORDER BY "a" DESC"#
            )
        );
        assert_eq!(stmt.binds, vec![json!("x"), json!(7)]);

        let stmt = build_select(&POSTGRES_FLAVOR, &PostgresDialect, "t", Some("seq"), &req).unwrap();
        assert_eq!(
            stmt.sql,
            concat!(
                r#"SELECT jsonb_build_array("a", "seq") FROM (SELECT * FROM "t" WHERE "b" = $1 AND "seq" > $2 "#,
                r#"ORDER BY "seq" ASC LIMIT 1) AS "page" ORDER BY "a" DESC"#
            )
        );
    }

    #[test]
    fn unlimited_with_offset() {
        let cat = catalog();
        let fields = [FieldRef::name("a")];
        let mut req = request(&cat, &fields, &[]);
        req.limit = 0;
        req.offset = 5;
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &req).unwrap();
        assert_eq!(stmt.sql, r#"SELECT "a" FROM "t" LIMIT -1 OFFSET 5"#);
        let stmt = build_select(&POSTGRES_FLAVOR, &PostgresDialect, "t", None, &req).unwrap();
        assert_eq!(stmt.sql, r#"SELECT jsonb_build_array("a") FROM "t" OFFSET 5"#);
        req.offset = 0;
        let stmt = build_select(&SQLITE_FLAVOR, &SqliteDialect, "t", None, &req).unwrap();
        assert_eq!(stmt.sql, r#"SELECT "a" FROM "t""#);
    }

    #[test]
    fn json_rows_are_chunked() {
        let cat = catalog();
        let fields = [FieldRef::name("a"), FieldRef::name("b"), FieldRef::name("c")];
        let flavor = SqlFlavor {
            rows: RowShape::JsonArray {
                function: "jsonb_build_array",
                max_args: 2,
            },
            ..POSTGRES_FLAVOR
        };
        let stmt = build_select(&flavor, &PostgresDialect, "t", None, &request(&cat, &fields, &[])).unwrap();
        assert!(stmt
            .sql
            .starts_with(r#"SELECT jsonb_build_array("a", "b") || jsonb_build_array("c") FROM"#));
    }

    #[test]
    fn table_names_are_validated() {
        assert_eq!(quote_table("events").unwrap(), r#""events""#);
        assert_eq!(quote_table("audit.events").unwrap(), r#""audit"."events""#);
        assert!(quote_table("events; drop table x").is_err());
        assert!(quote_table("a.b.c").is_err());
        assert!(quote_table("").is_err());
        assert_eq!(quote_identifier(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn finish_read_pops_markers() {
        let fields = [FieldRef::name("a")];
        let rows = vec![
            vec![json!("x"), json!(3)],
            vec![json!("y"), json!(9)],
            vec![json!("z"), Value::Null],
        ];
        let outcome = finish_read(&fields, rows, true);
        assert_eq!(outcome.last_marker, Some(json!(9)));
        assert_eq!(outcome.result.data, vec![vec![json!("x")], vec![json!("y")], vec![json!("z")]]);

        let outcome = finish_read(&fields, vec![vec![json!("x")]], false);
        assert_eq!(outcome.last_marker, None);
        assert_eq!(outcome.result.data, vec![vec![json!("x")]]);
    }

    #[test]
    fn marker_ordering() {
        assert_eq!(compare_markers(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_markers(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(
            compare_markers(&json!("2024-01-02"), &json!("2024-01-01")),
            Ordering::Greater
        );
    }
}
