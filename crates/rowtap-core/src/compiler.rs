//! The query compiler: one connector's dialect plus its current catalog.
//!
//! Filter, sort and projection compilation live in `filter.rs` and `sort.rs`
//! as further `impl QueryCompiler` blocks; this module holds the shared
//! field-or-function checks and the top-level `compile` entry point.

use tracing::debug;

use crate::catalog::FieldCatalog;
use crate::dialect::{Dialect, FunctionAllowlist};
use crate::error::{QueryError, Result};
use crate::expr::{FieldRef, FuncExpr, FuncParam};
use crate::filter::FilterSpec;
use crate::params::{
    parse_count, parse_seconds, OutputFormat, QueryParams, QueryProperties, DEFAULT_LIMIT, DEFAULT_POLL,
};

/// Everything needed to execute and format one select.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub properties: QueryProperties,
    pub filters: Vec<FilterSpec>,
    pub client_id: Option<String>,
    pub format: OutputFormat,
    pub pretty: bool,
}

pub struct QueryCompiler<'a> {
    pub(crate) dialect: &'a dyn Dialect,
    pub(crate) catalog: &'a FieldCatalog,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(dialect: &'a dyn Dialect, catalog: &'a FieldCatalog) -> Self {
        Self { dialect, catalog }
    }

    pub fn catalog(&self) -> &FieldCatalog {
        self.catalog
    }

    /// Compile the full parameter surface. Any invalid piece rejects the
    /// whole query.
    pub fn compile(&self, params: &QueryParams) -> Result<CompiledQuery> {
        let format = OutputFormat::parse(params.get("format"))?;
        let properties = QueryProperties {
            limit: parse_count(params, "limit", DEFAULT_LIMIT)?,
            offset: parse_count(params, "offset", 0)?,
            sort: self.sort_list(params.get("sort"), params.get("sortdir"))?,
            fields: self.fields_list(params.get("fields"))?,
            wait: parse_seconds(params, "wait", std::time::Duration::ZERO)?,
            poll: parse_seconds(params, "poll", DEFAULT_POLL)?,
            initwait: parse_seconds(params, "initwait", std::time::Duration::ZERO)?,
        };
        let filters = self.compile_filters(params.get("filters"), params)?;
        debug!(
            "Compiled {} query: {} filter(s), limit={}, offset={}",
            self.dialect.name(),
            filters.len(),
            properties.limit,
            properties.offset
        );
        Ok(CompiledQuery {
            properties,
            filters,
            client_id: params.get("clientid").filter(|c| !c.is_empty()).map(String::from),
            format,
            pretty: params.get("pretty") == Some("true"),
        })
    }

    /// Whether `field` is a known field, or (with `allow_func`) a valid
    /// function expression.
    pub fn is_field(&self, field: &FieldRef, allow_func: bool) -> bool {
        self.check_field(field, allow_func, "Fields").is_ok()
    }

    /// Like [`is_field`](Self::is_field) but with a descriptive error.
    pub(crate) fn check_field(&self, field: &FieldRef, allow_func: bool, context: &str) -> Result<()> {
        match field {
            FieldRef::Name(name) if self.catalog.contains(name) => Ok(()),
            FieldRef::Name(name) => Err(QueryError::validation(format!(
                "{} must use known fields; '{}' is not a known field",
                context, name
            ))),
            FieldRef::Value(_) => Err(QueryError::validation(format!(
                "{} must use known fields, not literal values",
                context
            ))),
            FieldRef::Func(_) if !allow_func => Err(QueryError::validation(format!(
                "{} do not allow function expressions for the {} dialect",
                context,
                self.dialect.name()
            ))),
            FieldRef::Func(func) => self.check_func(func),
        }
    }

    /// Validate a function expression (recursively) against the allowlist.
    pub(crate) fn check_func(&self, func: &FuncExpr) -> Result<()> {
        let allowlist = self.dialect.functions();
        let name = allowlist.canonical(&func.func).ok_or_else(|| {
            QueryError::validation(format!(
                "Function '{}' is not allowed for the {} dialect",
                func.func,
                self.dialect.name()
            ))
        })?;
        if name == "cast" {
            check_cast(func, allowlist)?;
        }
        for param in &func.params {
            match param {
                FuncParam::Field(field) => match self.catalog.get(field) {
                    Some(desc) if desc.allowed_as_function_arg => {}
                    Some(_) => {
                        return Err(QueryError::validation(format!(
                            "Field '{}' cannot be used as a function argument",
                            field
                        )))
                    }
                    None => {
                        return Err(QueryError::validation(format!(
                            "Function '{}' references unknown field '{}'",
                            name, field
                        )))
                    }
                },
                FuncParam::Func(inner) => self.check_func(inner)?,
                FuncParam::Value(_) => {}
            }
        }
        Ok(())
    }
}

fn check_cast(func: &FuncExpr, allowlist: &FunctionAllowlist) -> Result<()> {
    match func.params.as_slice() {
        [_, FuncParam::Value(serde_json::Value::String(target))] if allowlist.cast_type(target).is_some() => Ok(()),
        _ => Err(QueryError::validation(
            "cast takes an expression and one of the dialect's cast types",
        )),
    }
}
