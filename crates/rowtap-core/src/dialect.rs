//! Operator tables, function allowlists and the `Dialect` seam.
//!
//! Every connector declares a closed operator table and a closed function
//! allowlist. Nothing a caller sends is ever evaluated outside these tables.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::catalog::FieldCatalog;
use crate::expr::FieldRef;

/// Logical filter operators understood by the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gte,
    Gt,
    Lte,
    Lt,
    In,
    NotIn,
    Regex,
    NotRegex,
    Search,
    NotSearch,
}

impl Operator {
    /// Accepted spellings, in the order flat `<field>_<operator>` parameters
    /// are scanned.
    pub const ALIASES: &'static [(&'static str, Operator)] = &[
        ("eq", Operator::Eq),
        ("=", Operator::Eq),
        ("ne", Operator::Ne),
        ("!=", Operator::Ne),
        ("<>", Operator::Ne),
        ("gte", Operator::Gte),
        (">=", Operator::Gte),
        ("min", Operator::Gte),
        ("gt", Operator::Gt),
        (">", Operator::Gt),
        ("lte", Operator::Lte),
        ("<=", Operator::Lte),
        ("max", Operator::Lte),
        ("lt", Operator::Lt),
        ("<", Operator::Lt),
        ("in", Operator::In),
        ("not_in", Operator::NotIn),
        ("notin", Operator::NotIn),
        ("regex", Operator::Regex),
        ("~", Operator::Regex),
        ("not_regex", Operator::NotRegex),
        ("notregex", Operator::NotRegex),
        ("!~", Operator::NotRegex),
        ("search", Operator::Search),
        ("~*", Operator::Search),
        ("not_search", Operator::NotSearch),
        ("notsearch", Operator::NotSearch),
        ("!~*", Operator::NotSearch),
    ];

    pub fn parse(token: &str) -> Option<Operator> {
        Self::ALIASES
            .iter()
            .find(|(alias, _)| *alias == token)
            .map(|(_, op)| *op)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gte => "gte",
            Operator::Gt => "gt",
            Operator::Lte => "lte",
            Operator::Lt => "lt",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::Regex => "regex",
            Operator::NotRegex => "not_regex",
            Operator::Search => "search",
            Operator::NotSearch => "not_search",
        }
    }

    pub fn is_pattern(self) -> bool {
        matches!(
            self,
            Operator::Regex | Operator::NotRegex | Operator::Search | Operator::NotSearch
        )
    }

    pub fn is_list(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Native semantics of a logical operator in one dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeOperator {
    /// `lhs <token> rhs`
    Compare(&'static str),
    /// `lhs <keyword> pattern`; `prefix` is prepended to the pattern
    /// (e.g. `(?i)` for case-insensitive matching).
    Pattern {
        keyword: &'static str,
        prefix: Option<&'static str>,
    },
    /// `lhs [NOT] IN (..)`
    List { negated: bool },
}

pub type OperatorTable = &'static [(Operator, NativeOperator)];

/// Closed set of callable function names plus permitted `cast` targets.
#[derive(Debug)]
pub struct FunctionAllowlist {
    functions: &'static [&'static str],
    cast_types: &'static [&'static str],
}

impl FunctionAllowlist {
    pub const fn new(functions: &'static [&'static str], cast_types: &'static [&'static str]) -> Self {
        Self {
            functions,
            cast_types,
        }
    }

    /// The allowlisted spelling of `name`, matched case-insensitively.
    pub fn canonical(&self, name: &str) -> Option<&'static str> {
        if !is_plain_identifier(name) {
            return None;
        }
        self.functions
            .iter()
            .find(|f| f.eq_ignore_ascii_case(name))
            .copied()
    }

    pub fn allows(&self, name: &str) -> bool {
        self.canonical(name).is_some()
    }

    pub fn cast_type(&self, name: &str) -> Option<&'static str> {
        self.cast_types
            .iter()
            .find(|t| t.eq_ignore_ascii_case(name.trim()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Where function expressions are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionPolicy {
    pub filter: bool,
    pub sort: bool,
    pub fields: bool,
}

impl Default for FunctionPolicy {
    fn default() -> Self {
        Self {
            filter: true,
            sort: true,
            fields: true,
        }
    }
}

/// The compile-time capability set of a connector.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn operators(&self) -> OperatorTable;

    fn functions(&self) -> &FunctionAllowlist;

    fn function_policy(&self) -> FunctionPolicy {
        FunctionPolicy::default()
    }

    fn native_operator(&self, op: Operator) -> Option<NativeOperator> {
        self.operators()
            .iter()
            .find(|(logical, _)| *logical == op)
            .map(|(_, native)| *native)
    }

    /// Whether `op` may be applied to `field`. Checked during compilation;
    /// a `false` rejects the filter before anything executes.
    fn check_operator_datatype(&self, field: &FieldRef, op: Operator, catalog: &FieldCatalog) -> bool {
        if self.native_operator(op).is_none() {
            return false;
        }
        if op.is_pattern() {
            if let Some(datatype) = catalog.datatype_of(field) {
                return datatype.is_textual();
            }
        }
        true
    }
}
