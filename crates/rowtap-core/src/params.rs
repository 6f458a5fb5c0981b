//! The caller-facing parameter surface and the query properties parsed from it.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{QueryError, Result};
use crate::expr::FieldRef;
use crate::sort::SortSpec;

/// Control parameters. A flat parameter with exactly one of these names is
/// never treated as a filter, even if a field has the same name.
pub const RESERVED_PARAMETERS: &[&str] = &[
    "limit", "offset", "sort", "sortdir", "fields", "wait", "poll", "initwait", "clientid", "filters", "format",
    "pretty",
];

pub const DEFAULT_LIMIT: u64 = 50;
pub const DEFAULT_POLL: Duration = Duration::from_secs(10);

pub fn is_reserved(name: &str) -> bool {
    RESERVED_PARAMETERS.contains(&name)
}

/// Raw query parameters, as received from the host (all values are strings).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct QueryParams(HashMap<String, String>);

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Builder-style insert, handy for callers assembling parameters in code.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashMap<String, String>> for QueryParams {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for QueryParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Output representation requested with `format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    List,
    Dict,
    Csv,
}

impl OutputFormat {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value {
            None | Some("") | Some("list") => Ok(OutputFormat::List),
            Some("dict") => Ok(OutputFormat::Dict),
            Some("csv") => Ok(OutputFormat::Csv),
            Some(other) => Err(QueryError::validation(format!(
                "Unknown format '{}'; expected list, dict or csv",
                other
            ))),
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::List | OutputFormat::Dict => "application/json",
            OutputFormat::Csv => "text/csv",
        }
    }
}

/// Paging, ordering, projection and long-poll timing for one select.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryProperties {
    /// Maximum rows returned; 0 means unlimited.
    pub limit: u64,
    pub offset: u64,
    pub sort: Option<Vec<SortSpec>>,
    /// `None` projects every catalog field.
    pub fields: Option<Vec<FieldRef>>,
    pub wait: Duration,
    pub poll: Duration,
    pub initwait: Duration,
}

impl Default for QueryProperties {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
            sort: None,
            fields: None,
            wait: Duration::ZERO,
            poll: DEFAULT_POLL,
            initwait: Duration::ZERO,
        }
    }
}

pub(crate) fn parse_count(params: &QueryParams, name: &str, default: u64) -> Result<u64> {
    match params.get(name).map(str::trim) {
        None | Some("") => Ok(default),
        Some(raw) => raw.parse::<u64>().map_err(|_| {
            QueryError::validation(format!("{} must be a non-negative integer, got '{}'", name, raw))
        }),
    }
}

pub(crate) fn parse_seconds(params: &QueryParams, name: &str, default: Duration) -> Result<Duration> {
    let raw = match params.get(name).map(str::trim) {
        None | Some("") => return Ok(default),
        Some(raw) => raw,
    };
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| QueryError::validation(format!("{} must be a non-negative number of seconds, got '{}'", name, raw)))
}
