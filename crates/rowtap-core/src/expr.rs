//! Field references and function-call expressions.
//!
//! Callers can address a column by name, wrap a literal (`{"value": v}`), or
//! build a function call (`{"func": "lower", "param": [{"field": "town"}]}`).
//! Parsing accepts exactly those shapes; serialization always emits the
//! canonical form so that parse(serialize(x)) == x.

use std::fmt;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{QueryError, Result};

const FUNC_KEYS: &[&str] = &["func", "param", "params", "reference"];

/// The left side of a filter, and the element type of sorts and projections.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRef {
    Name(String),
    Value(Value),
    Func(FuncExpr),
}

/// A call to an allowlisted function.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncExpr {
    pub func: String,
    pub params: Vec<FuncParam>,
    /// Output column name when the expression is projected.
    pub reference: Option<String>,
}

/// One argument of a [`FuncExpr`].
#[derive(Debug, Clone, PartialEq)]
pub enum FuncParam {
    Field(String),
    Value(Value),
    Func(FuncExpr),
}

impl FieldRef {
    pub fn name(name: impl Into<String>) -> Self {
        FieldRef::Name(name.into())
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::String(name) => Ok(FieldRef::Name(name.clone())),
            Value::Object(map) if map.contains_key("func") => Ok(FieldRef::Func(FuncExpr::from_map(map)?)),
            Value::Object(map) if map.len() == 1 && map.contains_key("value") => {
                Ok(FieldRef::Value(map["value"].clone()))
            }
            other => Err(QueryError::validation(format!(
                "A field must be a field name, a {{\"value\": ...}} wrapper or a {{\"func\": ...}} expression, got {}",
                other
            ))),
        }
    }

    /// Name used for this entry in the `columns` index and CSV header.
    pub fn column_name(&self, index: usize) -> String {
        match self {
            FieldRef::Name(name) => name.clone(),
            FieldRef::Func(FuncExpr {
                reference: Some(reference),
                ..
            }) => reference.clone(),
            _ => format!("column_{}", index),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRef::Name(name) => write!(f, "{}", name),
            other => write!(f, "{}", serde_json::to_string(other).map_err(|_| fmt::Error)?),
        }
    }
}

impl Serialize for FieldRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FieldRef::Name(name) => serializer.serialize_str(name),
            FieldRef::Value(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("value", value)?;
                map.end()
            }
            FieldRef::Func(func) => func.serialize(serializer),
        }
    }
}

impl FuncExpr {
    pub fn new(func: impl Into<String>, params: Vec<FuncParam>) -> Self {
        Self {
            func: func.into(),
            params,
            reference: None,
        }
    }

    /// Build from a `{"func": .., "param"|"params": .., "reference"?: ..}` mapping.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        if let Some(key) = map.keys().find(|k| !FUNC_KEYS.contains(&k.as_str())) {
            return Err(QueryError::validation(format!(
                "Unexpected key '{}' in function expression",
                key
            )));
        }
        let func = map.get("func").ok_or_else(|| QueryError::validation("Function expression is missing 'func'"))?;
        let mut expr = Self::from_parts(func, map.get("param").or_else(|| map.get("params")))?;
        expr.reference = match map.get("reference") {
            None | Some(Value::Null) => None,
            Some(Value::String(r)) => Some(r.clone()),
            Some(other) => {
                return Err(QueryError::validation(format!(
                    "Function reference must be a string, got {}",
                    other
                )))
            }
        };
        Ok(expr)
    }

    /// Build from a function name value and an optional raw parameter list.
    /// A scalar parameter is treated as a one-element list.
    pub fn from_parts(func: &Value, params: Option<&Value>) -> Result<Self> {
        let Value::String(name) = func else {
            return Err(QueryError::validation(format!(
                "Function name must be a string, got {}",
                func
            )));
        };
        let params = match params {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(FuncParam::from_json).collect::<Result<_>>()?,
            Some(single) => vec![FuncParam::from_json(single)?],
        };
        Ok(Self::new(name.clone(), params))
    }

    /// Function names anywhere in this expression, outermost first.
    pub fn function_names(&self) -> Vec<&str> {
        let mut names = vec![self.func.as_str()];
        for param in &self.params {
            if let FuncParam::Func(inner) = param {
                names.extend(inner.function_names());
            }
        }
        names
    }
}

impl Serialize for FuncExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let len = if self.reference.is_some() { 3 } else { 2 };
        let mut map = serializer.serialize_map(Some(len))?;
        map.serialize_entry("func", &self.func)?;
        map.serialize_entry("param", &self.params)?;
        if let Some(reference) = &self.reference {
            map.serialize_entry("reference", reference)?;
        }
        map.end()
    }
}

impl FuncParam {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) if map.contains_key("func") => Ok(FuncParam::Func(FuncExpr::from_map(map)?)),
            Value::Object(map) if map.len() == 1 && map.contains_key("field") => match &map["field"] {
                Value::String(name) => Ok(FuncParam::Field(name.clone())),
                other => Err(QueryError::validation(format!(
                    "Function field parameter must be a name, got {}",
                    other
                ))),
            },
            Value::Object(map) if map.len() == 1 && map.contains_key("value") => {
                Ok(FuncParam::Value(map["value"].clone()))
            }
            other => Ok(FuncParam::Value(other.clone())),
        }
    }
}

impl Serialize for FuncParam {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FuncParam::Field(name) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("field", name)?;
                map.end()
            }
            FuncParam::Value(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("value", value)?;
                map.end()
            }
            FuncParam::Func(func) => func.serialize(serializer),
        }
    }
}
