//! Field catalog - what a connector says it can filter, sort and project.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::expr::FieldRef;

/// Semantic datatype of a field, independent of the backend's type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    Number,
    Boolean,
    String,
    Date,
    Datetime,
    Duration,
    Array,
    Object,
    Binary,
    Unknown,
}

impl Datatype {
    /// Coerce a caller literal toward this datatype when the conversion is
    /// unambiguous. Flat query parameters always arrive as strings, so
    /// `"3"` against a number field becomes `3`.
    pub fn coerce(self, value: Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.coerce(v)).collect()),
            Value::String(s) => match self {
                Datatype::Number => parse_number(&s).unwrap_or(Value::String(s)),
                Datatype::Boolean => match s.as_str() {
                    "true" => Value::Bool(true),
                    "false" => Value::Bool(false),
                    _ => Value::String(s),
                },
                _ => Value::String(s),
            },
            other => other,
        }
    }

    pub fn is_textual(self) -> bool {
        matches!(self, Datatype::String | Datatype::Unknown)
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Value::from(i));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn default_true() -> bool {
    true
}

/// Metadata for one known field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub datatype: Datatype,
    /// Display / column name, when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Whether the field may be passed to an allowlisted function.
    #[serde(default = "default_true")]
    pub allowed_as_function_arg: bool,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            datatype,
            reference: None,
            allowed_as_function_arg: true,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn without_function_args(mut self) -> Self {
        self.allowed_as_function_arg = false;
        self
    }
}

/// The set of fields a connector instance currently exposes, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldCatalog {
    fields: Vec<FieldDescriptor>,
}

impl FieldCatalog {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Datatype of a plain field reference; `None` for literals, functions
    /// and unknown names.
    pub fn datatype_of(&self, field: &FieldRef) -> Option<Datatype> {
        match field {
            FieldRef::Name(name) => self.get(name).map(|f| f.datatype),
            _ => None,
        }
    }
}
