//! Filter compilation: raw filter payloads and flat parameters into a
//! canonical, validated list of [`FilterSpec`].

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::compiler::QueryCompiler;
use crate::dialect::Operator;
use crate::error::{QueryError, Result};
use crate::expr::{FieldRef, FuncExpr};
use crate::params::{is_reserved, QueryParams};

const FILTER_KEYS: &[&str] = &[
    "field", "operator", "value", "negate", "lvalue", "lfunc", "func", "param", "params", "lparam", "lparams", "rfunc",
    "rparam", "rparams",
];

/// Right side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Func(FuncExpr),
}

impl Operand {
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) if map.contains_key("func") => Ok(Operand::Func(FuncExpr::from_map(map)?)),
            other => Ok(Operand::Value(other.clone())),
        }
    }
}

impl Serialize for Operand {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Operand::Value(value) => value.serialize(serializer),
            Operand::Func(func) => func.serialize(serializer),
        }
    }
}

/// A validated filter in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub field: FieldRef,
    pub operator: Operator,
    pub value: Operand,
    pub negate: bool,
}

impl Serialize for FilterSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("field", &self.field)?;
        map.serialize_entry("operator", &self.operator)?;
        map.serialize_entry("value", &self.value)?;
        if self.negate {
            map.serialize_entry("negate", &true)?;
        }
        map.end()
    }
}

/// Non-null and not an empty string, list or mapping.
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn first_of<'m>(map: &'m Map<String, Value>, keys: &[&str]) -> Option<&'m Value> {
    keys.iter().find_map(|k| map.get(*k))
}

impl QueryCompiler<'_> {
    /// Compile the `filters` JSON list plus any `<field>` / `<field>_<op>`
    /// flat parameters. Fails as a whole on the first invalid filter.
    pub fn compile_filters(&self, filters_value: Option<&str>, params: &QueryParams) -> Result<Vec<FilterSpec>> {
        let mut filters = Vec::new();
        if let Some(raw) = filters_value.filter(|v| !v.is_empty()) {
            let entries = match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(entries)) => entries,
                _ => return Err(QueryError::validation("The filters parameter must be a JSON list.")),
            };
            for entry in &entries {
                filters.push(self.validate_filter(entry)?);
            }
        }
        for field in self.catalog.iter() {
            let flat = std::iter::once(("", Operator::Eq)).chain(Operator::ALIASES.iter().copied());
            for (alias, operator) in flat {
                let name = if alias.is_empty() {
                    field.name.clone()
                } else {
                    format!("{}_{}", field.name, alias)
                };
                if is_reserved(&name) {
                    continue;
                }
                let Some(raw) = params.get(&name) else {
                    continue;
                };
                let value = if operator.is_list() {
                    Value::Array(
                        raw.split(',')
                            .map(str::trim)
                            .filter(|v| !v.is_empty())
                            .map(|v| Value::String(v.to_string()))
                            .collect(),
                    )
                } else {
                    Value::String(raw.to_string())
                };
                let mut entry = Map::new();
                entry.insert("field".to_string(), Value::String(field.name.clone()));
                entry.insert("operator".to_string(), Value::String(operator.as_str().to_string()));
                entry.insert("value".to_string(), value);
                filters.push(self.validate_filter(&Value::Object(entry))?);
            }
        }
        Ok(filters)
    }

    /// Validate one filter entry (positional list or mapping) and return it
    /// in canonical form.
    pub fn validate_filter(&self, entry: &Value) -> Result<FilterSpec> {
        let map = match entry {
            Value::Array(items) => {
                let mut map = Map::new();
                match items.as_slice() {
                    [field, value] => {
                        map.insert("field".to_string(), field.clone());
                        map.insert("value".to_string(), value.clone());
                    }
                    [field, operator, value] => {
                        map.insert("field".to_string(), field.clone());
                        map.insert("operator".to_string(), operator.clone());
                        map.insert("value".to_string(), value.clone());
                    }
                    _ => {
                        return Err(QueryError::validation(
                            "Filters in list format must have two or three components.",
                        ))
                    }
                }
                map
            }
            Value::Object(map) => {
                if let Some(key) = map.keys().find(|k| !FILTER_KEYS.contains(&k.as_str())) {
                    return Err(QueryError::validation(format!("Unknown filter property '{}'", key)));
                }
                map.clone()
            }
            other => {
                return Err(QueryError::validation(format!(
                    "Each filter must be a list or an object, got {}",
                    other
                )))
            }
        };

        let operator = match map.get("operator") {
            None | Some(Value::Null) => Operator::Eq,
            Some(Value::String(token)) => Operator::parse(token)
                .ok_or_else(|| QueryError::validation(format!("Unknown filter operator '{}'", token)))?,
            Some(other) => return Err(QueryError::validation(format!("Unknown filter operator {}", other))),
        };

        let field = if let Some(field) = map.get("field") {
            Some(FieldRef::from_json(field)?)
        } else if let Some(lvalue) = map.get("lvalue") {
            Some(FieldRef::Value(lvalue.clone()))
        } else if let Some(func) = first_of(&map, &["func", "lfunc"]) {
            let params = first_of(&map, &["param", "params", "lparam", "lparams"]);
            Some(FieldRef::Func(FuncExpr::from_parts(func, params)?))
        } else {
            None
        };

        let value = if let Some(value) = map.get("value") {
            Some(Operand::from_json(value)?)
        } else if let Some(rfunc) = map.get("rfunc") {
            let params = first_of(&map, &["rparam", "rparams"]);
            Some(Operand::Func(FuncExpr::from_parts(rfunc, params)?))
        } else {
            None
        };

        let field = field.ok_or_else(|| QueryError::validation("Filter must specify a field or func."))?;
        let allow_func = self.dialect.function_policy().filter;
        if !matches!(field, FieldRef::Value(_)) {
            self.check_field(&field, allow_func, "Filters")?;
        }

        let value = match value {
            Some(Operand::Func(func)) => {
                if !allow_func {
                    return Err(QueryError::validation(format!(
                        "Filters do not allow function expressions for the {} dialect",
                        self.dialect.name()
                    )));
                }
                self.check_func(&func)?;
                Operand::Func(func)
            }
            Some(Operand::Value(value)) if is_present(&value) => Operand::Value(value),
            _ => return Err(QueryError::validation("Filters must have a value or rfunc.")),
        };
        if operator.is_list() && !matches!(value, Operand::Value(Value::Array(_))) {
            return Err(QueryError::validation(format!(
                "The {} operator requires a non-empty list value",
                operator
            )));
        }

        if !self.dialect.check_operator_datatype(&field, operator, self.catalog) {
            return Err(QueryError::validation(format!(
                "Cannot use {} operator on field {}",
                operator, field
            )));
        }

        let value = match (value, self.catalog.datatype_of(&field)) {
            (Operand::Value(v), Some(datatype)) => Operand::Value(datatype.coerce(v)),
            (value, _) => value,
        };

        let negate = match map.get("negate") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(QueryError::validation(format!(
                    "Filter 'negate' must be a boolean, got {}",
                    other
                )))
            }
        };

        Ok(FilterSpec {
            field,
            operator,
            value,
            negate,
        })
    }
}
