//! Sort and projection compilation.

use serde::ser::{SerializeTuple, Serializer};
use serde::Serialize;
use serde_json::Value;

use crate::compiler::QueryCompiler;
use crate::error::{QueryError, Result};
use crate::expr::FieldRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    /// Descending only for `-1`, `"-1"`, `"desc"` and `"DESC"`.
    pub fn from_token(token: Option<&Value>) -> Self {
        let descending = match token {
            Some(Value::Number(n)) => n.as_i64() == Some(-1) || n.as_f64() == Some(-1.0),
            Some(Value::String(s)) => matches!(s.as_str(), "-1" | "desc" | "DESC"),
            _ => false,
        };
        if descending {
            SortDirection::Descending
        } else {
            SortDirection::Ascending
        }
    }

    pub fn sign(self) -> i8 {
        match self {
            SortDirection::Ascending => 1,
            SortDirection::Descending => -1,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortSpec {
    pub field: FieldRef,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: FieldRef, direction: SortDirection) -> Self {
        Self { field, direction }
    }
}

/// Serialized as `[field, 1 | -1]`, which also reparses as a sort entry.
impl Serialize for SortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        tuple.serialize_element(&self.field)?;
        tuple.serialize_element(&self.direction.sign())?;
        tuple.end()
    }
}

impl QueryCompiler<'_> {
    /// Parse `sort` (a field name or a JSON list) and `sortdir`.
    ///
    /// A bare name never allows function expressions; JSON list entries
    /// follow the dialect's sort policy. One bad entry rejects the list.
    pub fn sort_list(&self, sort_value: Option<&str>, sort_dir: Option<&str>) -> Result<Option<Vec<SortSpec>>> {
        let raw = match sort_value {
            None | Some("") => return Ok(None),
            Some(raw) => raw,
        };
        let rejected = || QueryError::validation("Sort must use known fields.");
        if !raw.contains('[') {
            let field = FieldRef::name(raw);
            self.check_field(&field, false, "Sort").map_err(|_| rejected())?;
            let dir = sort_dir.map(|d| Value::String(d.to_string()));
            return Ok(Some(vec![SortSpec::new(field, SortDirection::from_token(dir.as_ref()))]));
        }
        let entries = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(entries)) => entries,
            _ => {
                return Err(QueryError::validation(
                    "The sort parameter must be a JSON list or a known field name.",
                ))
            }
        };
        let allow_func = self.dialect.function_policy().sort;
        let mut sort = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (field, dir) = match entry {
                Value::Array(pair) if (1..=2).contains(&pair.len()) => (&pair[0], pair.get(1)),
                other => (other, None),
            };
            let field = FieldRef::from_json(field).map_err(|_| rejected())?;
            self.check_field(&field, allow_func, "Sort").map_err(|_| rejected())?;
            sort.push(SortSpec::new(field, SortDirection::from_token(dir)));
        }
        Ok(Some(sort))
    }

    /// Parse `fields` (comma-separated names or a JSON list). Order and
    /// duplicates are preserved.
    pub fn fields_list(&self, fields_value: Option<&str>) -> Result<Option<Vec<FieldRef>>> {
        let raw = match fields_value {
            None | Some("") => return Ok(None),
            Some(raw) => raw,
        };
        let fields: Vec<FieldRef> = if !raw.contains('[') {
            raw.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(FieldRef::name)
                .collect()
        } else {
            let entries = match serde_json::from_str::<Value>(raw) {
                Ok(Value::Array(entries)) => entries,
                _ => {
                    return Err(QueryError::validation(
                        "The fields parameter must be a JSON list or a comma-separated list of known field names.",
                    ))
                }
            };
            entries.iter().map(FieldRef::from_json).collect::<Result<_>>()?
        };
        let allow_func = self.dialect.function_policy().fields;
        for field in &fields {
            self.check_field(field, allow_func, "Fields")?;
        }
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::tests::{catalog, dialect, TestDialect};
    use crate::dialect::FunctionPolicy;
    use crate::expr::{FuncExpr, FuncParam};
    use serde_json::json;

    #[test]
    fn direction_tokens() {
        assert_eq!(SortDirection::from_token(Some(&json!(-1))), SortDirection::Descending);
        assert_eq!(SortDirection::from_token(Some(&json!("-1"))), SortDirection::Descending);
        assert_eq!(SortDirection::from_token(Some(&json!("desc"))), SortDirection::Descending);
        assert_eq!(SortDirection::from_token(Some(&json!("DESC"))), SortDirection::Descending);
        assert_eq!(SortDirection::from_token(Some(&json!("Desc"))), SortDirection::Ascending);
        assert_eq!(SortDirection::from_token(Some(&json!(1))), SortDirection::Ascending);
        assert_eq!(SortDirection::from_token(None), SortDirection::Ascending);
    }

    #[test]
    fn sort_list_from_json_pairs() {
        let (d, cat) = (dialect(), catalog());
        let sort = QueryCompiler::new(&d, &cat)
            .sort_list(Some(r#"[["a","desc"],["b"]]"#), None)
            .unwrap()
            .unwrap();
        let signs: Vec<(String, i8)> = sort.iter().map(|s| (s.field.to_string(), s.direction.sign())).collect();
        assert_eq!(signs, vec![("a".to_string(), -1), ("b".to_string(), 1)]);
    }

    #[test]
    fn sort_bare_field_with_sortdir() {
        let (d, cat) = (dialect(), catalog());
        let compiler = QueryCompiler::new(&d, &cat);
        let sort = compiler.sort_list(Some("b"), Some("-1")).unwrap().unwrap();
        assert_eq!(sort, vec![SortSpec::new(FieldRef::name("b"), SortDirection::Descending)]);
        assert_eq!(compiler.sort_list(Some(""), Some("desc")).unwrap(), None);
    }

    #[test]
    fn sort_unknown_field_raises() {
        let (d, cat) = (dialect(), catalog());
        let compiler = QueryCompiler::new(&d, &cat);
        let err = compiler.sort_list(Some("unknownfield"), None).unwrap_err();
        assert_eq!(err, QueryError::validation("Sort must use known fields."));
        // One bad entry rejects the whole list.
        assert!(compiler.sort_list(Some(r#"[["a"], ["zzz", "desc"]]"#), None).is_err());
        assert!(compiler.sort_list(Some(r#"[["a", "desc", 3]]"#), None).is_err());
        assert!(compiler.sort_list(Some("[not json"), None).is_err());
    }

    #[test]
    fn sort_bare_entries_and_functions() {
        let (d, cat) = (dialect(), catalog());
        let compiler = QueryCompiler::new(&d, &cat);
        let sort = compiler
            .sort_list(Some(r#"["a", [{"func": "lower", "param": [{"field": "b"}]}, -1]]"#), None)
            .unwrap()
            .unwrap();
        assert_eq!(sort[0], SortSpec::new(FieldRef::name("a"), SortDirection::Ascending));
        assert_eq!(
            sort[1],
            SortSpec::new(
                FieldRef::Func(FuncExpr::new("lower", vec![FuncParam::Field("b".to_string())])),
                SortDirection::Descending
            )
        );

        let d = TestDialect {
            policy: FunctionPolicy {
                sort: false,
                ..FunctionPolicy::default()
            },
        };
        let compiler = QueryCompiler::new(&d, &cat);
        assert!(compiler
            .sort_list(Some(r#"[[{"func": "lower", "param": [{"field": "b"}]}]]"#), None)
            .is_err());
    }

    #[test]
    fn sort_serializes_as_reparseable_pairs() {
        let (d, cat) = (dialect(), catalog());
        let compiler = QueryCompiler::new(&d, &cat);
        let sort = compiler.sort_list(Some(r#"[["a","DESC"],"b"]"#), None).unwrap().unwrap();
        let json = serde_json::to_string(&sort).unwrap();
        assert_eq!(json, r#"[["a",-1],["b",1]]"#);
        assert_eq!(compiler.sort_list(Some(&json), None).unwrap().unwrap(), sort);
    }

    #[test]
    fn fields_list_keeps_order_and_duplicates() {
        let (d, cat) = (dialect(), catalog());
        let compiler = QueryCompiler::new(&d, &cat);
        let fields = compiler.fields_list(Some("a, b,a")).unwrap().unwrap();
        assert_eq!(
            fields,
            vec![FieldRef::name("a"), FieldRef::name("b"), FieldRef::name("a")]
        );
        assert!(compiler.fields_list(Some("a, b,zzz")).is_err());
        assert_eq!(compiler.fields_list(None).unwrap(), None);
        assert_eq!(compiler.fields_list(Some(" , ")).unwrap(), None);
    }

    #[test]
    fn fields_list_from_json() {
        let (d, cat) = (dialect(), catalog());
        let compiler = QueryCompiler::new(&d, &cat);
        let fields = compiler
            .fields_list(Some(r#"["c", {"func": "upper", "param": [{"field": "b"}], "reference": "B"}]"#))
            .unwrap()
            .unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[1].column_name(1), "B");
        assert!(compiler.fields_list(Some(r#"{"a": 1}"#)).is_err());
        assert!(compiler.fields_list(Some(r#"[{"value": 3}]"#)).is_err());
        assert!(compiler.fields_list(Some(r#"[{"func": "hex", "param": [{"field": "b"}]}]"#)).is_err());
    }
}
