//! Result reshaping and lazy output encoding.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{QueryError, Result};
use crate::expr::FieldRef;
use crate::params::OutputFormat;

/// Raw result of one read: the projected fields and row values aligned
/// with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectResult {
    pub fields: Vec<FieldRef>,
    pub data: Vec<Vec<Value>>,
}

impl SelectResult {
    pub fn new(fields: Vec<FieldRef>, data: Vec<Vec<Value>>) -> Self {
        Self { fields, data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn column_names(&self) -> Vec<String> {
        column_names(&self.fields)
    }
}

fn column_names(fields: &[FieldRef]) -> Vec<String> {
    fields.iter().enumerate().map(|(i, f)| f.column_name(i)).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultData {
    List(Vec<Vec<Value>>),
    Dict(Vec<Map<String, Value>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    List,
    Dict,
}

/// The serialized response document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub fields: Vec<FieldRef>,
    /// Column name -> position in each row.
    pub columns: Map<String, Value>,
    pub data: ResultData,
    /// Rows returned, not total matches.
    pub datacount: usize,
    pub format: DataFormat,
}

impl QueryResult {
    pub fn from_select(result: SelectResult) -> Self {
        let mut columns = Map::new();
        for (index, name) in result.column_names().into_iter().enumerate() {
            columns.insert(name, Value::from(index));
        }
        Self {
            datacount: result.data.len(),
            fields: result.fields,
            columns,
            data: ResultData::List(result.data),
            format: DataFormat::List,
        }
    }

    /// Turn each row into a column-name -> value mapping.
    pub fn into_dict(self) -> Self {
        let rows = match self.data {
            ResultData::List(rows) => {
                let names = column_names(&self.fields);
                rows.into_iter()
                    .map(|row| names.iter().cloned().zip(row).collect::<Map<String, Value>>())
                    .collect()
            }
            ResultData::Dict(rows) => rows,
        };
        Self {
            data: ResultData::Dict(rows),
            format: DataFormat::Dict,
            ..self
        }
    }
}

/// Recursively sort object keys (pretty output).
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// One JSON document, encoded when first pulled.
#[derive(Debug)]
pub struct JsonBody {
    result: Option<QueryResult>,
    pretty: bool,
}

impl Iterator for JsonBody {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.result.take()?;
        let encoded = if self.pretty {
            serde_json::to_value(&result).and_then(|v| serde_json::to_string_pretty(&sort_keys(v)))
        } else {
            serde_json::to_string(&result)
        };
        Some(encoded.map_err(QueryError::from))
    }
}

/// CSV lines: header first, then one line per row.
#[derive(Debug)]
pub struct CsvLines {
    header: Option<Vec<String>>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

fn csv_cell(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn encode_csv_record<I: IntoIterator<Item = String>>(cells: I) -> Result<String> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(cells)
        .map_err(|e| QueryError::execution(format!("csv encoding: {}", e)))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| QueryError::execution(format!("csv encoding: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| QueryError::execution(format!("csv encoding: {}", e)))
}

impl Iterator for CsvLines {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(header) = self.header.take() {
            return Some(encode_csv_record(header));
        }
        let row = self.rows.next()?;
        Some(encode_csv_record(row.into_iter().map(csv_cell)))
    }
}

/// A lazily produced response body.
#[derive(Debug)]
pub enum ResultBody {
    Json(JsonBody),
    Csv(CsvLines),
}

impl ResultBody {
    /// Shape `result` per `format`. Nothing is encoded until iterated.
    pub fn render(result: SelectResult, format: OutputFormat, pretty: bool) -> Self {
        match format {
            OutputFormat::Csv => ResultBody::Csv(CsvLines {
                header: Some(result.column_names()),
                rows: result.data.into_iter(),
            }),
            OutputFormat::List | OutputFormat::Dict => {
                let mut shaped = QueryResult::from_select(result);
                if format == OutputFormat::Dict {
                    shaped = shaped.into_dict();
                }
                ResultBody::Json(JsonBody {
                    result: Some(shaped),
                    pretty,
                })
            }
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ResultBody::Json(_) => OutputFormat::List.mime_type(),
            ResultBody::Csv(_) => OutputFormat::Csv.mime_type(),
        }
    }

    /// Rows not yet encoded.
    pub fn row_count(&self) -> usize {
        match self {
            ResultBody::Json(body) => body.result.as_ref().map_or(0, |r| r.datacount),
            ResultBody::Csv(lines) => lines.rows.len(),
        }
    }

    /// Drain the body into one string.
    pub fn collect_string(self) -> Result<String> {
        self.collect()
    }
}

impl Iterator for ResultBody {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            ResultBody::Json(body) => body.next(),
            ResultBody::Csv(lines) => lines.next(),
        }
    }
}
