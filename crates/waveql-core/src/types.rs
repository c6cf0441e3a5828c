// SPDX-License-Identifier: Apache-2.0

//! Universal data types for WaveQL
//!
//! Remote payloads are schema-less JSON. They are converted once, at the
//! fetch boundary, into the typed `Value` tree below using a `Schema`
//! inferred by the schema registry; nothing downstream re-inspects raw JSON.

use std::fmt;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use compact_str::CompactString;
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::schema::merge_types;

/// Unique identifier for a running query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cache key of a schema: the source that serves the table plus the table name
/// as the source knows it (qualifier and quotes stripped).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableKey {
    pub source_id: String,
    pub table: String,
}

impl TableKey {
    pub fn new(source_id: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.source_id, self.table)
    }
}

/// Inferred column type. Struct and list types nest, which is what makes
/// dotted paths such as `user.profile.score` addressable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Timestamp,
    Struct(Vec<Column>),
    List(Box<DataType>),
}

impl DataType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Looks up a direct child field of a struct type.
    pub fn field(&self, name: &str) -> Option<&Column> {
        match self {
            DataType::Struct(fields) => fields.iter().find(|f| f.name == name),
            _ => None,
        }
    }
}

/// Structural equality: struct fields are compared by name and type,
/// independent of field order and nullability.
impl PartialEq for DataType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DataType::Struct(a), DataType::Struct(b)) => {
                a.len() == b.len()
                    && a.iter().all(|fa| {
                        b.iter()
                            .any(|fb| fb.name == fa.name && fb.data_type == fa.data_type)
                    })
            }
            (DataType::List(a), DataType::List(b)) => a == b,
            (DataType::Null, DataType::Null)
            | (DataType::Boolean, DataType::Boolean)
            | (DataType::Integer, DataType::Integer)
            | (DataType::Float, DataType::Float)
            | (DataType::String, DataType::String)
            | (DataType::Timestamp, DataType::Timestamp) => true,
            _ => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => write!(f, "null"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::Integer => write!(f, "integer"),
            DataType::Float => write!(f, "float"),
            DataType::String => write!(f, "string"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Struct(fields) => {
                write!(f, "struct<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, ">")
            }
            DataType::List(inner) => write!(f, "list<{inner}>"),
        }
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: CompactString,
    pub data_type: DataType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<CompactString>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }
}

/// Ordered column list of a table. Published schemas are immutable; evolution
/// replaces the whole `Arc<Schema>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.to_string()).collect()
    }

    /// Resolves a dotted path (`["user", "profile", "score"]`) to its type.
    pub fn resolve_path(&self, path: &[String]) -> Option<&DataType> {
        let (first, rest) = path.split_first()?;
        let mut current = &self.column(first)?.data_type;
        for part in rest {
            current = &current.field(part)?.data_type;
        }
        Some(current)
    }

    /// The schema viewed as one struct type (used for merging and diffing).
    pub fn as_struct(&self) -> DataType {
        DataType::Struct(self.columns.clone())
    }

    /// Name/type equality regardless of column order and nullability.
    pub fn structurally_eq(&self, other: &Schema) -> bool {
        self.as_struct() == other.as_struct()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", column.name, column.data_type)?;
        }
        write!(f, "}}")
    }
}

/// Universal typed value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    /// Struct fields in schema order.
    Struct(Vec<(String, Value)>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Navigates into nested struct fields.
    pub fn get_path(&self, path: &[String]) -> Option<&Value> {
        let mut current = self;
        for part in path {
            match current {
                Value::Struct(fields) => {
                    current = fields.iter().find(|(name, _)| name == part).map(|(_, v)| v)?;
                }
                Value::Null => return Some(current),
                _ => return None,
            }
        }
        Some(current)
    }

    /// Type observed for this value; used to describe local-stage output columns.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Boolean,
            Value::Int(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::Text(_) => DataType::String,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Struct(fields) => DataType::Struct(
                fields
                    .iter()
                    .map(|(name, v)| Column::new(name.as_str(), v.data_type(), v.is_null()))
                    .collect(),
            ),
            Value::List(items) => DataType::List(Box::new(
                items
                    .iter()
                    .map(Value::data_type)
                    .fold(DataType::Null, |acc, t| merge_types(&acc, &t)),
            )),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Struct(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(name, v)| (name.clone(), v.to_json()))
                    .collect(),
            ),
            Value::List(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }

    /// Converts a raw JSON value into a typed value of `data_type`.
    ///
    /// Sources such as ServiceNow return every scalar as a string, so numeric
    /// and boolean strings are accepted for numeric and boolean columns.
    /// Columns that were only ever observed as null are carried as text.
    pub fn from_json(json: &serde_json::Value, data_type: &DataType) -> Result<Value, String> {
        use serde_json::Value as J;

        if json.is_null() {
            return Ok(Value::Null);
        }

        let mismatch = || Err(format!("expected {data_type}, found {}", preview(json)));

        match data_type {
            DataType::Null | DataType::String => Ok(Value::Text(match json {
                J::String(s) => s.clone(),
                other => other.to_string(),
            })),
            DataType::Boolean => match json {
                J::Bool(b) => Ok(Value::Bool(*b)),
                J::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                J::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                _ => mismatch(),
            },
            DataType::Integer => match json {
                J::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::Int(i))
                    } else {
                        match n.as_f64() {
                            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Ok(Value::Int(f as i64)),
                            _ => mismatch(),
                        }
                    }
                }
                J::String(s) => s.trim().parse::<i64>().map(Value::Int).or_else(|_| mismatch()),
                _ => mismatch(),
            },
            DataType::Float => match json {
                J::Number(n) => n.as_f64().map(Value::Float).ok_or(()).or_else(|_| mismatch()),
                J::String(s) => s.trim().parse::<f64>().map(Value::Float).or_else(|_| mismatch()),
                _ => mismatch(),
            },
            DataType::Timestamp => match json {
                J::String(s) => parse_timestamp(s).map(Value::Timestamp).ok_or(()).or_else(|_| mismatch()),
                _ => mismatch(),
            },
            DataType::Struct(fields) => match json {
                J::Object(map) => {
                    let mut values = Vec::with_capacity(fields.len());
                    for field in fields {
                        let value = match map.get(field.name.as_str()) {
                            Some(raw) => Value::from_json(raw, &field.data_type)
                                .map_err(|e| format!("{}: {e}", field.name))?,
                            None => Value::Null,
                        };
                        values.push((field.name.to_string(), value));
                    }
                    Ok(Value::Struct(values))
                }
                _ => mismatch(),
            },
            DataType::List(inner) => match json {
                J::Array(items) => items
                    .iter()
                    .map(|item| Value::from_json(item, inner))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List),
                _ => mismatch(),
            },
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            Value::Struct(_) | Value::List(_) => write!(f, "{}", self.to_json()),
        }
    }
}

fn preview(json: &serde_json::Value) -> String {
    let mut text = json.to_string();
    if text.len() > 40 {
        let mut cut = 40;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        text.push('…');
    }
    text
}

fn timestamp_shape() -> &'static Regex {
    static SHAPE: OnceLock<Regex> = OnceLock::new();
    SHAPE.get_or_init(|| {
        Regex::new(
            r"^\d{4}-\d{2}-\d{2}(?:[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d{1,9})?)?(?:Z|[+-]\d{2}:?\d{2})?)?$",
        )
        .unwrap_or_else(|_| unreachable!("timestamp pattern is a valid regex"))
    })
}

/// Parses the timestamp spellings seen in REST payloads: RFC 3339,
/// `YYYY-MM-DD HH:MM[:SS[.fff]]` (taken as UTC) and bare dates.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if !timestamp_shape().is_match(text) {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// A single row of data, positionally aligned with its table's schema
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Converts one semi-structured record against `schema`. Keys that the
    /// schema does not know are ignored; missing keys become null.
    pub fn from_record(record: &serde_json::Value, schema: &Schema) -> Result<Row, String> {
        let object = match record {
            serde_json::Value::Object(map) => map,
            other => {
                // Scalar records are exposed as a single `value` column.
                return schema
                    .columns
                    .iter()
                    .map(|c| {
                        if c.name == "value" {
                            Value::from_json(other, &c.data_type)
                        } else {
                            Ok(Value::Null)
                        }
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Row::new);
            }
        };

        let mut values = Vec::with_capacity(schema.len());
        for column in &schema.columns {
            let value = match object.get(column.name.as_str()) {
                Some(raw) => Value::from_json(raw, &column.data_type)
                    .map_err(|e| format!("column '{}': {e}", column.name))?,
                None => Value::Null,
            };
            values.push(value);
        }
        Ok(Row { values })
    }
}

/// A schema plus its rows
#[derive(Debug, Clone)]
pub struct Table {
    pub schema: Arc<Schema>,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(schema: Arc<Schema>, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    pub fn empty(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
