use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;

/// Uniform cell value across all backends.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(Value),
    Array(Vec<CellValue>),
    /// A value the driver could not decode; carries the native type name.
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int16(i) => i.to_string(),
            CellValue::Int32(i) => i.to_string(),
            CellValue::Int64(i) => i.to_string(),
            CellValue::Float32(f) => f.to_string(),
            CellValue::Float64(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_string(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(", "))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::Int16(i) => Value::from(*i),
            CellValue::Int32(i) => Value::from(*i),
            CellValue::Int64(i) => Value::from(*i),
            CellValue::Float32(f) => Value::from(*f as f64),
            CellValue::Float64(f) => Value::from(*f),
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Bytes(b) => Value::from(b.clone()),
            CellValue::Date(d) => Value::String(d.to_string()),
            CellValue::Time(t) => Value::String(t.to_string()),
            CellValue::DateTime(dt) => Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            CellValue::TimestampTz(dt) => Value::String(dt.to_rfc3339()),
            CellValue::Json(j) => j.clone(),
            CellValue::Array(arr) => Value::Array(arr.iter().map(|v| v.to_json()).collect()),
            CellValue::Unknown(s) => Value::String(s.clone()),
        }
    }

    /// Map a JSON value from an HTTP backend.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => CellValue::Null,
            Value::Bool(b) => CellValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    CellValue::Int64(i)
                } else {
                    n.as_f64()
                        .map(CellValue::Float64)
                        .unwrap_or_else(|| CellValue::Text(n.to_string()))
                }
            }
            Value::String(s) => CellValue::Text(s),
            Value::Array(items) => CellValue::Array(items.into_iter().map(CellValue::from_json).collect()),
            obj @ Value::Object(_) => CellValue::Json(obj),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Rows as returned by a connector, before the executor maps them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build from JSON objects, taking columns in first-seen order.
    pub fn from_objects(objects: Vec<serde_json::Map<String, Value>>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for obj in &objects {
            for key in obj.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        let rows = objects
            .into_iter()
            .map(|mut obj| {
                columns
                    .iter()
                    .map(|c| obj.remove(c).map(CellValue::from_json).unwrap_or(CellValue::Null))
                    .collect()
            })
            .collect();
        Self { columns, rows }
    }
}

/// One output row: ordered field → value pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct Row(pub Vec<(String, CellValue)>);

impl Row {
    pub fn get(&self, field: &str) -> Option<&CellValue> {
        self.0.iter().find(|(name, _)| name == field).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
