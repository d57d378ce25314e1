//! Column-typed in-memory tables.
//!
//! A [`Table`] is the unit every stage and view consumes and produces: an
//! ordered list of [`ColumnDef`]s plus positional rows of [`Value`]s.
//! Timestamps are normalised to microsecond precision on the way in so that a
//! table survives a round trip through the store unchanged.

use std::collections::HashSet;
use std::fmt;
use std::ops::Range;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ChronicleError, Result};

// ---------------------------------------------------------------------------
// DataType / Value
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Utf8,
    Int64,
    Float64,
    Boolean,
    Timestamp,
    Json,
    Uuid,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Utf8 => "utf8",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Boolean => "boolean",
            DataType::Timestamp => "timestamp",
            DataType::Json => "json",
            DataType::Uuid => "uuid",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Utf8(String),
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Json(serde_json::Value),
    Uuid(Uuid),
}

impl Value {
    /// The type of a non-null value.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Json(_) => Some(DataType::Json),
            Value::Uuid(_) => Some(DataType::Uuid),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(id) => Some(*id),
            _ => None,
        }
    }

    /// Convert a JSON value into a cell of the given type. JSON `null` is
    /// accepted for every type; nullability is a schema concern.
    pub fn from_json(json: &serde_json::Value, data_type: DataType) -> std::result::Result<Value, String> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || format!("expected {data_type}, got {json}");
        match data_type {
            DataType::Utf8 => json
                .as_str()
                .map(|s| Value::Utf8(s.to_string()))
                .ok_or_else(mismatch),
            DataType::Int64 => json.as_i64().map(Value::Int64).ok_or_else(mismatch),
            DataType::Float64 => json.as_f64().map(Value::Float64).ok_or_else(mismatch),
            DataType::Boolean => json.as_bool().map(Value::Boolean).ok_or_else(mismatch),
            DataType::Timestamp => {
                let raw = json.as_str().ok_or_else(mismatch)?;
                let parsed = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| format!("invalid timestamp '{raw}': {e}"))?;
                Ok(Value::Timestamp(truncate_to_micros(parsed.with_timezone(&Utc))))
            }
            DataType::Json => Ok(Value::Json(json.clone())),
            DataType::Uuid => {
                let raw = json.as_str().ok_or_else(mismatch)?;
                Uuid::parse_str(raw)
                    .map(Value::Uuid)
                    .map_err(|e| format!("invalid uuid '{raw}': {e}"))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Utf8(s) => serde_json::Value::String(s.clone()),
            Value::Int64(v) => serde_json::json!(v),
            Value::Float64(v) => serde_json::json!(v),
            Value::Boolean(v) => serde_json::Value::Bool(*v),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Json(v) => v.clone(),
            Value::Uuid(id) => serde_json::Value::String(id.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Utf8(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Utf8(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Utf8(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(ts: DateTime<Utc>) -> Self {
        Value::Timestamp(truncate_to_micros(ts))
    }
}

impl From<Uuid> for Value {
    fn from(id: Uuid) -> Self {
        Value::Uuid(id)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Drop sub-microsecond precision; the store keeps integer microseconds.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

// ---------------------------------------------------------------------------
// ColumnDef
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    /// Closed set of permitted utf8 values, checked during value validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl ColumnDef {
    pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
            allowed: None,
        }
    }

    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            allowed: None,
        }
    }

    pub fn with_allowed<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: Vec<String> = values.into_iter().map(Into::into).collect();
        values.sort();
        self.allowed = Some(values);
        self
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<ColumnDef>,
    rows: Vec<Vec<Value>>,
}

/// Borrowed view of one row, addressable by column name.
#[derive(Debug, Clone, Copy)]
pub struct RowView<'a> {
    columns: &'a [ColumnDef],
    values: &'a [Value],
    index: usize,
}

impl<'a> RowView<'a> {
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(idx)
    }

    pub fn values(&self) -> &'a [Value] {
        self.values
    }

    /// Position of the row in its table.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Table {
    /// A table with the given columns and no rows.
    pub fn empty(columns: Vec<ColumnDef>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table, checking unique column names and row arity.
    pub fn new(columns: Vec<ColumnDef>, rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return Err(ChronicleError::InvalidTable(format!(
                    "duplicate column '{}'",
                    col.name
                )));
            }
        }
        let mut table = Self::empty(columns);
        for row in rows {
            table.push(row)?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<Value>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        self.rows.get(index).map(|values| RowView {
            columns: &self.columns,
            values,
            index,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RowView<'_>> {
        self.rows.iter().enumerate().map(|(index, values)| RowView {
            columns: &self.columns,
            values,
            index,
        })
    }

    /// Value at `(row, column)`, or `None` if either is out of range.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn push(&mut self, row: Vec<Value>) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(ChronicleError::InvalidTable(format!(
                "row {} has {} values, table has {} columns",
                self.rows.len(),
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    /// Keep rows matching `predicate`, preserving order.
    pub fn filter(&self, mut predicate: impl FnMut(&RowView<'_>) -> bool) -> Table {
        let rows = self
            .iter()
            .filter(|row| predicate(row))
            .map(|row| row.values.to_vec())
            .collect();
        Table {
            columns: self.columns.clone(),
            rows,
        }
    }

    /// Rows in `range`, clamped to the table length.
    pub fn slice(&self, range: Range<usize>) -> Table {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        Table {
            columns: self.columns.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// Project onto `names`, in that order.
    pub fn select(&self, names: &[&str]) -> Result<Table> {
        let indices = names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    ChronicleError::InvalidTable(format!("no column named '{name}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let columns = indices.iter().map(|&i| self.columns[i].clone()).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Table { columns, rows })
    }

    pub fn drop_column(&self, name: &str) -> Result<Table> {
        let keep: Vec<&str> = self
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .filter(|n| *n != name)
            .collect();
        if keep.len() == self.columns.len() {
            return Err(ChronicleError::InvalidTable(format!(
                "no column named '{name}'"
            )));
        }
        self.select(&keep)
    }

    /// Append a column. `values` must have one entry per row.
    pub fn with_column(&self, column: ColumnDef, values: Vec<Value>) -> Result<Table> {
        if self.column_index(&column.name).is_some() {
            return Err(ChronicleError::InvalidTable(format!(
                "duplicate column '{}'",
                column.name
            )));
        }
        if values.len() != self.rows.len() {
            return Err(ChronicleError::InvalidTable(format!(
                "column '{}' has {} values, table has {} rows",
                column.name,
                values.len(),
                self.rows.len()
            )));
        }
        let mut columns = self.columns.clone();
        columns.push(column);
        let rows = self
            .rows
            .iter()
            .zip(values)
            .map(|(row, value)| {
                let mut row = row.clone();
                row.push(value);
                row
            })
            .collect();
        Ok(Table { columns, rows })
    }

    /// Parse JSON objects (one per row) against `columns`. Missing keys are
    /// null; unknown keys are rejected rather than dropped.
    pub fn from_records(columns: Vec<ColumnDef>, records: &[serde_json::Value]) -> Result<Table> {
        let mut table = Table::new(columns, Vec::new())?;
        for (i, record) in records.iter().enumerate() {
            let object = record.as_object().ok_or_else(|| {
                ChronicleError::InvalidTable(format!("record {i} is not a JSON object"))
            })?;
            if let Some(unknown) = object.keys().find(|k| table.column_index(k).is_none()) {
                return Err(ChronicleError::InvalidTable(format!(
                    "record {i} has unknown field '{unknown}'"
                )));
            }
            let row = table
                .columns
                .iter()
                .map(|col| {
                    let raw = object.get(&col.name).unwrap_or(&serde_json::Value::Null);
                    Value::from_json(raw, col.data_type).map_err(|e| {
                        ChronicleError::InvalidTable(format!("record {i}, '{}': {e}", col.name))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            table.rows.push(row);
        }
        Ok(table)
    }

    pub fn to_records(&self) -> Vec<serde_json::Value> {
        self.rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row)
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::required("id", DataType::Int64),
            ColumnDef::nullable("text", DataType::Utf8),
        ]
    }

    fn sample() -> Table {
        Table::new(
            columns(),
            vec![
                vec![Value::Int64(1), Value::from("a")],
                vec![Value::Int64(2), Value::Null],
                vec![Value::Int64(3), Value::from("c")],
            ],
        )
        .unwrap()
    }

    #[test]
    fn new_rejects_wrong_arity() {
        let err = Table::new(columns(), vec![vec![Value::Int64(1)]]).unwrap_err();
        assert!(matches!(err, ChronicleError::InvalidTable(_)));
    }

    #[test]
    fn new_rejects_duplicate_columns() {
        let cols = vec![
            ColumnDef::required("id", DataType::Int64),
            ColumnDef::required("id", DataType::Utf8),
        ];
        assert!(Table::new(cols, Vec::new()).is_err());
    }

    #[test]
    fn filter_preserves_order() {
        let t = sample().filter(|row| !row.get("text").map_or(true, Value::is_null));
        assert_eq!(t.len(), 2);
        assert_eq!(t.value(0, "id"), Some(&Value::Int64(1)));
        assert_eq!(t.value(1, "id"), Some(&Value::Int64(3)));
    }

    #[test]
    fn slice_is_clamped() {
        let t = sample();
        assert_eq!(t.slice(1..10).len(), 2);
        assert!(t.slice(5..9).is_empty());
    }

    #[test]
    fn select_and_drop_column() {
        let t = sample();
        let only_text = t.select(&["text"]).unwrap();
        assert_eq!(only_text.column_names(), vec!["text"]);
        let dropped = t.drop_column("text").unwrap();
        assert_eq!(dropped.column_names(), vec!["id"]);
        assert!(t.drop_column("missing").is_err());
    }

    #[test]
    fn with_column_appends() {
        let t = sample()
            .with_column(
                ColumnDef::required("rank", DataType::Int64),
                vec![Value::Int64(0), Value::Int64(1), Value::Int64(2)],
            )
            .unwrap();
        assert_eq!(t.column_names(), vec!["id", "text", "rank"]);
        assert_eq!(t.value(2, "rank"), Some(&Value::Int64(2)));
    }

    #[test]
    fn records_round_trip() {
        let cols = vec![
            ColumnDef::required("id", DataType::Uuid),
            ColumnDef::required("ts", DataType::Timestamp),
            ColumnDef::nullable("attrs", DataType::Json),
        ];
        let records = vec![json!({
            "id": "6f1c4d4e-8a55-4c36-9d32-0b1bb0f2a7c1",
            "ts": "2024-03-01T10:15:00Z",
            "attrs": {"lang": "en"}
        })];
        let t = Table::from_records(cols.clone(), &records).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.to_records(), records);
    }

    #[test]
    fn records_reject_unknown_fields() {
        let err = Table::from_records(columns(), &[json!({"id": 1, "colour": "red"})]).unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn timestamps_truncate_to_micros() {
        let v = Value::from_json(&json!("2024-01-01T00:00:00.123456789Z"), DataType::Timestamp)
            .unwrap();
        let ts = v.as_timestamp().unwrap();
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn allowed_values_are_sorted() {
        let col = ColumnDef::nullable("media_type", DataType::Utf8).with_allowed(["video", "audio"]);
        assert_eq!(col.allowed, Some(vec!["audio".to_string(), "video".to_string()]));
    }
}
