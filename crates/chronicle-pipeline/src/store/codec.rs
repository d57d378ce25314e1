//! Mapping between [`Value`]s and SQLite storage classes.
//!
//! Timestamps are stored as integer microseconds since the epoch, uuids and
//! json as text, booleans as 0/1.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};
use uuid::Uuid;

use chronicle_types::{ChronicleError, ColumnDef, DataType, Result, Table, Value};

pub(crate) type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| ChronicleError::InvalidTable(format!("timestamp out of range: {micros}")))
}

/// Column affinity used when materialising a table inside SQLite.
pub(crate) fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Int64 | DataType::Boolean | DataType::Timestamp => "INTEGER",
        DataType::Float64 => "REAL",
        DataType::Utf8 | DataType::Json | DataType::Uuid => "TEXT",
    }
}

pub(crate) fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Utf8(s) => query.bind(s.clone()),
        Value::Int64(v) => query.bind(*v),
        Value::Float64(v) => query.bind(*v),
        Value::Boolean(v) => query.bind(*v),
        Value::Timestamp(ts) => query.bind(to_micros(*ts)),
        Value::Json(v) => query.bind(v.to_string()),
        Value::Uuid(id) => query.bind(id.to_string()),
    }
}

fn decode_failure(column: &str, message: impl std::fmt::Display) -> ChronicleError {
    ChronicleError::InvalidTable(format!("cannot decode column '{column}': {message}"))
}

pub(crate) fn decode_value(row: &SqliteRow, column: &str, data_type: DataType) -> Result<Value> {
    let err = |e: sqlx::Error| decode_failure(column, e);
    let value = match data_type {
        DataType::Utf8 => row
            .try_get::<Option<String>, _>(column)
            .map_err(err)?
            .map(Value::Utf8),
        DataType::Int64 => row
            .try_get::<Option<i64>, _>(column)
            .map_err(err)?
            .map(Value::Int64),
        DataType::Float64 => row
            .try_get::<Option<f64>, _>(column)
            .map_err(err)?
            .map(Value::Float64),
        DataType::Boolean => row
            .try_get::<Option<bool>, _>(column)
            .map_err(err)?
            .map(Value::Boolean),
        DataType::Timestamp => match row.try_get::<Option<i64>, _>(column).map_err(err)? {
            Some(micros) => Some(Value::Timestamp(from_micros(micros)?)),
            None => None,
        },
        DataType::Json => match row.try_get::<Option<String>, _>(column).map_err(err)? {
            Some(raw) => Some(Value::Json(
                serde_json::from_str(&raw).map_err(|e| decode_failure(column, e))?,
            )),
            None => None,
        },
        DataType::Uuid => match row.try_get::<Option<String>, _>(column).map_err(err)? {
            Some(raw) => Some(Value::Uuid(
                Uuid::parse_str(&raw).map_err(|e| decode_failure(column, e))?,
            )),
            None => None,
        },
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Decode result rows by column name against `columns`. Extra result
/// columns are ignored.
pub(crate) fn decode_table(rows: &[SqliteRow], columns: Vec<ColumnDef>) -> Result<Table> {
    let decoded = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| decode_value(row, &col.name, col.data_type))
                .collect::<Result<Vec<_>>>()
        })
        .collect::<Result<Vec<_>>>()?;
    Table::new(columns, decoded)
}

/// Quote an identifier for interpolation into SQL text.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_round_trip() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_000).unwrap();
        assert_eq!(from_micros(to_micros(ts)).unwrap(), ts);
    }

    #[test]
    fn affinities() {
        assert_eq!(sql_type(DataType::Timestamp), "INTEGER");
        assert_eq!(sql_type(DataType::Uuid), "TEXT");
        assert_eq!(sql_type(DataType::Float64), "REAL");
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("ts"), "\"ts\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
