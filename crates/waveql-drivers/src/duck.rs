// SPDX-License-Identifier: Apache-2.0

//! DuckDB result conversion, shared by the file transport and the local
//! stage engine.

use chrono::DateTime;
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::Connection;
use waveql_core::types::{Row, Value};

/// Converts a DuckDB value into a WaveQL value. Types without a direct
/// counterpart (intervals, blobs, times) are carried as text.
pub fn to_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::SmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::Int(i) => Value::Int(i64::from(i)),
        DuckValue::BigInt(i) => Value::Int(i),
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::UTinyInt(i) => Value::Int(i64::from(i)),
        DuckValue::USmallInt(i) => Value::Int(i64::from(i)),
        DuckValue::UInt(i) => Value::Int(i64::from(i)),
        DuckValue::UBigInt(i) => i64::try_from(i)
            .map(Value::Int)
            .unwrap_or(Value::Float(i as f64)),
        DuckValue::Float(f) => Value::Float(f64::from(f)),
        DuckValue::Double(f) => Value::Float(f),
        DuckValue::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        DuckValue::Timestamp(unit, raw) => {
            let micros = match unit {
                TimeUnit::Second => raw.saturating_mul(1_000_000),
                TimeUnit::Millisecond => raw.saturating_mul(1_000),
                TimeUnit::Microsecond => raw,
                TimeUnit::Nanosecond => raw / 1_000,
            };
            DateTime::from_timestamp_micros(micros)
                .map(Value::Timestamp)
                .unwrap_or(Value::Null)
        }
        DuckValue::Date32(days) => DateTime::from_timestamp(i64::from(days) * 86_400, 0)
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        DuckValue::Text(s) | DuckValue::Enum(s) => Value::Text(s),
        DuckValue::Blob(bytes) => Value::Text(String::from_utf8_lossy(&bytes).into_owned()),
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::List(items.into_iter().map(to_value).collect())
        }
        DuckValue::Struct(fields) => Value::Struct(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), to_value(v.clone())))
                .collect(),
        ),
        DuckValue::Union(inner) => to_value(*inner),
        other => Value::Text(format!("{other:?}")),
    }
}

/// Runs a query and returns its column names and rows.
///
/// Column metadata is only available once the statement has executed, so
/// names are read after the rows.
pub fn query(conn: &Connection, sql: &str) -> duckdb::Result<(Vec<String>, Vec<Row>)> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = Vec::new();
    {
        let mut cursor = stmt.query([])?;
        while let Some(row) = cursor.next()? {
            let count = row.as_ref().column_count();
            let mut values = Vec::with_capacity(count);
            for i in 0..count {
                values.push(to_value(row.get::<_, DuckValue>(i)?));
            }
            rows.push(Row::new(values));
        }
    }
    let names = (0..stmt.column_count())
        .map(|i| {
            stmt.column_name(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|_| format!("col_{i}"))
        })
        .collect();
    Ok((names, rows))
}

/// Rows as JSON objects keyed by column name.
pub fn to_records(names: &[String], rows: Vec<Row>) -> Vec<serde_json::Value> {
    rows.into_iter()
        .map(|row| {
            serde_json::Value::Object(
                names
                    .iter()
                    .cloned()
                    .zip(row.values.iter().map(Value::to_json))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_conversions() {
        assert_eq!(to_value(DuckValue::HugeInt(42)), Value::Int(42));
        assert_eq!(to_value(DuckValue::Double(1.5)), Value::Float(1.5));
        assert_eq!(to_value(DuckValue::Text("x".into())), Value::Text("x".into()));
        match to_value(DuckValue::Timestamp(TimeUnit::Second, 86_400)) {
            Value::Timestamp(ts) => assert_eq!(ts.to_rfc3339(), "1970-01-02T00:00:00+00:00"),
            other => panic!("expected timestamp, got {other:?}"),
        }
    }

    #[test]
    fn query_reads_names_and_nested_values() {
        let conn = Connection::open_in_memory().unwrap();
        let (names, rows) = query(
            &conn,
            "SELECT 1 AS id, {'city': 'Oslo'} AS address, [1, 2] AS tags, NULL AS gone",
        )
        .unwrap();
        assert_eq!(names, vec!["id", "address", "tags", "gone"]);
        assert_eq!(rows[0].values[0], Value::Int(1));
        assert_eq!(
            rows[0].values[1],
            Value::Struct(vec![("city".into(), Value::Text("Oslo".into()))])
        );
        assert_eq!(rows[0].values[2], Value::List(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(rows[0].values[3], Value::Null);

        let records = to_records(&names, rows);
        assert_eq!(records[0]["address"]["city"], "Oslo");
    }
}
