// SPDX-License-Identifier: Apache-2.0

//! DuckDB in-memory engine for the local stage of federated queries.
//!
//! Each query gets a fresh DuckDB connection: fetched inputs are loaded into
//! temporary tables as pages arrive, the rewritten query runs once every
//! input is complete, and dropping the engine frees everything.

use std::sync::Arc;
use std::time::Instant;

use duckdb::Connection;
use tracing::debug;

use waveql_core::error::{EngineError, EngineResult};
use waveql_core::traits::LocalEngine;
use waveql_core::types::{Column, DataType, Row, Schema, Table, Value};
use waveql_drivers::duck;
use waveql_sql::pushdown::dialects::sql::{quote_ident, value_literal};

/// Rows per INSERT statement (and per transaction) when loading inputs.
const INSERT_BATCH_SIZE: usize = 1000;

/// Wraps an in-memory DuckDB connection for a single federated query.
pub struct DuckDbEngine {
    conn: Connection,
}

impl DuckDbEngine {
    pub fn new() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::internal(format!("Failed to open DuckDB: {e}")))?;
        Ok(Self { conn })
    }
}

impl LocalEngine for DuckDbEngine {
    fn load_table(&mut self, name: &str, schema: &Schema) -> EngineResult<()> {
        if schema.columns.is_empty() {
            return Err(EngineError::query_error(format!(
                "Cannot create temp table '{name}': no columns"
            )));
        }

        let col_defs: Vec<String> = schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), map_type_to_duckdb(&c.data_type)))
            .collect();

        let sql = format!("CREATE TEMP TABLE {} ({})", quote_ident(name), col_defs.join(", "));
        self.conn
            .execute_batch(&sql)
            .map_err(|e| EngineError::query_error(format!("Failed to create temp table '{name}': {e}")))
    }

    fn append_rows(&mut self, name: &str, schema: &Schema, rows: &[Row]) -> EngineResult<()> {
        if rows.is_empty() || schema.columns.is_empty() {
            return Ok(());
        }

        for chunk in rows.chunks(INSERT_BATCH_SIZE) {
            let values = chunk
                .iter()
                .map(|row| {
                    let cells = (0..schema.len())
                        .map(|i| row.values.get(i).map(value_literal).unwrap_or_else(|| "NULL".into()))
                        .collect::<Vec<_>>();
                    format!("({})", cells.join(", "))
                })
                .collect::<Vec<_>>();
            let sql = format!("INSERT INTO {} VALUES {}", quote_ident(name), values.join(", "));

            let tx = self
                .conn
                .unchecked_transaction()
                .map_err(|e| EngineError::query_error(format!("DuckDB transaction failed: {e}")))?;
            tx.execute_batch(&sql)
                .map_err(|e| EngineError::query_error(format!("DuckDB insert into '{name}' failed: {e}")))?;
            tx.commit()
                .map_err(|e| EngineError::query_error(format!("DuckDB commit failed: {e}")))?;
        }

        Ok(())
    }

    fn widen_table(&mut self, name: &str, from: &Schema, to: &Schema) -> EngineResult<()> {
        for column in &to.columns {
            let unchanged = from
                .column(&column.name)
                .is_some_and(|old| old.data_type == column.data_type);
            if unchanged {
                continue;
            }
            let ty = map_type_to_duckdb(&column.data_type);
            let sql = format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
                quote_ident(name),
                quote_ident(&column.name),
                ty
            );
            self.conn.execute_batch(&sql).map_err(|e| {
                EngineError::query_error(format!("Failed to retype '{name}.{}' as {ty}: {e}", column.name))
            })?;
            debug!(table = name, column = %column.name, data_type = %ty, "temp column widened");
        }
        Ok(())
    }

    fn run(&mut self, sql: &str) -> EngineResult<Table> {
        let start = Instant::now();
        let (names, rows) = duck::query(&self.conn, sql)
            .map_err(|e| EngineError::query_error(format!("Local stage failed: {e}")))?;

        // Output types come from the data: the first non-null value per column.
        let columns = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let data_type = rows
                    .iter()
                    .filter_map(|row| row.values.get(i))
                    .find(|v| !v.is_null())
                    .map(Value::data_type)
                    .unwrap_or(DataType::Null);
                Column::new(name.as_str(), data_type, true)
            })
            .collect();

        debug!(
            rows = rows.len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "local stage finished"
        );
        Ok(Table::new(Arc::new(Schema::new(columns)), rows))
    }
}

/// DuckDB column type for a WaveQL type. Columns whose type is still unknown
/// (only nulls observed) are VARCHAR.
pub fn map_type_to_duckdb(data_type: &DataType) -> String {
    match data_type {
        DataType::Null | DataType::String => "VARCHAR".to_string(),
        DataType::Boolean => "BOOLEAN".to_string(),
        DataType::Integer => "BIGINT".to_string(),
        DataType::Float => "DOUBLE".to_string(),
        DataType::Timestamp => "TIMESTAMP".to_string(),
        DataType::Struct(fields) if fields.is_empty() => "VARCHAR".to_string(),
        DataType::Struct(fields) => {
            let members = fields
                .iter()
                .map(|f| format!("{} {}", quote_ident(&f.name), map_type_to_duckdb(&f.data_type)))
                .collect::<Vec<_>>();
            format!("STRUCT({})", members.join(", "))
        }
        DataType::List(inner) => format!("{}[]", map_type_to_duckdb(inner)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> Schema {
        Schema::new(vec![
            Column::new("id", DataType::Integer, false),
            Column::new("name", DataType::String, true),
            Column::new(
                "profile",
                DataType::Struct(vec![Column::new("score", DataType::Float, true)]),
                true,
            ),
        ])
    }

    fn user(id: i64, name: &str, score: f64) -> Row {
        Row::new(vec![
            Value::Int(id),
            Value::Text(name.into()),
            Value::Struct(vec![("score".into(), Value::Float(score))]),
        ])
    }

    #[test]
    fn type_mapping() {
        assert_eq!(map_type_to_duckdb(&DataType::Integer), "BIGINT");
        assert_eq!(map_type_to_duckdb(&DataType::List(Box::new(DataType::Float))), "DOUBLE[]");
        assert_eq!(
            map_type_to_duckdb(&users_schema().columns[2].data_type),
            "STRUCT(\"score\" DOUBLE)"
        );
        assert_eq!(map_type_to_duckdb(&DataType::Struct(Vec::new())), "VARCHAR");
    }

    #[test]
    fn load_append_and_run() {
        let mut engine = DuckDbEngine::new().unwrap();
        let schema = users_schema();
        engine.load_table("__fed_users_0", &schema).unwrap();
        engine
            .append_rows(
                "__fed_users_0",
                &schema,
                &[user(1, "ann", 4.5), user(2, "o'neil", 3.0), user(3, "cy", 5.0)],
            )
            .unwrap();

        let table = engine
            .run(
                "SELECT \"u\".\"name\" AS \"name\", \"u\".\"profile\".\"score\" AS \"score\" \
                 FROM \"__fed_users_0\" AS \"u\" WHERE \"u\".\"profile\".\"score\" > 4 ORDER BY \"u\".\"id\"",
            )
            .unwrap();
        assert_eq!(table.schema.column_names(), vec!["name", "score"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[0].values[0], Value::Text("ann".into()));
        assert_eq!(table.schema.columns[1].data_type, DataType::Float);
    }

    #[test]
    fn empty_inputs_still_query() {
        let mut engine = DuckDbEngine::new().unwrap();
        let schema = users_schema();
        engine.load_table("__fed_users_0", &schema).unwrap();
        engine.append_rows("__fed_users_0", &schema, &[]).unwrap();
        let table = engine.run("SELECT COUNT(*) AS \"count\" FROM \"__fed_users_0\"").unwrap();
        assert_eq!(table.rows[0].values[0], Value::Int(0));
    }

    #[test]
    fn widened_columns_keep_earlier_rows() {
        let mut engine = DuckDbEngine::new().unwrap();
        let narrow = Schema::new(vec![Column::new("score", DataType::Integer, false)]);
        let wide = Schema::new(vec![Column::new("score", DataType::Float, false)]);
        engine.load_table("__fed_t_0", &narrow).unwrap();
        engine
            .append_rows("__fed_t_0", &narrow, &[Row::new(vec![Value::Int(1)])])
            .unwrap();
        engine.widen_table("__fed_t_0", &narrow, &wide).unwrap();
        engine
            .append_rows("__fed_t_0", &wide, &[Row::new(vec![Value::Float(2.5)])])
            .unwrap();

        let table = engine.run("SELECT SUM(\"score\") AS \"total\" FROM \"__fed_t_0\"").unwrap();
        assert_eq!(table.rows[0].values[0], Value::Float(3.5));
    }

    #[test]
    fn failures_are_query_errors() {
        let mut engine = DuckDbEngine::new().unwrap();
        let err = engine.run("SELECT * FROM missing").unwrap_err();
        assert!(matches!(err, EngineError::QueryError { .. }));
        let err = engine.load_table("t", &Schema::new(Vec::new())).unwrap_err();
        assert!(matches!(err, EngineError::QueryError { .. }));
    }
}
