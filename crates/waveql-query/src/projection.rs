// SPDX-License-Identifier: Apache-2.0

//! Pass-through projection.
//!
//! When a single fetch already yields the final rows (nothing left to join,
//! group or re-order), the local engine is skipped and fetched rows are
//! projected in process.

use serde::Serialize;
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::types::{Column, DataType, Row, Schema, Value};
use waveql_sql::ast::{aggregate_output_name, SelectItem};

use crate::local::{LocalBinding, LocalQueryBuilder};

/// One output column read straight from a fetched row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputColumn {
    pub name: String,
    /// Top-level column of the fetched row.
    pub index: usize,
    /// Struct path below that column.
    pub nested: Vec<String>,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectProjection {
    pub columns: Vec<OutputColumn>,
}

impl DirectProjection {
    /// Resolves the builder's projection against the schema of the rows the
    /// fetch produces.
    pub fn resolve(builder: &LocalQueryBuilder<'_>, row_schema: &Schema) -> EngineResult<Self> {
        let mut columns = Vec::new();
        for item in &builder.statement().projection {
            match item {
                SelectItem::Wildcard => {
                    for (_, binding) in builder.bindings() {
                        expand(binding, row_schema, &mut columns)?;
                    }
                }
                SelectItem::QualifiedWildcard(qualifier) => {
                    let (_, binding) = builder.binding(Some(qualifier.as_str()))?;
                    expand(binding, row_schema, &mut columns)?;
                }
                SelectItem::Column { column, .. } => {
                    let path = if builder.is_pre_aggregated() {
                        vec![column.dotted()]
                    } else {
                        let (_, binding) = builder.binding(column.qualifier.as_deref())?;
                        binding
                            .prefix
                            .iter()
                            .cloned()
                            .chain(column.path.iter().cloned())
                            .collect()
                    };
                    columns.push(locate(item.output_name().unwrap_or_default(), path, row_schema)?);
                }
                SelectItem::Aggregate { func, arg, .. } => {
                    if !builder.is_pre_aggregated() {
                        return Err(EngineError::internal(
                            "aggregate projected without a local stage",
                        ));
                    }
                    let path = vec![aggregate_output_name(*func, arg.as_ref())];
                    columns.push(locate(item.output_name().unwrap_or_default(), path, row_schema)?);
                }
            }
        }
        Ok(Self { columns })
    }

    /// Output schema; every projected column is nullable.
    pub fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|c| Column::new(c.name.as_str(), c.data_type.clone(), true))
                .collect(),
        )
    }

    /// Re-reads output types after the fetched row schema was widened.
    /// Column positions do not move.
    pub fn retype(&mut self, row_schema: &Schema) {
        for column in &mut self.columns {
            let Some(root) = row_schema.columns.get(column.index) else {
                continue;
            };
            let path: Vec<String> = std::iter::once(root.name.to_string())
                .chain(column.nested.iter().cloned())
                .collect();
            if let Some(data_type) = row_schema.resolve_path(&path) {
                column.data_type = data_type.clone();
            }
        }
    }

    pub fn apply(&self, row: &Row) -> Row {
        Row::new(
            self.columns
                .iter()
                .map(|c| {
                    row.values
                        .get(c.index)
                        .and_then(|v| v.get_path(&c.nested))
                        .cloned()
                        .unwrap_or(Value::Null)
                })
                .collect(),
        )
    }
}

fn expand(binding: &LocalBinding, row_schema: &Schema, out: &mut Vec<OutputColumn>) -> EngineResult<()> {
    for column in &binding.schema.columns {
        let path = binding
            .prefix
            .iter()
            .cloned()
            .chain(std::iter::once(column.name.to_string()))
            .collect();
        out.push(locate(column.name.to_string(), path, row_schema)?);
    }
    Ok(())
}

fn locate(name: String, path: Vec<String>, row_schema: &Schema) -> EngineResult<OutputColumn> {
    let unknown = || EngineError::query_error(format!("unknown column '{}'", path.join(".")));
    let index = path
        .first()
        .and_then(|root| row_schema.index_of(root))
        .ok_or_else(unknown)?;
    let data_type = row_schema.resolve_path(&path).cloned().ok_or_else(unknown)?;
    Ok(OutputColumn {
        name,
        index,
        nested: path[1..].to_vec(),
        data_type,
    })
}
