// SPDX-License-Identifier: Apache-2.0

//! DuckDB SQL. Used for `WHERE` clauses against file sources and for the
//! local stage, so it also exposes identifier and literal helpers.

use waveql_core::capability::DialectKind;
use waveql_core::predicate::{ColumnRef, Literal, Predicate};
use waveql_core::types::Value;

use crate::pushdown::NativeDialect;

pub struct SqlDialect;

impl NativeDialect for SqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sql
    }

    fn render(&self, predicate: &Predicate) -> Option<String> {
        match predicate {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => {
                if matches!(literal, Literal::Null) {
                    return None;
                }
                Some(format!(
                    "{} {} {}",
                    render_column(column),
                    op.symbol(),
                    sql_literal(literal)?
                ))
            }
            Predicate::In { column, values } => {
                if values.is_empty() {
                    return None;
                }
                let values = values.iter().map(sql_literal).collect::<Option<Vec<_>>>()?;
                Some(format!("{} IN ({})", render_column(column), values.join(", ")))
            }
            Predicate::Like { column, pattern } => Some(format!(
                "{} LIKE {}",
                render_column(column),
                quote_string(pattern)
            )),
            Predicate::IsNull(column) => Some(format!("{} IS NULL", render_column(column))),
            Predicate::And(parts) => join(self, parts, " AND "),
            Predicate::Or(parts) => join(self, parts, " OR "),
            Predicate::Not(inner) => Some(format!("NOT ({})", self.render(inner)?)),
        }
    }

    fn render_literal(&self, literal: &Literal) -> Option<String> {
        sql_literal(literal)
    }
}

fn join(dialect: &SqlDialect, parts: &[Predicate], separator: &str) -> Option<String> {
    let rendered = parts
        .iter()
        .map(|p| dialect.render(p))
        .collect::<Option<Vec<_>>>()?;
    Some(format!("({})", rendered.join(separator)))
}

/// Double-quoted identifier with embedded quotes doubled.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"alias"."field"."nested"`: every segment quoted, so struct field access
/// and qualified columns render the same way.
pub fn render_column(column: &ColumnRef) -> String {
    column
        .qualifier
        .iter()
        .chain(column.path.iter())
        .map(|segment| quote_ident(segment))
        .collect::<Vec<_>>()
        .join(".")
}

pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// SQL literal text; non-finite floats have no literal form.
pub fn sql_literal(literal: &Literal) -> Option<String> {
    match literal {
        Literal::Null => Some("NULL".to_string()),
        Literal::Bool(true) => Some("TRUE".to_string()),
        Literal::Bool(false) => Some("FALSE".to_string()),
        Literal::Int(i) => Some(i.to_string()),
        Literal::Float(f) if f.is_finite() => Some(format!("{f:?}")),
        Literal::Float(_) => None,
        Literal::String(s) => Some(quote_string(s)),
        Literal::Timestamp(ts) => Some(format!(
            "TIMESTAMP '{}'",
            ts.format("%Y-%m-%d %H:%M:%S%.f")
        )),
    }
}

/// DuckDB literal for a runtime value, used when staging rows into the
/// local engine. Structs render as `{'k': v}` and lists as `[v, ...]`.
pub fn value_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Float(f) if !f.is_finite() => "NULL".to_string(),
        Value::Struct(fields) if fields.is_empty() => "NULL".to_string(),
        Value::Struct(fields) => {
            let entries = fields
                .iter()
                .map(|(name, v)| format!("{}: {}", quote_string(name), value_literal(v)))
                .collect::<Vec<_>>();
            format!("{{{}}}", entries.join(", "))
        }
        Value::List(items) => {
            let items = items.iter().map(value_literal).collect::<Vec<_>>();
            format!("[{}]", items.join(", "))
        }
        other => Literal::from_value(other)
            .and_then(|lit| sql_literal(&lit))
            .unwrap_or_else(|| "NULL".to_string()),
    }
}
