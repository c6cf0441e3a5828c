// SPDX-License-Identifier: Apache-2.0

//! Jira Query Language.
//!
//! JQL's `~` operator is a fuzzy text search rather than a pattern match, so
//! LIKE is never pushed. Dates have minute precision.

use chrono::Timelike;
use waveql_core::capability::DialectKind;
use waveql_core::predicate::{ColumnRef, Literal, Predicate};

use crate::pushdown::NativeDialect;

pub struct JqlDialect;

impl JqlDialect {
    fn child(&self, predicate: &Predicate) -> Option<String> {
        let rendered = self.render(predicate)?;
        Some(match predicate {
            Predicate::And(_) | Predicate::Or(_) => format!("({rendered})"),
            _ => rendered,
        })
    }

    fn list(&self, values: &[Literal]) -> Option<String> {
        if values.is_empty() {
            return None;
        }
        let rendered = values
            .iter()
            .map(|v| self.render_literal(v))
            .collect::<Option<Vec<_>>>()?;
        Some(format!("({})", rendered.join(", ")))
    }
}

impl NativeDialect for JqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Jql
    }

    fn render(&self, predicate: &Predicate) -> Option<String> {
        match predicate {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => Some(format!(
                "{} {} {}",
                field(column),
                op.symbol(),
                self.render_literal(literal)?
            )),
            Predicate::In { column, values } => {
                Some(format!("{} IN {}", field(column), self.list(values)?))
            }
            Predicate::Like { .. } => None,
            Predicate::IsNull(column) => Some(format!("{} IS EMPTY", field(column))),
            Predicate::And(parts) => parts
                .iter()
                .map(|p| self.child(p))
                .collect::<Option<Vec<_>>>()
                .map(|rendered| rendered.join(" AND ")),
            Predicate::Or(parts) => parts
                .iter()
                .map(|p| self.child(p))
                .collect::<Option<Vec<_>>>()
                .map(|rendered| rendered.join(" OR ")),
            Predicate::Not(inner) => match inner.as_ref() {
                Predicate::IsNull(column) => Some(format!("{} IS NOT EMPTY", field(column))),
                Predicate::In { column, values } => {
                    Some(format!("{} NOT IN {}", field(column), self.list(values)?))
                }
                Predicate::Comparison {
                    column,
                    op,
                    literal,
                } => Some(format!(
                    "{} {} {}",
                    field(column),
                    op.negated().symbol(),
                    self.render_literal(literal)?
                )),
                other => Some(format!("NOT ({})", self.render(other)?)),
            },
        }
    }

    fn render_literal(&self, literal: &Literal) -> Option<String> {
        match literal {
            Literal::Null => None,
            Literal::Bool(b) => Some(quote(&b.to_string())),
            Literal::Int(i) => Some(i.to_string()),
            Literal::Float(f) if f.is_finite() => Some(f.to_string()),
            Literal::Float(_) => None,
            Literal::String(s) => Some(quote(s)),
            Literal::Timestamp(ts) if ts.second() == 0 && ts.nanosecond() == 0 => {
                Some(quote(&ts.format("%Y/%m/%d %H:%M").to_string()))
            }
            Literal::Timestamp(_) => None,
        }
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Field names outside `[A-Za-z0-9_.]` (custom fields with spaces) are quoted.
fn field(column: &ColumnRef) -> String {
    let name = column.dotted();
    let simple = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if simple {
        name
    } else {
        quote(&name)
    }
}
