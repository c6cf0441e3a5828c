// SPDX-License-Identifier: Apache-2.0

//! Mongo-style JSON filter documents sent as a request body.

use serde_json::{json, Value as Json};
use waveql_core::capability::DialectKind;
use waveql_core::predicate::{CompareOp, Literal, Predicate};

use crate::pushdown::NativeDialect;

pub struct JsonFilterDialect;

impl JsonFilterDialect {
    /// Filter document for `predicate`.
    pub fn document(&self, predicate: &Predicate) -> Option<Json> {
        match predicate {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => {
                if matches!(literal, Literal::Null) {
                    return None;
                }
                let operator = match op {
                    CompareOp::Eq => "$eq",
                    CompareOp::NotEq => "$ne",
                    CompareOp::Lt => "$lt",
                    CompareOp::LtEq => "$lte",
                    CompareOp::Gt => "$gt",
                    CompareOp::GtEq => "$gte",
                };
                Some(json!({ column.dotted(): { operator: literal_json(literal)? } }))
            }
            Predicate::In { column, values } => {
                let values = values.iter().map(literal_json).collect::<Option<Vec<_>>>()?;
                Some(json!({ column.dotted(): { "$in": values } }))
            }
            Predicate::Like { .. } => None,
            Predicate::IsNull(column) => Some(json!({ column.dotted(): { "$eq": null } })),
            Predicate::And(parts) => Some(json!({ "$and": self.documents(parts)? })),
            Predicate::Or(parts) => Some(json!({ "$or": self.documents(parts)? })),
            Predicate::Not(inner) => Some(json!({ "$nor": [self.document(inner)?] })),
        }
    }

    fn documents(&self, parts: &[Predicate]) -> Option<Vec<Json>> {
        parts.iter().map(|p| self.document(p)).collect()
    }
}

impl NativeDialect for JsonFilterDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::JsonFilter
    }

    fn render(&self, predicate: &Predicate) -> Option<String> {
        self.document(predicate).map(|doc| doc.to_string())
    }

    fn render_literal(&self, literal: &Literal) -> Option<String> {
        literal_json(literal).map(|v| v.to_string())
    }
}

fn literal_json(literal: &Literal) -> Option<Json> {
    match literal {
        Literal::Float(f) if !f.is_finite() => None,
        Literal::Null => None,
        other => Some(other.to_json()),
    }
}
