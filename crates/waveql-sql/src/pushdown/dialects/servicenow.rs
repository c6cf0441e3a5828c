// SPDX-License-Identifier: Apache-2.0

//! ServiceNow encoded queries (`sysparm_query`).
//!
//! Conditions are joined with `^`; `^OR` binds tighter than `^`, so a
//! conjunction of leaf disjunctions is expressible but an AND nested inside
//! an OR is not.

use waveql_core::capability::DialectKind;
use waveql_core::predicate::{ColumnRef, Literal, Predicate};

use super::{like_shape, LikeShape};
use crate::pushdown::NativeDialect;

pub struct ServiceNowDialect;

impl ServiceNowDialect {
    fn term(&self, predicate: &Predicate) -> Option<String> {
        match predicate {
            Predicate::Or(parts) => parts
                .iter()
                .map(|p| self.leaf(p))
                .collect::<Option<Vec<_>>>()
                .map(|rendered| rendered.join("^OR")),
            other => self.leaf(other),
        }
    }

    fn leaf(&self, predicate: &Predicate) -> Option<String> {
        match predicate {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => Some(format!(
                "{}{}{}",
                field(column),
                op.symbol(),
                self.render_literal(literal)?
            )),
            Predicate::In { column, values } => {
                Some(format!("{}IN{}", field(column), self.list(values)?))
            }
            Predicate::Like { column, pattern } => {
                let value = |text: &str| escape(text);
                Some(match like_shape(pattern)? {
                    LikeShape::Exact(text) => format!("{}={}", field(column), value(text)),
                    LikeShape::Contains(text) => format!("{}LIKE{}", field(column), value(text)),
                    LikeShape::StartsWith(text) => format!("{}STARTSWITH{}", field(column), value(text)),
                    LikeShape::EndsWith(text) => format!("{}ENDSWITH{}", field(column), value(text)),
                })
            }
            Predicate::IsNull(column) => Some(format!("{}ISEMPTY", field(column))),
            Predicate::Not(inner) => match inner.as_ref() {
                Predicate::Comparison {
                    column,
                    op,
                    literal,
                } => Some(format!(
                    "{}{}{}",
                    field(column),
                    op.negated().symbol(),
                    self.render_literal(literal)?
                )),
                Predicate::In { column, values } => {
                    Some(format!("{}NOT IN{}", field(column), self.list(values)?))
                }
                Predicate::Like { column, pattern } => match like_shape(pattern)? {
                    LikeShape::Contains(text) => {
                        Some(format!("{}NOT LIKE{}", field(column), escape(text)))
                    }
                    LikeShape::Exact(text) => Some(format!("{}!={}", field(column), escape(text))),
                    _ => None,
                },
                Predicate::IsNull(column) => Some(format!("{}ISNOTEMPTY", field(column))),
                _ => None,
            },
            _ => None,
        }
    }

    /// Comma-separated IN list; values containing commas cannot be expressed.
    fn list(&self, values: &[Literal]) -> Option<String> {
        if values.is_empty() {
            return None;
        }
        let rendered = values
            .iter()
            .map(|v| self.render_literal(v))
            .collect::<Option<Vec<_>>>()?;
        if rendered.iter().any(|v| v.contains(',')) {
            return None;
        }
        Some(rendered.join(","))
    }
}

impl NativeDialect for ServiceNowDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::ServiceNow
    }

    fn render(&self, predicate: &Predicate) -> Option<String> {
        match predicate {
            Predicate::And(_) => predicate
                .conjuncts()
                .into_iter()
                .map(|p| self.term(p))
                .collect::<Option<Vec<_>>>()
                .map(|rendered| rendered.join("^")),
            other => self.term(other),
        }
    }

    fn render_literal(&self, literal: &Literal) -> Option<String> {
        match literal {
            Literal::Null => None,
            Literal::Bool(b) => Some(b.to_string()),
            Literal::Int(i) => Some(i.to_string()),
            Literal::Float(f) if f.is_finite() => Some(f.to_string()),
            Literal::Float(_) => None,
            Literal::String(s) => Some(escape(s)),
            Literal::Timestamp(ts) => Some(format!(
                "javascript:gs.dateGenerate('{}','{}')",
                ts.format("%Y-%m-%d"),
                ts.format("%H:%M:%S")
            )),
        }
    }
}

/// Dotted paths are native dot-walking (`caller_id.name`).
fn field(column: &ColumnRef) -> String {
    column.dotted()
}

fn escape(value: &str) -> String {
    value.replace('^', "^^")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use waveql_core::predicate::CompareOp;

    fn cmp(col: &str, op: CompareOp, lit: Literal) -> Predicate {
        Predicate::compare(ColumnRef::new(col), op, lit)
    }

    #[test]
    fn conjunction_of_leaves() {
        let p = Predicate::And(vec![
            cmp("active", CompareOp::Eq, Literal::Bool(true)),
            cmp("priority", CompareOp::LtEq, Literal::Int(2)),
            Predicate::In {
                column: ColumnRef::new("state"),
                values: vec![Literal::Int(1), Literal::Int(2)],
            },
        ]);
        assert_eq!(
            ServiceNowDialect.render(&p).unwrap(),
            "active=true^priority<=2^stateIN1,2"
        );
    }

    #[test]
    fn or_of_leaves_and_and_inside_or() {
        let or = Predicate::Or(vec![
            cmp("priority", CompareOp::Eq, Literal::Int(1)),
            cmp("priority", CompareOp::Eq, Literal::Int(2)),
        ]);
        assert_eq!(ServiceNowDialect.render(&or).unwrap(), "priority=1^ORpriority=2");

        let nested = Predicate::Or(vec![
            Predicate::And(vec![
                cmp("a", CompareOp::Eq, Literal::Int(1)),
                cmp("b", CompareOp::Eq, Literal::Int(2)),
            ]),
            cmp("c", CompareOp::Eq, Literal::Int(3)),
        ]);
        assert_eq!(ServiceNowDialect.render(&nested), None);
    }

    #[test]
    fn like_variants_and_escaping() {
        let like = |pattern: &str| Predicate::Like {
            column: ColumnRef::new("short_description"),
            pattern: pattern.into(),
        };
        assert_eq!(ServiceNowDialect.render(&like("%net^work%")).unwrap(), "short_descriptionLIKEnet^^work");
        assert_eq!(ServiceNowDialect.render(&like("net%")).unwrap(), "short_descriptionSTARTSWITHnet");
        assert_eq!(ServiceNowDialect.render(&like("%net")).unwrap(), "short_descriptionENDSWITHnet");
        assert_eq!(ServiceNowDialect.render(&like("n_t")), None);
    }

    #[test]
    fn null_checks_and_negations() {
        let col = ColumnRef::new("resolved_at");
        assert_eq!(ServiceNowDialect.render(&Predicate::IsNull(col.clone())).unwrap(), "resolved_atISEMPTY");
        assert_eq!(
            ServiceNowDialect
                .render(&Predicate::Not(Box::new(cmp("priority", CompareOp::Lt, Literal::Int(3)))))
                .unwrap(),
            "priority>=3"
        );
        assert_eq!(ServiceNowDialect.render(&cmp("x", CompareOp::Eq, Literal::Null)), None);
    }

    #[test]
    fn dates_use_date_generate() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 10, 30, 0).unwrap();
        assert_eq!(
            ServiceNowDialect.render(&cmp("opened_at", CompareOp::Gt, Literal::Timestamp(ts))).unwrap(),
            "opened_at>javascript:gs.dateGenerate('2024-01-05','10:30:00')"
        );
    }

    #[test]
    fn dot_walked_fields() {
        let p = Predicate::compare(
            ColumnRef {
                qualifier: None,
                path: vec!["caller_id".into(), "name".into()],
            },
            CompareOp::Eq,
            Literal::String("Bob".into()),
        );
        assert_eq!(ServiceNowDialect.render(&p).unwrap(), "caller_id.name=Bob");
    }
}
