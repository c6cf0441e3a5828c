// SPDX-License-Identifier: Apache-2.0

//! Plain `k=v&k=v` query-string filters for generic REST endpoints.
//! Only equality and IN (`k=v1,v2`) conjunctions are expressible.

use chrono::SecondsFormat;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use waveql_core::capability::DialectKind;
use waveql_core::predicate::{CompareOp, Literal, Predicate};

use crate::pushdown::NativeDialect;

/// Unreserved characters (RFC 3986) stay as they are.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub struct QueryStringDialect;

impl QueryStringDialect {
    fn pair(&self, predicate: &Predicate) -> Option<String> {
        match predicate {
            Predicate::Comparison {
                column,
                op: CompareOp::Eq,
                literal,
            } => Some(format!(
                "{}={}",
                encode(&column.dotted()),
                self.render_literal(literal)?
            )),
            Predicate::In { column, values } if !values.is_empty() => {
                let values = values
                    .iter()
                    .map(|v| self.render_literal(v))
                    .collect::<Option<Vec<_>>>()?;
                Some(format!("{}={}", encode(&column.dotted()), values.join(",")))
            }
            _ => None,
        }
    }
}

impl NativeDialect for QueryStringDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::QueryString
    }

    fn render(&self, predicate: &Predicate) -> Option<String> {
        predicate
            .conjuncts()
            .into_iter()
            .map(|p| self.pair(p))
            .collect::<Option<Vec<_>>>()
            .map(|pairs| pairs.join("&"))
    }

    /// Percent-encoded value; commas inside values are encoded so IN lists
    /// stay unambiguous.
    fn render_literal(&self, literal: &Literal) -> Option<String> {
        let raw = match literal {
            Literal::Null => return None,
            Literal::Bool(b) => b.to_string(),
            Literal::Int(i) => i.to_string(),
            Literal::Float(f) if f.is_finite() => f.to_string(),
            Literal::Float(_) => return None,
            Literal::String(s) => s.clone(),
            Literal::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        Some(encode(&raw))
    }
}

fn encode(text: &str) -> String {
    utf8_percent_encode(text, COMPONENT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveql_core::predicate::ColumnRef;

    #[test]
    fn equality_and_in_pairs() {
        let p = Predicate::And(vec![
            Predicate::compare(ColumnRef::new("status"), CompareOp::Eq, Literal::String("on hold".into())),
            Predicate::In {
                column: ColumnRef::new("team"),
                values: vec![Literal::String("a,b".into()), Literal::String("c".into())],
            },
        ]);
        assert_eq!(
            QueryStringDialect.render(&p).unwrap(),
            "status=on%20hold&team=a%2Cb,c"
        );
    }

    #[test]
    fn ranges_and_disjunctions_are_not_expressible() {
        let range = Predicate::compare(ColumnRef::new("n"), CompareOp::Gt, Literal::Int(1));
        assert_eq!(QueryStringDialect.render(&range), None);
        let or = Predicate::Or(vec![
            Predicate::compare(ColumnRef::new("a"), CompareOp::Eq, Literal::Int(1)),
            Predicate::compare(ColumnRef::new("b"), CompareOp::Eq, Literal::Int(1)),
        ]);
        assert_eq!(QueryStringDialect.render(&or), None);
    }
}
