// SPDX-License-Identifier: Apache-2.0

//! Predicate trees extracted from WHERE / ON clauses.
//!
//! The same tree is handed to the pushdown translator (split into a native
//! fragment and a residual) and evaluated locally by in-process sources.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::capability::PredicateShape;
use crate::types::Value;

/// Reference to a (possibly nested) column, optionally qualified by a table
/// name or alias: `t.user.profile.score` → qualifier `t`, path `[user, profile, score]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub path: Vec<String>,
}

impl ColumnRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            qualifier: None,
            path: vec![name.into()],
        }
    }

    pub fn qualified(qualifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            qualifier: Some(qualifier.into()),
            path: vec![name.into()],
        }
    }

    /// Top-level column name.
    pub fn root(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or("")
    }

    /// Column path without the qualifier, dot-joined (`user.profile.score`).
    pub fn dotted(&self) -> String {
        self.path.join(".")
    }

    pub fn is_nested(&self) -> bool {
        self.path.len() > 1
    }

    pub fn unqualified(&self) -> ColumnRef {
        ColumnRef {
            qualifier: None,
            path: self.path.clone(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{q}.{}", self.dotted()),
            None => write!(f, "{}", self.dotted()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }

    /// Operator with its operands swapped (`5 < x` ⇔ `x > 5`).
    pub fn flipped(&self) -> CompareOp {
        match self {
            CompareOp::Lt => CompareOp::Gt,
            CompareOp::LtEq => CompareOp::GtEq,
            CompareOp::Gt => CompareOp::Lt,
            CompareOp::GtEq => CompareOp::LtEq,
            other => *other,
        }
    }

    /// Complementary operator (`NOT (x < 5)` ⇔ `x >= 5`; both are unknown on NULL).
    pub fn negated(&self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::NotEq,
            CompareOp::NotEq => CompareOp::Eq,
            CompareOp::Lt => CompareOp::GtEq,
            CompareOp::LtEq => CompareOp::Gt,
            CompareOp::Gt => CompareOp::LtEq,
            CompareOp::GtEq => CompareOp::Lt,
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::NotEq => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::LtEq => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::GtEq => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::Text(s.clone()),
            Literal::Timestamp(ts) => Value::Timestamp(*ts),
        }
    }

    /// Scalar values convert back into literals (semi-join keys); nested ones do not.
    pub fn from_value(value: &Value) -> Option<Literal> {
        match value {
            Value::Null => Some(Literal::Null),
            Value::Bool(b) => Some(Literal::Bool(*b)),
            Value::Int(i) => Some(Literal::Int(*i)),
            Value::Float(f) => Some(Literal::Float(*f)),
            Value::Text(s) => Some(Literal::String(s.clone())),
            Value::Timestamp(ts) => Some(Literal::Timestamp(*ts)),
            Value::Struct(_) | Value::List(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.to_value().to_json()
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) => write!(f, "{x}"),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::Timestamp(ts) => {
                write!(f, "TIMESTAMP '{}'", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
        }
    }
}

/// Boolean filter expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Comparison {
        column: ColumnRef,
        op: CompareOp,
        literal: Literal,
    },
    In {
        column: ColumnRef,
        values: Vec<Literal>,
    },
    Like {
        column: ColumnRef,
        pattern: String,
    },
    IsNull(ColumnRef),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(column: ColumnRef, op: CompareOp, literal: Literal) -> Self {
        Predicate::Comparison {
            column,
            op,
            literal,
        }
    }

    /// Conjunction that collapses trivial cases: nothing → `None`, one → itself.
    /// Nested `And`s are flattened.
    pub fn conjoin(parts: Vec<Predicate>) -> Option<Predicate> {
        let mut flat = Vec::with_capacity(parts.len());
        for part in parts {
            match part {
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Predicate::And(flat)),
        }
    }

    /// Top-level conjuncts (`a AND (b AND c)` → `[a, b, c]`).
    pub fn conjuncts(&self) -> Vec<&Predicate> {
        match self {
            Predicate::And(parts) => parts.iter().flat_map(|p| p.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Shape of a leaf predicate; `None` for connectives and `NOT` wrappers.
    pub fn shape(&self) -> Option<PredicateShape> {
        match self {
            Predicate::Comparison { op, .. } => Some(PredicateShape::Compare(*op)),
            Predicate::In { .. } => Some(PredicateShape::In),
            Predicate::Like { .. } => Some(PredicateShape::Like),
            Predicate::IsNull(_) => Some(PredicateShape::IsNull),
            _ => None,
        }
    }

    /// Every column referenced, in first-appearance order.
    pub fn columns(&self) -> Vec<&ColumnRef> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnRef>) {
        match self {
            Predicate::Comparison { column, .. }
            | Predicate::In { column, .. }
            | Predicate::Like { column, .. }
            | Predicate::IsNull(column) => {
                if !out.contains(&column) {
                    out.push(column);
                }
            }
            Predicate::And(parts) | Predicate::Or(parts) => {
                parts.iter().for_each(|p| p.collect_columns(out))
            }
            Predicate::Not(inner) => inner.collect_columns(out),
        }
    }

    /// Rewrites every column reference.
    pub fn map_columns(&self, f: &impl Fn(&ColumnRef) -> ColumnRef) -> Predicate {
        match self {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => Predicate::Comparison {
                column: f(column),
                op: *op,
                literal: literal.clone(),
            },
            Predicate::In { column, values } => Predicate::In {
                column: f(column),
                values: values.clone(),
            },
            Predicate::Like { column, pattern } => Predicate::Like {
                column: f(column),
                pattern: pattern.clone(),
            },
            Predicate::IsNull(column) => Predicate::IsNull(f(column)),
            Predicate::And(parts) => Predicate::And(parts.iter().map(|p| p.map_columns(f)).collect()),
            Predicate::Or(parts) => Predicate::Or(parts.iter().map(|p| p.map_columns(f)).collect()),
            Predicate::Not(inner) => Predicate::Not(Box::new(inner.map_columns(f))),
        }
    }

    /// Three-valued evaluation: `Some(true)`, `Some(false)` or `None` (unknown).
    ///
    /// `lookup` resolves a column reference to the row's value; an unresolvable
    /// column behaves like NULL.
    pub fn evaluate<'a, F>(&self, lookup: &F) -> Option<bool>
    where
        F: Fn(&ColumnRef) -> Option<&'a Value>,
    {
        match self {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => {
                let value = lookup(column)?;
                compare_value(value, &literal.to_value()).map(|ord| op.holds(ord))
            }
            Predicate::In { column, values } => {
                let value = lookup(column)?;
                if value.is_null() {
                    return None;
                }
                let mut saw_null = false;
                for candidate in values {
                    match compare_value(value, &candidate.to_value()) {
                        Some(Ordering::Equal) => return Some(true),
                        Some(_) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    None
                } else {
                    Some(false)
                }
            }
            Predicate::Like { column, pattern } => match lookup(column)? {
                Value::Null => None,
                Value::Text(s) => Some(like_matches(pattern, s)),
                other => Some(like_matches(pattern, &other.to_string())),
            },
            Predicate::IsNull(column) => Some(lookup(column).is_none_or(Value::is_null)),
            Predicate::And(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.evaluate(lookup) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(true)
                }
            }
            Predicate::Or(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.evaluate(lookup) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown {
                    None
                } else {
                    Some(false)
                }
            }
            Predicate::Not(inner) => inner.evaluate(lookup).map(|b| !b),
        }
    }

    /// A row passes a WHERE filter only when the predicate is definitely true.
    pub fn matches<'a, F>(&self, lookup: &F) -> bool
    where
        F: Fn(&ColumnRef) -> Option<&'a Value>,
    {
        self.evaluate(lookup) == Some(true)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Comparison {
                column,
                op,
                literal,
            } => write!(f, "{column} {} {literal}", op.symbol()),
            Predicate::In { column, values } => {
                write!(f, "{column} IN (")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Predicate::Like { column, pattern } => {
                write!(f, "{column} LIKE '{}'", pattern.replace('\'', "''"))
            }
            Predicate::IsNull(column) => write!(f, "{column} IS NULL"),
            Predicate::And(parts) => write_joined(f, parts, " AND "),
            Predicate::Or(parts) => write_joined(f, parts, " OR "),
            Predicate::Not(inner) => write!(f, "NOT ({inner})"),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{part}")?;
    }
    write!(f, ")")
}

/// SQL comparison of two scalar values. `None` when either side is NULL or
/// the types are not comparable. Integers and floats compare numerically.
pub fn compare_value(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
        (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Text(b)) => {
            crate::types::parse_timestamp(b).map(|b| a.cmp(&b))
        }
        (Value::Text(a), Value::Timestamp(b)) => {
            crate::types::parse_timestamp(a).map(|a| a.cmp(b))
        }
        _ => None,
    }
}

/// SQL LIKE: `%` matches any run, `_` one character. Case-sensitive.
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push_str("(?s)^");
    let mut buf = [0u8; 4];
    for ch in pattern.chars() {
        match ch {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(other.encode_utf8(&mut buf))),
        }
    }
    regex.push('$');
    Regex::new(&regex).map(|re| re.is_match(text)).unwrap_or(false)
}
