// SPDX-License-Identifier: Apache-2.0

//! Source capability declarations.
//!
//! A `Capability` is static, declared by the transport and read by the planner
//! and the pushdown translator. It never changes for the life of a source.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::predicate::CompareOp;

/// Native query language a source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialectKind {
    /// ServiceNow encoded query (`a=1^b>2`).
    ServiceNow,
    /// Jira Query Language.
    Jql,
    /// `k=v&k=v` query-string filters.
    QueryString,
    /// Mongo-style JSON filter document.
    JsonFilter,
    /// DuckDB / ANSI SQL.
    Sql,
}

/// Where the rendered fragment travels in the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FragmentEncoding {
    /// Value of a single query parameter (`sysparm_query`, `jql`).
    QueryParam { name: String },
    /// Raw `k=v&k=v` appended to the query string.
    QueryString,
    /// JSON request body.
    JsonBody,
    /// SQL boolean expression for a WHERE clause.
    SqlWhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PredicateShape {
    Compare(CompareOp),
    In,
    Like,
    IsNull,
}

impl PredicateShape {
    pub const ALL: [PredicateShape; 9] = [
        PredicateShape::Compare(CompareOp::Eq),
        PredicateShape::Compare(CompareOp::NotEq),
        PredicateShape::Compare(CompareOp::Lt),
        PredicateShape::Compare(CompareOp::LtEq),
        PredicateShape::Compare(CompareOp::Gt),
        PredicateShape::Compare(CompareOp::GtEq),
        PredicateShape::In,
        PredicateShape::Like,
        PredicateShape::IsNull,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(AggregateFunc::Count),
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a source can evaluate natively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub dialect: DialectKind,
    pub encoding: FragmentEncoding,
    /// Shapes supported on any column without an override.
    pub shapes: BTreeSet<PredicateShape>,
    /// Per-column overrides, keyed by dotted column path.
    pub column_shapes: BTreeMap<String, BTreeSet<PredicateShape>>,
    pub aggregates: BTreeSet<AggregateFunc>,
    pub order_by: bool,
    pub limit: bool,
    pub offset: bool,
    /// Accepts `column IN (keys)` produced by semi-join reduction.
    pub semi_join: bool,
    /// Can evaluate joins between its own tables.
    pub joins: bool,
    /// Largest IN list the source accepts.
    pub max_in_list: usize,
    /// Records per page requested from the source.
    pub page_size: usize,
}

impl Capability {
    /// A source that can only list records.
    pub fn none(dialect: DialectKind, encoding: FragmentEncoding) -> Self {
        Self {
            dialect,
            encoding,
            shapes: BTreeSet::new(),
            column_shapes: BTreeMap::new(),
            aggregates: BTreeSet::new(),
            order_by: false,
            limit: false,
            offset: false,
            semi_join: false,
            joins: false,
            max_in_list: 0,
            page_size: 100,
        }
    }

    /// Everything supported; what a SQL engine over local data declares.
    pub fn full(dialect: DialectKind, encoding: FragmentEncoding) -> Self {
        Self {
            shapes: PredicateShape::ALL.into_iter().collect(),
            aggregates: [
                AggregateFunc::Count,
                AggregateFunc::Sum,
                AggregateFunc::Avg,
                AggregateFunc::Min,
                AggregateFunc::Max,
            ]
            .into_iter()
            .collect(),
            order_by: true,
            limit: true,
            offset: true,
            semi_join: true,
            joins: true,
            max_in_list: 1000,
            page_size: 1000,
            ..Self::none(dialect, encoding)
        }
    }

    pub fn with_shapes(mut self, shapes: impl IntoIterator<Item = PredicateShape>) -> Self {
        self.shapes = shapes.into_iter().collect();
        self
    }

    pub fn with_column_shapes(
        mut self,
        column: impl Into<String>,
        shapes: impl IntoIterator<Item = PredicateShape>,
    ) -> Self {
        self.column_shapes
            .insert(column.into(), shapes.into_iter().collect());
        self
    }

    pub fn with_aggregates(mut self, aggregates: impl IntoIterator<Item = AggregateFunc>) -> Self {
        self.aggregates = aggregates.into_iter().collect();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_in_list(mut self, max_in_list: usize) -> Self {
        self.max_in_list = max_in_list;
        self
    }

    /// Shapes available on `column` (dotted path).
    pub fn shapes_for(&self, column: &str) -> &BTreeSet<PredicateShape> {
        self.column_shapes.get(column).unwrap_or(&self.shapes)
    }

    pub fn supports(&self, shape: PredicateShape, column: &str) -> bool {
        self.shapes_for(column).contains(&shape)
    }

    /// A column is filterable at all when at least one shape is supported on it.
    pub fn column_pushable(&self, column: &str) -> bool {
        !self.shapes_for(column).is_empty()
    }

    pub fn supports_aggregate(&self, func: AggregateFunc) -> bool {
        self.aggregates.contains(&func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_override_replaces_defaults() {
        let cap = Capability::full(DialectKind::Jql, FragmentEncoding::QueryParam { name: "jql".into() })
            .with_column_shapes("summary", [PredicateShape::Like]);
        assert!(cap.supports(PredicateShape::Like, "summary"));
        assert!(!cap.supports(PredicateShape::Compare(CompareOp::Eq), "summary"));
        assert!(cap.supports(PredicateShape::Compare(CompareOp::Eq), "status"));
    }

    #[test]
    fn none_pushes_nothing() {
        let cap = Capability::none(DialectKind::QueryString, FragmentEncoding::QueryString);
        assert!(!cap.column_pushable("anything"));
        assert!(!cap.supports_aggregate(AggregateFunc::Count));
    }

    #[test]
    fn aggregate_names_round_trip() {
        for func in [AggregateFunc::Count, AggregateFunc::Sum, AggregateFunc::Avg, AggregateFunc::Min, AggregateFunc::Max] {
            assert_eq!(AggregateFunc::from_name(&func.name().to_lowercase()), Some(func));
        }
        assert_eq!(AggregateFunc::from_name("median"), None);
    }
}
