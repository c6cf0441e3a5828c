// SPDX-License-Identifier: Apache-2.0

//! Compiled statement model.
//!
//! A narrow, federation-oriented view of a SQL statement: only the shapes
//! the planner knows how to split between sources and the local stage.

use std::fmt;

use serde::{Deserialize, Serialize};
use waveql_core::capability::AggregateFunc;
use waveql_core::predicate::{ColumnRef, Literal, Predicate};

/// Table reference as written in the query, quotes stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema qualifier, i.e. the source id. `None` → connection default.
    pub source: Option<String>,
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    /// Name the table is addressed by inside the query.
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{source}.")?;
        }
        write!(f, "{}", self.table)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {alias}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    Wildcard,
    /// `t.*`
    QualifiedWildcard(String),
    Column {
        column: ColumnRef,
        alias: Option<String>,
    },
    Aggregate {
        func: AggregateFunc,
        /// `None` for `COUNT(*)`.
        arg: Option<ColumnRef>,
        alias: Option<String>,
    },
}

impl SelectItem {
    /// Output column name. Wildcards expand to several names and return `None`.
    pub fn output_name(&self) -> Option<String> {
        match self {
            SelectItem::Wildcard | SelectItem::QualifiedWildcard(_) => None,
            SelectItem::Column { column, alias } => Some(
                alias
                    .clone()
                    .unwrap_or_else(|| column.path.last().cloned().unwrap_or_default()),
            ),
            SelectItem::Aggregate { func, arg, alias } => Some(
                alias
                    .clone()
                    .unwrap_or_else(|| aggregate_output_name(*func, arg.as_ref())),
            ),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, SelectItem::Aggregate { .. })
    }
}

/// Deterministic name of an un-aliased aggregate: `count`, `sum_amount`,
/// `avg_user_score`.
pub fn aggregate_output_name(func: AggregateFunc, arg: Option<&ColumnRef>) -> String {
    let func = func.name().to_ascii_lowercase();
    match arg {
        None => func,
        Some(column) => format!("{func}_{}", column.path.join("_")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderExpr {
    /// A column, or an output alias when unqualified and matching one.
    Column(ColumnRef),
    Aggregate {
        func: AggregateFunc,
        arg: Option<ColumnRef>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderKey {
    pub expr: OrderExpr,
    pub descending: bool,
}

/// Inner join with `ON a = b [AND c = d ...]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinClause {
    pub table: TableRef,
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStatement {
    pub projection: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<JoinClause>,
    pub selection: Option<Predicate>,
    pub group_by: Vec<ColumnRef>,
    pub order_by: Vec<OrderKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SelectStatement {
    /// FROM table followed by joined tables.
    pub fn tables(&self) -> impl Iterator<Item = &TableRef> {
        std::iter::once(&self.from).chain(self.joins.iter().map(|j| &j.table))
    }

    pub fn has_aggregates(&self) -> bool {
        !self.group_by.is_empty() || self.projection.iter().any(SelectItem::is_aggregate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStatement {
    pub table: TableRef,
    /// Empty when the statement lists no columns.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Literal>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStatement {
    pub table: TableRef,
    pub assignments: Vec<(String, Literal)>,
    pub selection: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStatement {
    pub table: TableRef,
    pub selection: Option<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Select(_) => "SELECT",
            Statement::Insert(_) => "INSERT",
            Statement::Update(_) => "UPDATE",
            Statement::Delete(_) => "DELETE",
        }
    }
}

/// Result of compiling one SQL text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub statement: Statement,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_names_are_deterministic() {
        assert_eq!(aggregate_output_name(AggregateFunc::Count, None), "count");
        let col = ColumnRef {
            qualifier: Some("t".into()),
            path: vec!["user".into(), "score".into()],
        };
        assert_eq!(aggregate_output_name(AggregateFunc::Avg, Some(&col)), "avg_user_score");
    }

    #[test]
    fn column_output_name_uses_last_path_segment() {
        let item = SelectItem::Column {
            column: ColumnRef {
                qualifier: None,
                path: vec!["user".into(), "name".into()],
            },
            alias: None,
        };
        assert_eq!(item.output_name().as_deref(), Some("name"));
    }
}
