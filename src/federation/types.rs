// SPDX-License-Identifier: Apache-2.0

//! Plans and execution reports of federated queries.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use waveql_core::capability::Capability;
use waveql_core::predicate::{ColumnRef, Predicate};
use waveql_core::traits::{FetchRequest, WriteOperation, WriteRequest};
use waveql_core::types::{DataType, QueryId, Row, Schema, TableKey, Value};
use waveql_core::EngineError;
use waveql_query::DirectProjection;

/// Executable form of a compiled statement.
#[derive(Debug, Clone)]
pub enum Plan {
    Select(Arc<SelectPlan>),
    Write(WritePlan),
}

impl Plan {
    pub fn is_write(&self) -> bool {
        matches!(self, Plan::Write(_))
    }
}

#[derive(Debug, Clone)]
pub struct SelectPlan {
    pub sql: String,
    pub steps: Vec<SourceFetchStep>,
    pub finish: Finish,
}

impl SelectPlan {
    pub fn step(&self, index: usize) -> Option<&SourceFetchStep> {
        self.steps.get(index)
    }

    /// Steps whose keys restrict `driver`'s dependents.
    pub fn dependents(&self, driver: usize) -> impl Iterator<Item = &SourceFetchStep> {
        self.steps
            .iter()
            .filter(move |s| s.semi_join.as_ref().map(|j| j.driver_step) == Some(driver))
    }
}

/// How fetched rows become result rows.
#[derive(Debug, Clone)]
pub enum Finish {
    /// A single fetch yields the final rows; they are projected in process
    /// and streamed as they arrive.
    PassThrough(DirectProjection),
    /// Inputs are loaded into the local engine and `sql` runs once they are
    /// complete.
    Local(LocalStage),
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalStage {
    pub sql: String,
    pub columns: Vec<String>,
    /// Conjuncts spanning several steps, rendered into `sql`.
    pub cross_filter: Option<Predicate>,
    pub pre_aggregated: bool,
}

/// One logical fetch (all pages) against one source.
#[derive(Debug, Clone)]
pub struct SourceFetchStep {
    pub index: usize,
    pub source_id: String,
    pub table: String,
    /// Query bindings served by this step; several when the source evaluates
    /// a join itself.
    pub bindings: Vec<String>,
    /// Schema of the rows this step produces. For a joined step, one struct
    /// column per binding; for a pushed aggregate, group columns and
    /// aggregate outputs.
    pub schema: Arc<Schema>,
    pub capability: Capability,
    pub request: FetchRequest,
    /// Filter the source evaluates.
    pub pushed: Option<Predicate>,
    /// Filter evaluated in process on every fetched row.
    pub residual: Option<Predicate>,
    pub semi_join: Option<SemiJoin>,
    /// Temp table holding this step's rows in the local engine.
    pub local_table: String,
    /// Registry entry checked against the first page, for plain table scans.
    pub observe: Option<TableKey>,
    pub row_limit: Option<u64>,
}

impl SourceFetchStep {
    pub fn is_joined(&self) -> bool {
        self.bindings.len() > 1
    }

    /// Value of `column` in a row this step produced. Step predicates are
    /// unqualified for single-table steps and alias-qualified for joined ones.
    pub fn value_of<'a>(&self, row: &'a Row, column: &ColumnRef) -> Option<&'a Value> {
        column_value(&self.schema, self.is_joined(), row, column)
    }
}

pub(crate) fn column_value<'a>(
    schema: &Schema,
    joined: bool,
    row: &'a Row,
    column: &ColumnRef,
) -> Option<&'a Value> {
    let path: Vec<String> = match (&column.qualifier, joined) {
        (Some(q), true) => std::iter::once(q.clone()).chain(column.path.iter().cloned()).collect(),
        _ => column.path.clone(),
    };
    let (root, rest) = path.split_first()?;
    let index = schema.index_of(root)?;
    row.values.get(index)?.get_path(rest)
}

/// Restriction of a step's fetch by the join keys another step produced.
#[derive(Debug, Clone, Serialize)]
pub struct SemiJoin {
    pub driver_step: usize,
    /// Key column in the driver step's rows.
    pub driver_column: ColumnRef,
    /// Column of this step matched against the keys.
    pub target_column: ColumnRef,
    pub target_type: DataType,
    /// The step's own filter, before the key list is added.
    pub base_filter: Option<Predicate>,
}

#[derive(Debug, Clone)]
pub struct WritePlan {
    pub source_id: String,
    pub request: WriteRequest,
}

/// Events sent from the coordinator to a [`crate::ResultSet`].
#[derive(Debug)]
pub enum StreamEvent {
    Columns(Arc<Schema>),
    Row(Row),
    Done(Box<ExecutionSummary>),
    Error(EngineError),
}

/// Result metadata of one fetch step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepSummary {
    pub step: usize,
    pub source_id: String,
    pub table: String,
    pub pages: u64,
    pub row_count: u64,
    pub fetch_time_ms: f64,
    /// No fetch was issued: the semi-join driver produced no keys.
    pub skipped: bool,
    pub row_limit_hit: bool,
}

/// Per-query report: fetch statistics, local-stage time and warnings.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub query_id: QueryId,
    pub steps: Vec<StepSummary>,
    pub local_time_ms: f64,
    pub total_time_ms: f64,
    /// Warnings (row limit hits, semi-join fallbacks)
    pub warnings: Vec<String>,
}

impl ExecutionSummary {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            steps: Vec::new(),
            local_time_ms: 0.0,
            total_time_ms: 0.0,
            warnings: Vec::new(),
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Select(plan) => plan.fmt(f),
            Plan::Write(plan) => plan.fmt(f),
        }
    }
}

impl fmt::Display for SelectPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Select")?;
        for step in &self.steps {
            write!(f, "  fetch[{}] {}.{}", step.index, step.source_id, step.table)?;
            if step.bindings.len() > 1 || step.bindings.first() != Some(&step.table) {
                write!(f, " AS {}", step.bindings.join(" + "))?;
            }
            writeln!(f)?;
            if let Some(fragment) = &step.request.fragment {
                writeln!(f, "    native: {}", fragment.text)?;
            }
            if let Some(residual) = &step.residual {
                writeln!(f, "    residual: {residual}")?;
            }
            if let Some(aggregate) = &step.request.aggregate {
                let calls = aggregate
                    .aggregates
                    .iter()
                    .map(|a| format!("{}({}) AS {}", a.func.name(), a.column.as_deref().unwrap_or("*"), a.output))
                    .collect::<Vec<_>>();
                write!(f, "    aggregate: {}", calls.join(", "))?;
                if !aggregate.group_by.is_empty() {
                    write!(f, " GROUP BY {}", aggregate.group_by.join(", "))?;
                }
                writeln!(f)?;
            }
            for join in &step.request.joins {
                let on = join
                    .on
                    .iter()
                    .map(|(l, r)| format!("{l} = {r}"))
                    .collect::<Vec<_>>();
                writeln!(f, "    join: {} AS {} ON {}", join.table, join.alias, on.join(" AND "))?;
            }
            if !step.request.order_by.is_empty() {
                let keys = step
                    .request
                    .order_by
                    .iter()
                    .map(|o| if o.descending { format!("{} DESC", o.column) } else { o.column.clone() })
                    .collect::<Vec<_>>();
                writeln!(f, "    order: {}", keys.join(", "))?;
            }
            if let Some(limit) = step.request.limit {
                writeln!(f, "    limit: {limit}")?;
            }
            if let Some(offset) = step.request.offset {
                writeln!(f, "    offset: {offset}")?;
            }
            if let Some(join) = &step.semi_join {
                writeln!(
                    f,
                    "    semi-join: {} IN keys of fetch[{}].{}",
                    join.target_column, join.driver_step, join.driver_column
                )?;
            }
        }
        match &self.finish {
            Finish::PassThrough(projection) => {
                let names = projection.columns.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
                writeln!(f, "  pass-through: {}", names.join(", "))
            }
            Finish::Local(stage) => writeln!(f, "  local: {}", stage.sql),
        }
    }
}

impl fmt::Display for WritePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.request.operation {
            WriteOperation::Insert => "Insert",
            WriteOperation::Update => "Update",
            WriteOperation::Delete => "Delete",
        };
        writeln!(f, "{op} {}.{}", self.source_id, self.request.table)?;
        match self.request.operation {
            WriteOperation::Insert => writeln!(f, "  rows: {}", self.request.rows.len())?,
            WriteOperation::Update => {
                let set = self
                    .request
                    .rows
                    .first()
                    .map(|a| a.iter().map(|(c, v)| format!("{c} = {v}")).collect::<Vec<_>>())
                    .unwrap_or_default();
                writeln!(f, "  set: {}", set.join(", "))?;
            }
            WriteOperation::Delete => {}
        }
        if let Some(fragment) = &self.request.fragment {
            writeln!(f, "  native: {}", fragment.text)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveql_core::types::Column;

    #[test]
    fn joined_rows_are_addressed_through_the_alias() {
        let schema = Schema::new(vec![
            Column::new("u", DataType::Struct(vec![Column::new("id", DataType::Integer, true)]), true),
            Column::new("o", DataType::Struct(vec![Column::new("id", DataType::Integer, true)]), true),
        ]);
        let row = Row::new(vec![
            Value::Struct(vec![("id".into(), Value::Int(1))]),
            Value::Struct(vec![("id".into(), Value::Int(7))]),
        ]);
        let column = ColumnRef::qualified("o", "id");
        assert_eq!(column_value(&schema, true, &row, &column), Some(&Value::Int(7)));
        assert_eq!(column_value(&schema, false, &row, &column.unqualified()), None);
    }

    #[test]
    fn plain_rows_follow_nested_paths() {
        let schema = Schema::new(vec![Column::new(
            "profile",
            DataType::Struct(vec![Column::new("score", DataType::Float, true)]),
            true,
        )]);
        let row = Row::new(vec![Value::Struct(vec![("score".into(), Value::Float(2.5))])]);
        let column = ColumnRef {
            qualifier: None,
            path: vec!["profile".into(), "score".into()],
        };
        assert_eq!(column_value(&schema, false, &row, &column), Some(&Value::Float(2.5)));
    }
}
