// SPDX-License-Identifier: Apache-2.0

//! Query planner
//!
//! Resolves a compiled statement against the schemas and capabilities of the
//! sources it names, then decides what each source evaluates:
//! - WHERE conjuncts are partitioned per table and translated into native
//!   fragments; what a source cannot evaluate stays as an in-process residual
//! - GROUP BY + aggregates are pushed as a unit, or not at all
//! - joins between tables of one source are pushed when it declares `joins`;
//!   other joins run locally, optionally narrowed by a semi-join
//! - ORDER BY / LIMIT / OFFSET are pushed only when a single fetch with no
//!   residual produces the final rows
//!
//! A local stage is planned only when something is left to do after the fetches.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use waveql_core::capability::{AggregateFunc, Capability, PredicateShape};
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::{ColumnRef, Literal, Predicate};
use waveql_core::traits::{
    AggregateCall, FetchRequest, OrderSpec, PushedAggregate, PushedJoin, WriteOperation, WriteRequest,
};
use waveql_core::types::{parse_timestamp, Column, DataType, Schema, TableKey};
use waveql_query::{local_table_name, DirectProjection, LocalBinding, LocalQueryBuilder};
use waveql_sql::ast::{
    aggregate_output_name, CompiledQuery, DeleteStatement, InsertStatement, JoinClause, OrderExpr, OrderKey,
    SelectItem, SelectStatement, Statement, TableRef, UpdateStatement,
};
use waveql_sql::translate;

use super::types::{Finish, LocalStage, Plan, SelectPlan, SemiJoin, SourceFetchStep, WritePlan};

/// What the planner knows about the connection's sources.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    pub default_source: Option<String>,
    pub capabilities: HashMap<String, Capability>,
    pub schemas: HashMap<TableKey, Arc<Schema>>,
    pub row_limit_per_source: Option<u64>,
}

impl PlanContext {
    /// Source serving `table`: its qualifier, or the default source.
    pub fn source_for(&self, table: &TableRef) -> EngineResult<String> {
        let source = match &table.source {
            Some(source) => source.clone(),
            None => self.default_source.clone().ok_or_else(|| {
                EngineError::query_error(format!(
                    "table '{}' has no source qualifier and no default source is set",
                    table.table
                ))
            })?,
        };
        if !self.capabilities.contains_key(&source) {
            return Err(EngineError::query_error(format!("unknown source '{source}'")));
        }
        Ok(source)
    }

    fn capability(&self, source_id: &str) -> EngineResult<&Capability> {
        self.capabilities
            .get(source_id)
            .ok_or_else(|| EngineError::query_error(format!("unknown source '{source_id}'")))
    }

    fn schema(&self, source_id: &str, table: &str) -> Option<Arc<Schema>> {
        self.schemas.get(&TableKey::new(source_id, table)).cloned()
    }
}

/// Plans a compiled statement.
pub fn plan(compiled: &CompiledQuery, ctx: &PlanContext) -> EngineResult<Plan> {
    match &compiled.statement {
        Statement::Select(select) => plan_select(&compiled.sql, select, ctx).map(|p| Plan::Select(Arc::new(p))),
        Statement::Insert(insert) => plan_insert(insert, ctx).map(Plan::Write),
        Statement::Update(update) => plan_update(update, ctx).map(Plan::Write),
        Statement::Delete(delete) => plan_delete(delete, ctx).map(Plan::Write),
    }
}

/// A table of the query under the name it is addressed by.
struct Binding {
    name: String,
    table: String,
    source_id: String,
    schema: Arc<Schema>,
}

struct Resolver<'a> {
    bindings: &'a [Binding],
}

impl Resolver<'_> {
    fn position(&self, name: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.name == name)
    }

    /// Binding index, binding-qualified reference and type of `column`.
    fn resolve(&self, column: &ColumnRef) -> EngineResult<(usize, ColumnRef, DataType)> {
        let unknown = || EngineError::query_error(format!("unknown column '{column}'"));
        match &column.qualifier {
            Some(qualifier) => {
                let index = self
                    .position(qualifier)
                    .ok_or_else(|| EngineError::query_error(format!("unknown table '{qualifier}'")))?;
                let data_type = self.bindings[index]
                    .schema
                    .resolve_path(&column.path)
                    .ok_or_else(unknown)?;
                Ok((index, column.clone(), data_type.clone()))
            }
            None => {
                let hits: Vec<(usize, &DataType)> = self
                    .bindings
                    .iter()
                    .enumerate()
                    .filter_map(|(i, b)| b.schema.resolve_path(&column.path).map(|t| (i, t)))
                    .collect();
                match hits.as_slice() {
                    [(index, data_type)] => Ok((
                        *index,
                        ColumnRef {
                            qualifier: Some(self.bindings[*index].name.clone()),
                            path: column.path.clone(),
                        },
                        (*data_type).clone(),
                    )),
                    [] => Err(unknown()),
                    _ => Err(EngineError::query_error(format!("ambiguous column '{column}'"))),
                }
            }
        }
    }

    fn column(&self, column: &ColumnRef) -> EngineResult<ColumnRef> {
        self.resolve(column).map(|(_, c, _)| c)
    }

    /// Qualifies every column and coerces literals to the column types.
    fn predicate(&self, predicate: &Predicate) -> EngineResult<Predicate> {
        Ok(match predicate {
            Predicate::Comparison { column, op, literal } => {
                let (_, column, data_type) = self.resolve(column)?;
                Predicate::Comparison {
                    column,
                    op: *op,
                    literal: coerce_literal(literal, &data_type),
                }
            }
            Predicate::In { column, values } => {
                let (_, column, data_type) = self.resolve(column)?;
                Predicate::In {
                    column,
                    values: values.iter().map(|v| coerce_literal(v, &data_type)).collect(),
                }
            }
            Predicate::Like { column, pattern } => Predicate::Like {
                column: self.column(column)?,
                pattern: pattern.clone(),
            },
            Predicate::IsNull(column) => Predicate::IsNull(self.column(column)?),
            Predicate::And(parts) => Predicate::And(self.predicates(parts)?),
            Predicate::Or(parts) => Predicate::Or(self.predicates(parts)?),
            Predicate::Not(inner) => Predicate::Not(Box::new(self.predicate(inner)?)),
        })
    }

    fn predicates(&self, parts: &[Predicate]) -> EngineResult<Vec<Predicate>> {
        parts.iter().map(|p| self.predicate(p)).collect()
    }

    /// Index of the binding a resolved column belongs to.
    fn owner(&self, column: &ColumnRef) -> Option<usize> {
        column.qualifier.as_deref().and_then(|q| self.position(q))
    }
}

/// String literals compared with timestamp columns become timestamps.
pub(crate) fn coerce_literal(literal: &Literal, data_type: &DataType) -> Literal {
    match (literal, data_type) {
        (Literal::String(text), DataType::Timestamp) => parse_timestamp(text)
            .map(Literal::Timestamp)
            .unwrap_or_else(|| literal.clone()),
        _ => literal.clone(),
    }
}

/// Join keys travel between sources whose column types need not agree.
pub(crate) fn coerce_key(literal: &Literal, data_type: &DataType) -> Literal {
    match (literal, data_type) {
        (Literal::Int(i), DataType::String) => Literal::String(i.to_string()),
        (Literal::Int(i), DataType::Float) => Literal::Float(*i as f64),
        (Literal::Float(f), DataType::Integer) if f.fract() == 0.0 => Literal::Int(*f as i64),
        (Literal::String(text), DataType::Integer) => text
            .trim()
            .parse()
            .map(Literal::Int)
            .unwrap_or_else(|_| literal.clone()),
        _ => coerce_literal(literal, data_type),
    }
}

fn plan_select(sql: &str, select: &SelectStatement, ctx: &PlanContext) -> EngineResult<SelectPlan> {
    let mut bindings: Vec<Binding> = Vec::new();
    for table in select.tables() {
        let name = table.binding().to_string();
        if bindings.iter().any(|b| b.name == name) {
            return Err(EngineError::query_error(format!(
                "table name '{name}' specified more than once"
            )));
        }
        let source_id = ctx.source_for(table)?;
        let schema = ctx.schema(&source_id, &table.table).ok_or_else(|| {
            EngineError::query_error(format!("unknown table '{}' in source '{source_id}'", table.table))
        })?;
        bindings.push(Binding {
            name,
            table: table.table.clone(),
            source_id,
            schema,
        });
    }
    let resolver = Resolver { bindings: &bindings };
    let resolved = resolve_select(select, &resolver)?;
    validate_grouping(&resolved)?;

    // Same-source joins collapse into one step.
    let first_source = &bindings[0].source_id;
    let push_join = bindings.len() > 1
        && bindings.iter().all(|b| &b.source_id == first_source)
        && ctx.capability(first_source)?.joins;
    let step_of: Vec<usize> = if push_join {
        vec![0; bindings.len()]
    } else {
        (0..bindings.len()).collect()
    };
    let step_count = if push_join { 1 } else { bindings.len() };

    let mut per_step: Vec<Vec<Predicate>> = vec![Vec::new(); step_count];
    let mut cross = Vec::new();
    if let Some(selection) = &resolved.selection {
        for conjunct in selection.conjuncts() {
            let steps: BTreeSet<usize> = conjunct
                .columns()
                .into_iter()
                .filter_map(|c| resolver.owner(c))
                .map(|b| step_of[b])
                .collect();
            match steps.iter().next() {
                Some(step) if steps.len() == 1 => per_step[*step].push(conjunct.clone()),
                _ => cross.push(conjunct.clone()),
            }
        }
    }
    let cross_filter = Predicate::conjoin(cross);

    let has_aggregates = resolved.has_aggregates();
    let mut steps = Vec::with_capacity(step_count);
    let mut aggregate_pushed = false;
    for (index, filters) in per_step.into_iter().enumerate() {
        let members: Vec<usize> = (0..bindings.len()).filter(|b| step_of[*b] == index).collect();
        let lead = &bindings[members[0]];
        let capability = ctx.capability(&lead.source_id)?.clone();

        // Single-table step predicates are unqualified; joined ones keep the alias.
        let filter = Predicate::conjoin(filters).map(|p| {
            if push_join {
                p
            } else {
                p.map_columns(&|c| c.unqualified())
            }
        });
        let translated = filter
            .as_ref()
            .map(|p| translate(p, &capability))
            .unwrap_or_default();

        let mut request = FetchRequest::scan(lead.table.clone(), capability.page_size);
        request.alias = lead.name.clone();
        request.fragment = translated.fragment().cloned();
        request.filter = translated.pushed_predicate().cloned();

        let mut step = SourceFetchStep {
            index,
            source_id: lead.source_id.clone(),
            table: lead.table.clone(),
            bindings: members.iter().map(|b| bindings[*b].name.clone()).collect(),
            schema: lead.schema.clone(),
            capability,
            request,
            pushed: translated.pushed_predicate().cloned(),
            residual: translated.residual.clone(),
            semi_join: None,
            local_table: local_table_name(&lead.table, index),
            observe: None,
            row_limit: ctx.row_limit_per_source,
        };

        if push_join {
            step.request.joins = resolved
                .joins
                .iter()
                .map(|join| PushedJoin {
                    table: join.table.table.clone(),
                    alias: join.table.binding().to_string(),
                    on: join.on.clone(),
                })
                .collect();
            step.schema = Arc::new(Schema::new(
                members
                    .iter()
                    .map(|b| Column::new(bindings[*b].name.as_str(), bindings[*b].schema.as_struct(), true))
                    .collect(),
            ));
            debug!(source_id = %step.source_id, tables = members.len(), "join pushed to source");
        } else {
            let pushed = if step_count == 1 && has_aggregates && step.residual.is_none() {
                push_aggregate(&resolved, lead, &step.capability)
            } else {
                None
            };
            match pushed {
                Some((aggregate, schema)) => {
                    debug!(source_id = %step.source_id, table = %step.table, "aggregate pushed to source");
                    step.request.aggregate = Some(aggregate);
                    step.schema = Arc::new(schema);
                    aggregate_pushed = true;
                }
                None => {
                    if let Some(roots) = needed_roots(&resolved, &lead.name, &lead.schema) {
                        let columns: Vec<Column> = lead
                            .schema
                            .columns
                            .iter()
                            .filter(|c| roots.iter().any(|r| r == c.name.as_str()))
                            .cloned()
                            .collect();
                        step.request.columns = roots;
                        step.schema = Arc::new(Schema::new(columns));
                    }
                    step.observe = Some(TableKey::new(lead.source_id.clone(), lead.table.clone()));
                }
            }
        }
        steps.push(step);
    }

    let local_aggregation = has_aggregates && !aggregate_pushed;
    let mut order_pushed = false;
    let mut limit_pushed = false;
    if let [step] = steps.as_mut_slice() {
        if step.residual.is_none() && !has_aggregates && step.capability.order_by && !resolved.order_by.is_empty() {
            if let Some(specs) = order_specs(&resolved.order_by, step.is_joined()) {
                step.request.order_by = specs;
                order_pushed = true;
            }
        }
        let paging = resolved.limit.is_some() || resolved.offset.is_some();
        if paging
            && step.residual.is_none()
            && !local_aggregation
            && (resolved.order_by.is_empty() || order_pushed)
            && (resolved.limit.is_none() || step.capability.limit)
            && (resolved.offset.is_none() || step.capability.offset)
        {
            step.request.limit = resolved.limit;
            step.request.offset = resolved.offset;
            limit_pushed = true;
        }
        debug!(order_pushed, limit_pushed, "ordering and paging decided");
    }

    if steps.len() > 1 {
        plan_semi_joins(&resolved.joins, &resolver, &step_of, &mut steps);
    }

    let mut local_statement = resolved.clone();
    local_statement.selection = None;
    if limit_pushed {
        local_statement.limit = None;
        local_statement.offset = None;
    }
    let mut builder = LocalQueryBuilder::new(&local_statement)
        .filter(cross_filter.clone())
        .pre_aggregated(aggregate_pushed);
    for (i, binding) in bindings.iter().enumerate() {
        let step = &steps[step_of[i]];
        let local = if step.is_joined() {
            LocalBinding::nested(step.local_table.clone(), binding.name.clone(), binding.schema.clone())
        } else if aggregate_pushed {
            LocalBinding::new(step.local_table.clone(), step.schema.clone())
        } else {
            LocalBinding::new(step.local_table.clone(), binding.schema.clone())
        };
        builder = builder.bind(binding.name.clone(), local);
    }

    let pass_through = steps.len() == 1
        && !local_aggregation
        && (resolved.order_by.is_empty() || order_pushed)
        && ((resolved.limit.is_none() && resolved.offset.is_none()) || limit_pushed);
    let finish = if pass_through {
        Finish::PassThrough(DirectProjection::resolve(&builder, &steps[0].schema)?)
    } else {
        let query = builder.build()?;
        Finish::Local(LocalStage {
            sql: query.sql,
            columns: query.columns,
            cross_filter,
            pre_aggregated: aggregate_pushed,
        })
    };

    Ok(SelectPlan {
        sql: sql.to_string(),
        steps,
        finish,
    })
}

fn resolve_select(select: &SelectStatement, resolver: &Resolver<'_>) -> EngineResult<SelectStatement> {
    let mut projection = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        projection.push(match item {
            SelectItem::Wildcard => SelectItem::Wildcard,
            SelectItem::QualifiedWildcard(qualifier) => {
                if resolver.position(qualifier).is_none() {
                    return Err(EngineError::query_error(format!("unknown table '{qualifier}'")));
                }
                SelectItem::QualifiedWildcard(qualifier.clone())
            }
            SelectItem::Column { column, alias } => SelectItem::Column {
                column: resolver.column(column)?,
                alias: alias.clone(),
            },
            SelectItem::Aggregate { func, arg, alias } => SelectItem::Aggregate {
                func: *func,
                arg: arg.as_ref().map(|c| resolver.column(c)).transpose()?,
                alias: alias.clone(),
            },
        });
    }

    let joins = select
        .joins
        .iter()
        .map(|join| {
            Ok(JoinClause {
                table: join.table.clone(),
                on: join
                    .on
                    .iter()
                    .map(|(l, r)| Ok((resolver.column(l)?, resolver.column(r)?)))
                    .collect::<EngineResult<Vec<_>>>()?,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    // ORDER BY may name an output column instead of a source column.
    let renamed: Vec<String> = select
        .projection
        .iter()
        .filter(|item| match item {
            SelectItem::Column { alias, .. } => alias.is_some(),
            SelectItem::Aggregate { .. } => true,
            _ => false,
        })
        .filter_map(SelectItem::output_name)
        .collect();
    let order_by = select
        .order_by
        .iter()
        .map(|key| {
            let expr = match &key.expr {
                OrderExpr::Column(c)
                    if c.qualifier.is_none() && !c.is_nested() && renamed.iter().any(|o| o == c.root()) =>
                {
                    OrderExpr::Column(c.clone())
                }
                OrderExpr::Column(c) => OrderExpr::Column(resolver.column(c)?),
                OrderExpr::Aggregate { func, arg } => OrderExpr::Aggregate {
                    func: *func,
                    arg: arg.as_ref().map(|c| resolver.column(c)).transpose()?,
                },
            };
            Ok(OrderKey {
                expr,
                descending: key.descending,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(SelectStatement {
        projection,
        from: select.from.clone(),
        joins,
        selection: select.selection.as_ref().map(|p| resolver.predicate(p)).transpose()?,
        group_by: select
            .group_by
            .iter()
            .map(|c| resolver.column(c))
            .collect::<EngineResult<Vec<_>>>()?,
        order_by,
        limit: select.limit,
        offset: select.offset,
    })
}

/// With aggregates, plain projected columns must be grouped and `*` is not allowed.
fn validate_grouping(select: &SelectStatement) -> EngineResult<()> {
    if !select.has_aggregates() {
        return Ok(());
    }
    for item in &select.projection {
        match item {
            SelectItem::Wildcard | SelectItem::QualifiedWildcard(_) => {
                return Err(EngineError::query_error(
                    "'*' cannot be combined with aggregates or GROUP BY",
                ));
            }
            SelectItem::Column { column, .. } if !select.group_by.contains(column) => {
                return Err(EngineError::query_error(format!(
                    "column '{column}' must appear in GROUP BY or be used in an aggregate"
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

/// GROUP BY and every aggregate of a single-table query, when the source can
/// evaluate all of them; the schema is that of the grouped records.
fn push_aggregate(
    select: &SelectStatement,
    binding: &Binding,
    capability: &Capability,
) -> Option<(PushedAggregate, Schema)> {
    let pushable = |c: &ColumnRef| !c.is_nested() && capability.column_pushable(&c.dotted());

    let mut calls: Vec<(AggregateFunc, Option<ColumnRef>)> = Vec::new();
    let order_aggregates = select.order_by.iter().filter_map(|k| match &k.expr {
        OrderExpr::Aggregate { func, arg } => Some((*func, arg.clone())),
        OrderExpr::Column(_) => None,
    });
    let projected = select.projection.iter().filter_map(|item| match item {
        SelectItem::Aggregate { func, arg, .. } => Some((*func, arg.clone())),
        _ => None,
    });
    for (func, arg) in projected.chain(order_aggregates) {
        if !capability.supports_aggregate(func) || !arg.as_ref().map_or(true, pushable) {
            return None;
        }
        if !calls.contains(&(func, arg.clone())) {
            calls.push((func, arg));
        }
    }
    if !select.group_by.iter().all(pushable) {
        return None;
    }

    let mut columns = Vec::new();
    for column in &select.group_by {
        let data_type = binding.schema.resolve_path(&column.path)?.clone();
        columns.push(Column::new(column.dotted(), data_type, true));
    }
    let mut aggregates = Vec::with_capacity(calls.len());
    for (func, arg) in calls {
        let arg_type = match &arg {
            Some(column) => Some(binding.schema.resolve_path(&column.path)?.clone()),
            None => None,
        };
        let data_type = match (func, arg_type) {
            (AggregateFunc::Count, _) => DataType::Integer,
            (AggregateFunc::Avg, _) => DataType::Float,
            (AggregateFunc::Sum, Some(DataType::Integer)) => DataType::Integer,
            (AggregateFunc::Sum, _) => DataType::Float,
            (AggregateFunc::Min | AggregateFunc::Max, Some(t)) => t,
            (AggregateFunc::Min | AggregateFunc::Max, None) => DataType::Null,
        };
        let output = aggregate_output_name(func, arg.as_ref());
        columns.push(Column::new(output.as_str(), data_type, true));
        aggregates.push(AggregateCall {
            func,
            column: arg.map(|c| c.dotted()),
            output,
        });
    }

    Some((
        PushedAggregate {
            group_by: select.group_by.iter().map(ColumnRef::dotted).collect(),
            aggregates,
        },
        Schema::new(columns),
    ))
}

/// Top-level columns of `binding` the query touches, in schema order;
/// `None` when all are needed.
fn needed_roots(select: &SelectStatement, binding: &str, schema: &Schema) -> Option<Vec<String>> {
    let mut refs: Vec<&ColumnRef> = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard => return None,
            SelectItem::QualifiedWildcard(q) if q == binding => return None,
            SelectItem::QualifiedWildcard(_) => {}
            SelectItem::Column { column, .. } => refs.push(column),
            SelectItem::Aggregate { arg, .. } => refs.extend(arg.iter()),
        }
    }
    for join in &select.joins {
        for (l, r) in &join.on {
            refs.push(l);
            refs.push(r);
        }
    }
    refs.extend(select.group_by.iter());
    for key in &select.order_by {
        match &key.expr {
            OrderExpr::Column(c) => refs.push(c),
            OrderExpr::Aggregate { arg, .. } => refs.extend(arg.iter()),
        }
    }
    if let Some(selection) = &select.selection {
        refs.extend(selection.columns());
    }

    let used: BTreeSet<&str> = refs
        .into_iter()
        .filter(|c| c.qualifier.as_deref() == Some(binding))
        .map(ColumnRef::root)
        .collect();
    if used.is_empty() {
        return None;
    }
    Some(
        schema
            .columns
            .iter()
            .filter(|c| used.contains(c.name.as_str()))
            .map(|c| c.name.to_string())
            .collect(),
    )
}

/// Source sort keys, when every ORDER BY key is a plain column.
fn order_specs(order_by: &[OrderKey], joined: bool) -> Option<Vec<OrderSpec>> {
    order_by
        .iter()
        .map(|key| match &key.expr {
            OrderExpr::Column(c) => {
                let qualifier = c.qualifier.as_ref()?;
                Some(OrderSpec {
                    column: if joined {
                        format!("{qualifier}.{}", c.dotted())
                    } else {
                        c.dotted()
                    },
                    descending: key.descending,
                })
            }
            OrderExpr::Aggregate { .. } => None,
        })
        .collect()
}

/// Picks, per cross-source join, a step whose fetch is narrowed to the join
/// keys another step produced. The joined table is preferred as target.
fn plan_semi_joins(
    joins: &[JoinClause],
    resolver: &Resolver<'_>,
    step_of: &[usize],
    steps: &mut [SourceFetchStep],
) {
    for join in joins {
        let Some(joined) = resolver.position(join.table.binding()).map(|b| step_of[b]) else {
            continue;
        };
        for (left, right) in &join.on {
            let (Some(l), Some(r)) = (resolver.owner(left), resolver.owner(right)) else {
                continue;
            };
            let (ls, rs) = (step_of[l], step_of[r]);
            if ls == rs {
                continue;
            }
            // (target step, target column, driver step, driver column)
            let (near, far) = if rs == joined {
                ((rs, right), (ls, left))
            } else {
                ((ls, left), (rs, right))
            };
            let candidates = [(near, far), (far, near)];
            let chosen = candidates
                .into_iter()
                .find(|((target, column), (driver, _))| semi_join_eligible(steps, *target, *driver, column));
            if let Some(((target, target_column), (driver, driver_column))) = chosen {
                let step = &steps[target];
                let target_column = target_column.unqualified();
                let target_type = step
                    .schema
                    .resolve_path(&target_column.path)
                    .cloned()
                    .unwrap_or(DataType::Null);
                let base_filter = Predicate::conjoin(
                    step.pushed.iter().chain(step.residual.iter()).cloned().collect(),
                );
                debug!(
                    target = %step.table,
                    driver = %steps[driver].table,
                    column = %target_column,
                    "semi-join planned"
                );
                steps[target].semi_join = Some(SemiJoin {
                    driver_step: driver,
                    driver_column: driver_column.unqualified(),
                    target_column,
                    target_type,
                    base_filter,
                });
                break;
            }
        }
    }
}

fn semi_join_eligible(steps: &[SourceFetchStep], target: usize, driver: usize, column: &ColumnRef) -> bool {
    let step = &steps[target];
    let is_driver = steps
        .iter()
        .any(|s| s.semi_join.as_ref().map(|j| j.driver_step) == Some(target));
    step.semi_join.is_none()
        && steps[driver].semi_join.is_none()
        && !is_driver
        && !step.is_joined()
        && step.request.aggregate.is_none()
        && step.capability.semi_join
        && step.capability.max_in_list > 0
        && step.capability.supports(PredicateShape::In, &column.dotted())
}

fn plan_insert(insert: &InsertStatement, ctx: &PlanContext) -> EngineResult<WritePlan> {
    let source_id = ctx.source_for(&insert.table)?;
    let schema = ctx.schema(&source_id, &insert.table.table);

    let columns = if insert.columns.is_empty() {
        schema
            .as_ref()
            .map(|s| s.column_names())
            .filter(|names| !names.is_empty())
            .ok_or_else(|| {
                EngineError::query_error(format!(
                    "INSERT INTO {} needs a column list: the table's columns are unknown",
                    insert.table.table
                ))
            })?
    } else {
        insert.columns.clone()
    };
    if let Some(schema) = &schema {
        if let Some(unknown) = columns.iter().find(|c| schema.index_of(c).is_none()) {
            return Err(EngineError::query_error(format!("unknown column '{unknown}'")));
        }
    }

    let mut rows = Vec::with_capacity(insert.rows.len());
    for values in &insert.rows {
        if values.len() != columns.len() {
            return Err(EngineError::query_error(format!(
                "INSERT has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        rows.push(
            columns
                .iter()
                .zip(values)
                .map(|(column, value)| {
                    let value = match schema.as_ref().and_then(|s| s.column(column)) {
                        Some(c) => coerce_literal(value, &c.data_type),
                        None => value.clone(),
                    };
                    (column.clone(), value)
                })
                .collect(),
        );
    }

    Ok(WritePlan {
        source_id,
        request: WriteRequest {
            operation: WriteOperation::Insert,
            table: insert.table.table.clone(),
            rows,
            filter: None,
            fragment: None,
        },
    })
}

fn plan_update(update: &UpdateStatement, ctx: &PlanContext) -> EngineResult<WritePlan> {
    let source_id = ctx.source_for(&update.table)?;
    let schema = ctx.schema(&source_id, &update.table.table);
    let mut assignments = Vec::with_capacity(update.assignments.len());
    for (column, value) in &update.assignments {
        let value = match &schema {
            Some(s) => {
                let c = s
                    .column(column)
                    .ok_or_else(|| EngineError::query_error(format!("unknown column '{column}'")))?;
                coerce_literal(value, &c.data_type)
            }
            None => value.clone(),
        };
        assignments.push((column.clone(), value));
    }

    let mut request = WriteRequest {
        operation: WriteOperation::Update,
        table: update.table.table.clone(),
        rows: vec![assignments],
        filter: None,
        fragment: None,
    };
    push_write_filter(&mut request, &update.table, &source_id, update.selection.as_ref(), schema, ctx)?;
    Ok(WritePlan { source_id, request })
}

fn plan_delete(delete: &DeleteStatement, ctx: &PlanContext) -> EngineResult<WritePlan> {
    let source_id = ctx.source_for(&delete.table)?;
    let schema = ctx.schema(&source_id, &delete.table.table);
    let mut request = WriteRequest {
        operation: WriteOperation::Delete,
        table: delete.table.table.clone(),
        rows: Vec::new(),
        filter: None,
        fragment: None,
    };
    push_write_filter(&mut request, &delete.table, &source_id, delete.selection.as_ref(), schema, ctx)?;
    Ok(WritePlan { source_id, request })
}

/// UPDATE/DELETE filters run at the source or not at all.
fn push_write_filter(
    request: &mut WriteRequest,
    table: &TableRef,
    source_id: &str,
    selection: Option<&Predicate>,
    schema: Option<Arc<Schema>>,
    ctx: &PlanContext,
) -> EngineResult<()> {
    let Some(selection) = selection else {
        return Ok(());
    };
    let predicate = match schema {
        Some(schema) => {
            let bindings = [Binding {
                name: table.binding().to_string(),
                table: table.table.clone(),
                source_id: source_id.to_string(),
                schema,
            }];
            Resolver { bindings: &bindings }.predicate(selection)?
        }
        None => selection.clone(),
    }
    .map_columns(&|c| c.unqualified());

    let translated = translate(&predicate, ctx.capability(source_id)?);
    if let Some(residual) = translated.residual {
        return Err(EngineError::query_error(format!(
            "source '{source_id}' cannot evaluate '{residual}'; UPDATE and DELETE filters must be fully pushable"
        )));
    }
    request.filter = translated.pushed.as_ref().map(|p| p.predicate.clone());
    request.fragment = translated.pushed.map(|p| p.fragment);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use waveql_core::capability::{DialectKind, FragmentEncoding};
    use waveql_core::predicate::CompareOp;
    use waveql_sql::compile;

    fn incidents() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new("number", DataType::String, false),
            Column::new("priority", DataType::Integer, true),
            Column::new("assignee", DataType::String, true),
            Column::new("state", DataType::String, true),
            Column::new("opened_at", DataType::Timestamp, true),
        ]))
    }

    fn users() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new("id", DataType::Integer, false),
            Column::new("name", DataType::String, true),
            Column::new(
                "profile",
                DataType::Struct(vec![Column::new("score", DataType::Float, true)]),
                true,
            ),
        ]))
    }

    fn orders() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new("id", DataType::Integer, false),
            Column::new("user_id", DataType::Integer, true),
            Column::new("total", DataType::Float, true),
        ]))
    }

    fn servicenow() -> Capability {
        Capability::none(
            DialectKind::ServiceNow,
            FragmentEncoding::QueryParam {
                name: "sysparm_query".into(),
            },
        )
        .with_shapes([PredicateShape::Compare(CompareOp::LtEq)])
    }

    fn sql() -> Capability {
        Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere)
    }

    fn context() -> PlanContext {
        let mut ctx = PlanContext {
            default_source: Some("sn".into()),
            ..Default::default()
        };
        ctx.capabilities.insert("sn".into(), servicenow());
        ctx.capabilities.insert("db".into(), sql());
        ctx.capabilities.insert(
            "files".into(),
            Capability {
                joins: false,
                ..sql()
            },
        );
        ctx.schemas.insert(TableKey::new("sn", "incident"), incidents());
        ctx.schemas.insert(TableKey::new("db", "users"), users());
        ctx.schemas.insert(TableKey::new("db", "orders"), orders());
        ctx.schemas.insert(TableKey::new("files", "orders"), orders());
        ctx
    }

    fn select_plan(sql: &str) -> Arc<SelectPlan> {
        match plan(&compile(sql).unwrap(), &context()).unwrap() {
            Plan::Select(plan) => plan,
            Plan::Write(_) => panic!("expected a select plan"),
        }
    }

    fn plan_error(sql: &str) -> EngineError {
        plan(&compile(sql).unwrap(), &context()).unwrap_err()
    }

    #[test]
    fn partial_pushdown_keeps_a_residual() {
        let plan = select_plan("SELECT number FROM incident WHERE priority <= 2 AND assignee = 'bob'");
        let step = &plan.steps[0];
        assert_eq!(
            step.pushed,
            Some(Predicate::compare(ColumnRef::new("priority"), CompareOp::LtEq, Literal::Int(2)))
        );
        assert_eq!(
            step.residual,
            Some(Predicate::compare(
                ColumnRef::new("assignee"),
                CompareOp::Eq,
                Literal::String("bob".into())
            ))
        );
        assert_eq!(step.request.fragment.as_ref().unwrap().text, "priority<=2");
        assert!(matches!(plan.finish, Finish::PassThrough(_)));
    }

    #[test]
    fn residual_blocks_limit_pushdown() {
        let plan = select_plan("SELECT number FROM incident WHERE assignee = 'bob' LIMIT 5");
        assert_eq!(plan.steps[0].request.limit, None);
        match &plan.finish {
            Finish::Local(stage) => assert!(stage.sql.ends_with("LIMIT 5")),
            Finish::PassThrough(_) => panic!("limit must run locally"),
        }
    }

    #[test]
    fn single_source_order_and_limit_are_pushed() {
        let plan = select_plan("SELECT name FROM db.users WHERE id > 1 ORDER BY name DESC LIMIT 2 OFFSET 1");
        let request = &plan.steps[0].request;
        assert_eq!(request.order_by, vec![OrderSpec { column: "name".into(), descending: true }]);
        assert_eq!((request.limit, request.offset), (Some(2), Some(1)));
        assert_eq!(request.columns, vec!["id", "name"]);
        assert!(matches!(plan.finish, Finish::PassThrough(_)));
    }

    #[test]
    fn cross_source_join_keeps_limit_local() {
        let plan = select_plan(
            "SELECT u.name, o.total FROM db.users u JOIN files.orders o ON u.id = o.user_id LIMIT 10",
        );
        assert_eq!(plan.steps.len(), 2);
        assert!(plan.steps.iter().all(|s| s.request.limit.is_none()));
        match &plan.finish {
            Finish::Local(stage) => assert!(stage.sql.contains("LIMIT 10")),
            Finish::PassThrough(_) => panic!("join must run locally"),
        }
        let semi = plan.steps[1].semi_join.as_ref().unwrap();
        assert_eq!(semi.driver_step, 0);
        assert_eq!(semi.driver_column, ColumnRef::new("id"));
        assert_eq!(semi.target_column, ColumnRef::new("user_id"));
    }

    #[test]
    fn same_source_join_is_pushed() {
        let plan = select_plan(
            "SELECT u.name, o.total FROM db.users u JOIN db.orders o ON u.id = o.user_id WHERE o.total > 10",
        );
        assert_eq!(plan.steps.len(), 1);
        let step = &plan.steps[0];
        assert_eq!(step.bindings, vec!["u", "o"]);
        assert_eq!(step.request.joins.len(), 1);
        assert_eq!(step.schema.column_names(), vec!["u", "o"]);
        assert_eq!(step.pushed.as_ref().unwrap().columns()[0].qualifier.as_deref(), Some("o"));
        assert!(matches!(plan.finish, Finish::PassThrough(_)));
    }

    #[test]
    fn grouped_aggregate_pushdown() {
        let plan = select_plan("SELECT user_id, COUNT(*), AVG(total) FROM db.orders GROUP BY user_id");
        let step = &plan.steps[0];
        let aggregate = step.request.aggregate.as_ref().unwrap();
        assert_eq!(aggregate.group_by, vec!["user_id"]);
        let outputs: Vec<&str> = aggregate.aggregates.iter().map(|a| a.output.as_str()).collect();
        assert_eq!(outputs, vec!["count", "avg_total"]);
        assert_eq!(step.schema.column("avg_total").unwrap().data_type, DataType::Float);
        assert!(matches!(plan.finish, Finish::PassThrough(_)));

        // The ServiceNow capability has no aggregates: grouping runs locally.
        let plan = select_plan("SELECT state, COUNT(*) FROM incident GROUP BY state");
        assert!(plan.steps[0].request.aggregate.is_none());
        assert!(matches!(plan.finish, Finish::Local(_)));
    }

    #[test]
    fn timestamps_are_coerced() {
        let plan = select_plan("SELECT number FROM incident WHERE opened_at <= '2024-01-01'");
        match plan.steps[0].pushed.as_ref().unwrap() {
            Predicate::Comparison { literal, .. } => assert!(matches!(literal, Literal::Timestamp(_))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resolution_errors() {
        assert!(matches!(plan_error("SELECT nope FROM incident"), EngineError::QueryError { .. }));
        assert!(matches!(plan_error("SELECT * FROM missing"), EngineError::QueryError { .. }));
        assert!(matches!(plan_error("SELECT * FROM other.incident"), EngineError::QueryError { .. }));
        let ambiguous = plan_error("SELECT id FROM db.users u JOIN files.orders o ON u.id = o.user_id");
        assert!(ambiguous.to_string().contains("ambiguous"));
        let grouping = plan_error("SELECT state, priority, COUNT(*) FROM incident GROUP BY state");
        assert!(grouping.to_string().contains("GROUP BY"));
    }

    #[test]
    fn writes_need_pushable_filters() {
        let ctx = context();
        let compiled = compile("UPDATE incident SET state = 'closed' WHERE priority <= 1").unwrap();
        match plan(&compiled, &ctx).unwrap() {
            Plan::Write(write) => {
                assert_eq!(write.request.operation, WriteOperation::Update);
                assert_eq!(write.request.fragment.unwrap().text, "priority<=1");
            }
            Plan::Select(_) => panic!("expected a write plan"),
        }
        let compiled = compile("DELETE FROM incident WHERE assignee = 'bob'").unwrap();
        assert!(matches!(plan(&compiled, &ctx), Err(EngineError::QueryError { .. })));
    }

    #[test]
    fn insert_without_columns_uses_the_schema() {
        let compiled = compile("INSERT INTO db.orders VALUES (1, 2, 3.5)").unwrap();
        match plan(&compiled, &context()).unwrap() {
            Plan::Write(write) => {
                let row = &write.request.rows[0];
                assert_eq!(row[1], ("user_id".to_string(), Literal::Int(2)));
            }
            Plan::Select(_) => panic!("expected a write plan"),
        }
        let compiled = compile("INSERT INTO db.orders VALUES (1, 2)").unwrap();
        assert!(plan(&compiled, &context()).is_err());
    }

    #[test]
    fn display_explains_the_plan() {
        let plan = Plan::Select(select_plan(
            "SELECT number FROM incident WHERE priority <= 2 AND assignee = 'bob'",
        ));
        let text = plan.to_string();
        assert!(text.contains("fetch[0] sn.incident"));
        assert!(text.contains("native: priority<=2"));
        assert!(text.contains("residual: assignee = 'bob'"));
    }
}
