// SPDX-License-Identifier: Apache-2.0

//! Local-stage SQL.
//!
//! Each fetched input is loaded into the query's DuckDB instance under a
//! generated name (`__fed_{table}_{n}`) and the statement is re-rendered
//! against those names. Inputs produced by a join the source already
//! evaluated hold one struct column per table alias; columns of those
//! bindings are addressed through that struct.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use waveql_core::capability::AggregateFunc;
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::{ColumnRef, Predicate};
use waveql_core::types::Schema;
use waveql_sql::ast::{aggregate_output_name, OrderExpr, SelectItem, SelectStatement};
use waveql_sql::pushdown::dialects::sql::{quote_ident, render_column};
use waveql_sql::pushdown::dialects::SqlDialect;
use waveql_sql::NativeDialect;

/// Name of the temp table holding the `index`-th fetched input.
pub fn local_table_name(table: &str, index: usize) -> String {
    let safe: String = table
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("__fed_{safe}_{index}")
}

/// Where a query binding (table name or alias) lives in the local engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalBinding {
    pub local_table: String,
    /// Struct column holding this binding's record, for inputs fetched
    /// through a source-side join.
    pub prefix: Option<String>,
    /// Record schema of the binding's table, used to expand `*`.
    #[serde(skip)]
    pub schema: Arc<Schema>,
}

impl LocalBinding {
    pub fn new(local_table: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            local_table: local_table.into(),
            prefix: None,
            schema,
        }
    }

    pub fn nested(local_table: impl Into<String>, prefix: impl Into<String>, schema: Arc<Schema>) -> Self {
        Self {
            local_table: local_table.into(),
            prefix: Some(prefix.into()),
            schema,
        }
    }
}

/// Rendered local query and its output column names
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalQuery {
    pub sql: String,
    pub columns: Vec<String>,
}

/// Renders a resolved `SELECT` against loaded inputs.
///
/// The statement is expected to carry only what is still to be done
/// locally: a limit or offset the source already applied must be cleared.
/// Its `selection` is not rendered; filters that span inputs are passed
/// through [`LocalQueryBuilder::filter`].
pub struct LocalQueryBuilder<'a> {
    statement: &'a SelectStatement,
    bindings: Vec<(String, LocalBinding)>,
    filter: Option<Predicate>,
    pre_aggregated: bool,
}

impl<'a> LocalQueryBuilder<'a> {
    pub fn new(statement: &'a SelectStatement) -> Self {
        Self {
            statement,
            bindings: Vec::new(),
            filter: None,
            pre_aggregated: false,
        }
    }

    /// Registers a binding; bindings render in registration order.
    pub fn bind(mut self, binding: impl Into<String>, local: LocalBinding) -> Self {
        self.bindings.push((binding.into(), local));
        self
    }

    /// Predicate spanning several inputs, applied in `WHERE`.
    pub fn filter(mut self, predicate: Option<Predicate>) -> Self {
        self.filter = predicate;
        self
    }

    /// The single input already holds grouped rows keyed by group column and
    /// aggregate output name.
    pub fn pre_aggregated(mut self, pre_aggregated: bool) -> Self {
        self.pre_aggregated = pre_aggregated;
        self
    }

    pub fn statement(&self) -> &SelectStatement {
        self.statement
    }

    pub fn bindings(&self) -> &[(String, LocalBinding)] {
        &self.bindings
    }

    pub fn is_pre_aggregated(&self) -> bool {
        self.pre_aggregated
    }

    pub fn build(&self) -> EngineResult<LocalQuery> {
        if self.bindings.is_empty() {
            return Err(EngineError::internal("local stage has no inputs"));
        }
        let statement = self.statement;

        let mut items = Vec::new();
        let mut columns = Vec::new();
        for item in &statement.projection {
            match item {
                SelectItem::Wildcard => {
                    for (name, binding) in &self.bindings {
                        self.expand(name, binding, &mut items, &mut columns);
                    }
                }
                SelectItem::QualifiedWildcard(qualifier) => {
                    let (name, binding) = self.binding(Some(qualifier.as_str()))?;
                    self.expand(name, binding, &mut items, &mut columns);
                }
                SelectItem::Column { column, .. } => {
                    let output = item.output_name().unwrap_or_default();
                    items.push(format!("{} AS {}", self.column(column)?, quote_ident(&output)));
                    columns.push(output);
                }
                SelectItem::Aggregate { func, arg, .. } => {
                    let output = item.output_name().unwrap_or_default();
                    items.push(format!(
                        "{} AS {}",
                        self.aggregate(*func, arg.as_ref())?,
                        quote_ident(&output)
                    ));
                    columns.push(output);
                }
            }
        }
        if items.is_empty() {
            return Err(EngineError::query_error("query selects no columns"));
        }

        let mut sql = format!("SELECT {} FROM {}", items.join(", "), self.from_clause()?);

        if let Some(filter) = &self.filter {
            for column in filter.columns() {
                self.local_ref(column)?;
            }
            let mapped = filter.map_columns(&|c| self.local_ref(c).unwrap_or_else(|_| c.clone()));
            let rendered = SqlDialect.render(&mapped).ok_or_else(|| {
                EngineError::query_error(format!("filter cannot be evaluated locally: {filter}"))
            })?;
            sql.push_str(" WHERE ");
            sql.push_str(&rendered);
        }

        if !self.pre_aggregated && !statement.group_by.is_empty() {
            let keys = statement
                .group_by
                .iter()
                .map(|c| self.column(c))
                .collect::<EngineResult<Vec<_>>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&keys.join(", "));
        }

        if !statement.order_by.is_empty() {
            let mut keys = Vec::with_capacity(statement.order_by.len());
            for key in &statement.order_by {
                let expr = match &key.expr {
                    OrderExpr::Column(c) if is_output_alias(c, &columns) => quote_ident(c.root()),
                    OrderExpr::Column(c) => self.column(c)?,
                    OrderExpr::Aggregate { func, arg } => self.aggregate(*func, arg.as_ref())?,
                };
                keys.push(if key.descending {
                    format!("{expr} DESC")
                } else {
                    expr
                });
            }
            sql.push_str(" ORDER BY ");
            sql.push_str(&keys.join(", "));
        }

        if let Some(limit) = statement.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = statement.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Ok(LocalQuery { sql, columns })
    }

    fn from_clause(&self) -> EngineResult<String> {
        let mut loaded = HashSet::new();
        let mut clause = String::new();

        let (first_name, first) = self.binding(Some(self.statement.from.binding()))?;
        clause.push_str(&table_factor(first_name, first));
        loaded.insert(first.local_table.as_str());

        for join in &self.statement.joins {
            let (name, binding) = self.binding(Some(join.table.binding()))?;
            if !loaded.insert(binding.local_table.as_str()) {
                // Evaluated by the source together with an earlier binding.
                continue;
            }
            if join.on.is_empty() {
                return Err(EngineError::query_error(format!(
                    "join with {} has no equality condition",
                    join.table
                )));
            }
            let conditions = join
                .on
                .iter()
                .map(|(l, r)| Ok(format!("{} = {}", self.column(l)?, self.column(r)?)))
                .collect::<EngineResult<Vec<_>>>()?;
            clause.push_str(&format!(
                " JOIN {} ON {}",
                table_factor(name, binding),
                conditions.join(" AND ")
            ));
        }
        Ok(clause)
    }

    fn expand(&self, name: &str, binding: &LocalBinding, items: &mut Vec<String>, columns: &mut Vec<String>) {
        for column in &binding.schema.columns {
            let reference = ColumnRef::qualified(name, column.name.as_str());
            let rendered = self
                .local_ref(&reference)
                .map(|r| render_column(&r))
                .unwrap_or_else(|_| quote_ident(&column.name));
            items.push(format!("{rendered} AS {}", quote_ident(&column.name)));
            columns.push(column.name.to_string());
        }
    }

    pub(crate) fn binding(&self, qualifier: Option<&str>) -> EngineResult<(&str, &LocalBinding)> {
        match qualifier {
            Some(q) => self
                .bindings
                .iter()
                .find(|(name, _)| name == q)
                .map(|(name, b)| (name.as_str(), b))
                .ok_or_else(|| EngineError::query_error(format!("unknown table '{q}'"))),
            None => match self.bindings.as_slice() {
                [(name, b)] => Ok((name.as_str(), b)),
                _ => Err(EngineError::internal("unqualified column in a multi-table local stage")),
            },
        }
    }

    /// Column reference rewritten against the local engine's names.
    fn local_ref(&self, column: &ColumnRef) -> EngineResult<ColumnRef> {
        let (name, binding) = self.binding(column.qualifier.as_deref())?;
        Ok(match &binding.prefix {
            Some(prefix) => ColumnRef {
                qualifier: Some(binding.local_table.clone()),
                path: std::iter::once(prefix.clone())
                    .chain(column.path.iter().cloned())
                    .collect(),
            },
            None => ColumnRef {
                qualifier: Some(name.to_string()),
                path: column.path.clone(),
            },
        })
    }

    fn column(&self, column: &ColumnRef) -> EngineResult<String> {
        if self.pre_aggregated {
            return Ok(quote_ident(&column.dotted()));
        }
        Ok(render_column(&self.local_ref(column)?))
    }

    fn aggregate(&self, func: AggregateFunc, arg: Option<&ColumnRef>) -> EngineResult<String> {
        if self.pre_aggregated {
            return Ok(quote_ident(&aggregate_output_name(func, arg)));
        }
        Ok(match arg {
            None => format!("{}(*)", func.name()),
            Some(column) => format!("{}({})", func.name(), self.column(column)?),
        })
    }
}

fn table_factor(name: &str, binding: &LocalBinding) -> String {
    match binding.prefix {
        Some(_) => quote_ident(&binding.local_table),
        None => format!("{} AS {}", quote_ident(&binding.local_table), quote_ident(name)),
    }
}

fn is_output_alias(column: &ColumnRef, outputs: &[String]) -> bool {
    column.qualifier.is_none() && !column.is_nested() && outputs.iter().any(|o| o == column.root())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::GenericDialect;
    use sqlparser::parser::Parser;
    use waveql_core::predicate::{CompareOp, Literal};
    use waveql_core::types::{Column, DataType};
    use waveql_sql::ast::Statement;
    use waveql_sql::compile;

    fn select(sql: &str) -> SelectStatement {
        match compile(sql).unwrap().statement {
            Statement::Select(s) => s,
            other => panic!("expected SELECT, got {}", other.kind()),
        }
    }

    fn schema(names: &[&str]) -> Arc<Schema> {
        Arc::new(Schema::new(
            names
                .iter()
                .map(|n| Column::new(*n, DataType::Integer, true))
                .collect(),
        ))
    }

    fn parses(sql: &str) {
        Parser::parse_sql(&GenericDialect {}, sql).unwrap();
    }

    #[test]
    fn cross_source_join_renders_against_temp_tables() {
        let stmt = select(
            "SELECT u.name, o.total FROM crm.users u JOIN shop.orders o ON u.id = o.user_id \
             WHERE u.active = true ORDER BY o.total DESC LIMIT 10",
        );
        let query = LocalQueryBuilder::new(&stmt)
            .bind("u", LocalBinding::new("__fed_users_0", schema(&["id", "name", "active"])))
            .bind("o", LocalBinding::new("__fed_orders_1", schema(&["user_id", "total"])))
            .build()
            .unwrap();
        assert_eq!(
            query.sql,
            r#"SELECT "u"."name" AS "name", "o"."total" AS "total" FROM "__fed_users_0" AS "u" JOIN "__fed_orders_1" AS "o" ON "u"."id" = "o"."user_id" ORDER BY "o"."total" DESC LIMIT 10"#
        );
        assert_eq!(query.columns, vec!["name", "total"]);
        parses(&query.sql);
    }

    #[test]
    fn wildcard_expands_from_schemas() {
        let stmt = select("SELECT * FROM a JOIN b ON a.id = b.id");
        let query = LocalQueryBuilder::new(&stmt)
            .bind("a", LocalBinding::new("__fed_a_0", schema(&["id", "x"])))
            .bind("b", LocalBinding::new("__fed_b_1", schema(&["id", "y"])))
            .build()
            .unwrap();
        assert_eq!(query.columns, vec!["id", "x", "id", "y"]);
        parses(&query.sql);
    }

    #[test]
    fn source_joined_inputs_use_struct_columns() {
        let stmt = select(
            "SELECT i.number, u.name FROM sn.incident i JOIN sn.sys_user u ON i.caller = u.sys_id",
        );
        let query = LocalQueryBuilder::new(&stmt)
            .bind("i", LocalBinding::nested("__fed_incident_0", "i", schema(&["number", "caller"])))
            .bind("u", LocalBinding::nested("__fed_incident_0", "u", schema(&["sys_id", "name"])))
            .build()
            .unwrap();
        assert_eq!(
            query.sql,
            r#"SELECT "__fed_incident_0"."i"."number" AS "number", "__fed_incident_0"."u"."name" AS "name" FROM "__fed_incident_0""#
        );
    }

    #[test]
    fn aggregates_with_group_by_and_cross_table_filter() {
        let stmt = select(
            "SELECT t.state, COUNT(*), AVG(s.score) AS avg_score FROM a.tickets t \
             JOIN b.scores s ON t.id = s.ticket_id GROUP BY t.state ORDER BY COUNT(*) DESC",
        );
        let filter = Predicate::Or(vec![
            Predicate::compare(ColumnRef::qualified("t", "priority"), CompareOp::LtEq, Literal::Int(2)),
            Predicate::compare(ColumnRef::qualified("s", "score"), CompareOp::Gt, Literal::Float(0.5)),
        ]);
        let query = LocalQueryBuilder::new(&stmt)
            .bind("t", LocalBinding::new("__fed_tickets_0", schema(&["id", "state", "priority"])))
            .bind("s", LocalBinding::new("__fed_scores_1", schema(&["ticket_id", "score"])))
            .filter(Some(filter))
            .build()
            .unwrap();
        assert_eq!(query.columns, vec!["state", "count", "avg_score"]);
        assert!(query.sql.contains(r#"WHERE ("t"."priority" <= 2 OR "s"."score" > 0.5)"#));
        assert!(query.sql.contains(r#"GROUP BY "t"."state" ORDER BY COUNT(*) DESC"#));
        parses(&query.sql);
    }

    #[test]
    fn pre_aggregated_input_is_only_projected() {
        let stmt = select("SELECT state, SUM(amount) AS total FROM t GROUP BY state ORDER BY total");
        let query = LocalQueryBuilder::new(&stmt)
            .bind("t", LocalBinding::new("__fed_t_0", schema(&["state", "sum_amount"])))
            .pre_aggregated(true)
            .build()
            .unwrap();
        assert_eq!(
            query.sql,
            r#"SELECT "state" AS "state", "sum_amount" AS "total" FROM "__fed_t_0" AS "t" ORDER BY "total""#
        );
    }

    #[test]
    fn unknown_binding_is_a_query_error() {
        let mut stmt = select("SELECT a FROM t");
        stmt.projection = vec![SelectItem::Column {
            column: ColumnRef::qualified("x", "a"),
            alias: None,
        }];
        let err = LocalQueryBuilder::new(&stmt)
            .bind("t", LocalBinding::new("__fed_t_0", schema(&["a"])))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::QueryError { .. }));
    }

    #[test]
    fn temp_table_names_are_identifier_safe() {
        assert_eq!(local_table_name("Sys User", 3), "__fed_sys_user_3");
    }
}
