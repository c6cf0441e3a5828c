// SPDX-License-Identifier: Apache-2.0

//! SQL text → `CompiledQuery`.
//!
//! Parsing is delegated to `sqlparser` with the generic dialect; this module
//! walks the AST and keeps only what federation can execute. Anything outside
//! that surface is rejected up front with the offending clause.

use sqlparser::ast::{
    self as sql, BinaryOperator, DuplicateTreatment, Expr, FromTable, FunctionArg,
    FunctionArgExpr, FunctionArguments, GroupByExpr, JoinConstraint, JoinOperator, LimitClause,
    ObjectName, ObjectNamePart, OrderByKind, Query, SetExpr, TableFactor, UnaryOperator,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::trace;

use waveql_core::capability::AggregateFunc;
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::{ColumnRef, CompareOp, Literal, Predicate};
use waveql_core::types::parse_timestamp;

use crate::ast::{
    CompiledQuery, DeleteStatement, InsertStatement, JoinClause, OrderExpr, OrderKey,
    SelectItem, SelectStatement, Statement, TableRef, UpdateStatement,
};

/// Compiles one SQL statement.
pub fn compile(sql: &str) -> EngineResult<CompiledQuery> {
    let text = sql.trim();
    if text.trim_end_matches(';').trim().is_empty() {
        return Err(EngineError::syntax_error("empty query"));
    }
    if tokenize(text)?.iter().any(|t| matches!(t, Token::Placeholder(_))) {
        return Err(EngineError::syntax_at(
            "parameter placeholders need bound values",
            "?",
        ));
    }

    let statement = if leading_keyword(text)? == Some(Keyword::UPDATE) {
        Statement::Update(compile_update(text)?)
    } else {
        let mut statements = Parser::parse_sql(&GenericDialect {}, text)
            .map_err(|e| EngineError::syntax_error(e.to_string()))?;
        if statements.len() > 1 {
            return Err(EngineError::syntax_at(
                "multiple statements are not supported",
                statements[1].to_string(),
            ));
        }
        let Some(statement) = statements.pop() else {
            return Err(EngineError::syntax_error("empty query"));
        };
        match &statement {
            sql::Statement::Query(query) => Statement::Select(compile_query(query)?),
            sql::Statement::Insert(insert) => Statement::Insert(compile_insert(insert)?),
            sql::Statement::Delete(delete) => Statement::Delete(compile_delete(delete)?),
            other => {
                let text = other.to_string();
                let keyword = text.split_whitespace().next().unwrap_or_default().to_string();
                return Err(EngineError::syntax_at("unsupported statement", keyword));
            }
        }
    };

    trace!(kind = statement.kind(), "Compiled statement");
    Ok(CompiledQuery {
        sql: text.to_string(),
        statement,
    })
}

// --- Names and scope ---

fn part_value(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(ident) => ident.value.clone(),
        #[allow(unreachable_patterns)]
        other => unquote(&other.to_string()),
    }
}

/// Splits `source.table` into its parts. More than two parts is an error.
fn split_name(name: &ObjectName) -> EngineResult<(Option<String>, String)> {
    let mut parts: Vec<String> = name.0.iter().map(part_value).collect();
    match parts.len() {
        1 => Ok((None, parts.remove(0))),
        2 => {
            let table = parts.remove(1);
            Ok((Some(parts.remove(0)), table))
        }
        _ => Err(EngineError::syntax_at(
            "table names take the form source.table",
            name.to_string(),
        )),
    }
}

/// Strips one level of identifier quoting (`"x"`, `` `x` ``, `[x]`).
fn unquote(text: &str) -> String {
    let text = text.trim();
    let bytes = text.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'`' && last == b'`') {
            let quote = first as char;
            return text[1..text.len() - 1].replace(&format!("{quote}{quote}"), &quote.to_string());
        }
        if first == b'[' && last == b']' {
            return text[1..text.len() - 1].to_string();
        }
    }
    text.to_string()
}

/// Table bindings visible to column references.
struct Scope {
    bindings: Vec<String>,
}

impl Scope {
    fn single(table: &TableRef) -> Self {
        Self {
            bindings: vec![table.binding().to_string()],
        }
    }

    fn column(&self, idents: &[sql::Ident]) -> ColumnRef {
        let parts: Vec<String> = idents.iter().map(|i| i.value.clone()).collect();
        if parts.len() > 1 && self.bindings.contains(&parts[0]) {
            ColumnRef {
                qualifier: Some(parts[0].clone()),
                path: parts[1..].to_vec(),
            }
        } else {
            ColumnRef {
                qualifier: None,
                path: parts,
            }
        }
    }
}

fn column_of(expr: &Expr, scope: &Scope) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(scope.column(std::slice::from_ref(ident))),
        Expr::CompoundIdentifier(idents) => Some(scope.column(idents)),
        Expr::Nested(inner) => column_of(inner, scope),
        _ => None,
    }
}

fn table_ref(factor: &TableFactor) -> EngineResult<TableRef> {
    match factor {
        TableFactor::Table {
            name, alias, args, ..
        } => {
            if args.is_some() {
                return Err(EngineError::syntax_at(
                    "table functions are not supported",
                    factor.to_string(),
                ));
            }
            let (source, table) = split_name(name)?;
            Ok(TableRef {
                source,
                table,
                alias: alias.as_ref().map(|a| a.name.value.clone()),
            })
        }
        TableFactor::Derived { .. } => Err(EngineError::syntax_at(
            "subqueries are not supported",
            factor.to_string(),
        )),
        other => Err(EngineError::syntax_at(
            "unsupported table reference",
            other.to_string(),
        )),
    }
}

// --- SELECT ---

fn compile_query(query: &Query) -> EngineResult<SelectStatement> {
    if query.with.is_some() {
        return Err(EngineError::syntax_at("CTEs are not supported", "WITH"));
    }
    if query.fetch.is_some() {
        return Err(EngineError::syntax_at("FETCH is not supported", "FETCH"));
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        SetExpr::SetOperation { op, .. } => {
            return Err(EngineError::syntax_at(
                format!("{op} is not supported"),
                query.body.to_string(),
            ))
        }
        SetExpr::Query(_) => {
            return Err(EngineError::syntax_at(
                "subqueries are not supported",
                query.body.to_string(),
            ))
        }
        other => {
            return Err(EngineError::syntax_at(
                "unsupported query body",
                other.to_string(),
            ))
        }
    };

    if select.distinct.is_some() {
        return Err(EngineError::syntax_at("DISTINCT is not supported", "DISTINCT"));
    }
    if let Some(having) = &select.having {
        return Err(EngineError::syntax_at(
            "HAVING is not supported",
            having.to_string(),
        ));
    }

    let twj = match select.from.as_slice() {
        [] => return Err(EngineError::syntax_error("SELECT requires a FROM clause")),
        [single] => single,
        [_, second, ..] => {
            return Err(EngineError::syntax_at(
                "comma-separated FROM lists (cross joins) are not supported",
                second.to_string(),
            ))
        }
    };

    let from = table_ref(&twj.relation)?;
    let mut joined = Vec::with_capacity(twj.joins.len());
    for join in &twj.joins {
        let table = table_ref(&join.relation)?;
        let constraint = match &join.join_operator {
            JoinOperator::Join(constraint) | JoinOperator::Inner(constraint) => constraint,
            _ => {
                return Err(EngineError::syntax_at(
                    "only inner joins are supported",
                    join.to_string(),
                ))
            }
        };
        joined.push((table, constraint, join.to_string()));
    }

    let mut scope = Scope::single(&from);
    for (table, _, clause) in &joined {
        let binding = table.binding().to_string();
        if scope.bindings.contains(&binding) {
            return Err(EngineError::syntax_at(
                format!("table binding '{binding}' is used twice; add an alias"),
                clause.clone(),
            ));
        }
        scope.bindings.push(binding);
    }

    let mut joins = Vec::with_capacity(joined.len());
    for (table, constraint, clause) in joined {
        let on = match constraint {
            JoinConstraint::On(expr) => join_pairs(expr, &scope)?,
            _ => {
                return Err(EngineError::syntax_at(
                    "joins need an ON condition",
                    clause,
                ))
            }
        };
        joins.push(JoinClause { table, on });
    }

    let mut projection = Vec::with_capacity(select.projection.len());
    for item in &select.projection {
        projection.push(match item {
            sql::SelectItem::UnnamedExpr(expr) => projection_item(expr, None, &scope)?,
            sql::SelectItem::ExprWithAlias { expr, alias } => {
                projection_item(expr, Some(alias.value.clone()), &scope)?
            }
            sql::SelectItem::Wildcard(_) => SelectItem::Wildcard,
            sql::SelectItem::QualifiedWildcard(..) => {
                let text = item.to_string();
                let qualifier = text.trim_end_matches('*').trim_end_matches('.');
                let last = qualifier.rsplit('.').next().unwrap_or(qualifier);
                SelectItem::QualifiedWildcard(unquote(last))
            }
        });
    }

    let selection = select
        .selection
        .as_ref()
        .map(|expr| predicate(expr, &scope))
        .transpose()?;

    let group_by = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs
            .iter()
            .map(|expr| {
                column_of(expr, &scope).ok_or_else(|| {
                    EngineError::syntax_at("GROUP BY supports plain columns only", expr.to_string())
                })
            })
            .collect::<EngineResult<Vec<_>>>()?,
        GroupByExpr::All(_) => {
            return Err(EngineError::syntax_at(
                "GROUP BY ALL is not supported",
                "GROUP BY ALL",
            ))
        }
    };

    let mut order_by = Vec::new();
    if let Some(order) = &query.order_by {
        match &order.kind {
            OrderByKind::Expressions(exprs) => {
                for item in exprs {
                    order_by.push(OrderKey {
                        expr: order_expr(&item.expr, &scope)?,
                        descending: item.options.asc == Some(false),
                    });
                }
            }
            _ => {
                return Err(EngineError::syntax_at(
                    "ORDER BY ALL is not supported",
                    order.to_string(),
                ))
            }
        }
    }

    let (limit, offset) = match &query.limit_clause {
        None => (None, None),
        Some(LimitClause::LimitOffset {
            limit,
            offset,
            limit_by,
        }) => {
            if !limit_by.is_empty() {
                return Err(EngineError::syntax_at("LIMIT BY is not supported", "BY"));
            }
            (
                limit.as_ref().map(|e| unsigned(e, "LIMIT")).transpose()?,
                offset.as_ref().map(|o| unsigned(&o.value, "OFFSET")).transpose()?,
            )
        }
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => (
            Some(unsigned(limit, "LIMIT")?),
            Some(unsigned(offset, "OFFSET")?),
        ),
    };

    Ok(SelectStatement {
        projection,
        from,
        joins,
        selection,
        group_by,
        order_by,
        limit,
        offset,
    })
}

fn join_pairs(expr: &Expr, scope: &Scope) -> EngineResult<Vec<(ColumnRef, ColumnRef)>> {
    match expr {
        Expr::Nested(inner) => join_pairs(inner, scope),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            let mut pairs = join_pairs(left, scope)?;
            pairs.extend(join_pairs(right, scope)?);
            Ok(pairs)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => match (column_of(left, scope), column_of(right, scope)) {
            (Some(l), Some(r)) => Ok(vec![(l, r)]),
            _ => Err(EngineError::syntax_at(
                "join conditions must be equalities between columns",
                expr.to_string(),
            )),
        },
        _ => Err(EngineError::syntax_at(
            "join conditions must be equalities between columns",
            expr.to_string(),
        )),
    }
}

fn projection_item(expr: &Expr, alias: Option<String>, scope: &Scope) -> EngineResult<SelectItem> {
    if let Some(column) = column_of(expr, scope) {
        return Ok(SelectItem::Column { column, alias });
    }
    match expr {
        Expr::Function(func) => {
            let (func, arg) = aggregate_call(func, scope)?;
            Ok(SelectItem::Aggregate { func, arg, alias })
        }
        Expr::Subquery(_) => Err(EngineError::syntax_at(
            "subqueries are not supported",
            expr.to_string(),
        )),
        _ => Err(EngineError::syntax_at(
            "unsupported expression in SELECT list",
            expr.to_string(),
        )),
    }
}

fn aggregate_call(
    func: &sql::Function,
    scope: &Scope,
) -> EngineResult<(AggregateFunc, Option<ColumnRef>)> {
    let clause = func.to_string();
    if func.over.is_some() {
        return Err(EngineError::syntax_at("window functions are not supported", clause));
    }
    let name = func.name.to_string();
    let Some(aggregate) = AggregateFunc::from_name(&unquote(&name)) else {
        return Err(EngineError::syntax_at(
            format!("unsupported function {name}"),
            clause,
        ));
    };
    if func.filter.is_some() {
        return Err(EngineError::syntax_at(
            "aggregate FILTER clauses are not supported",
            clause,
        ));
    }

    let FunctionArguments::List(list) = &func.args else {
        return Err(EngineError::syntax_at(
            format!("{aggregate} takes one argument"),
            clause,
        ));
    };
    if matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)) {
        return Err(EngineError::syntax_at(
            "DISTINCT aggregates are not supported",
            clause,
        ));
    }
    let [arg] = list.args.as_slice() else {
        return Err(EngineError::syntax_at(
            format!("{aggregate} takes one argument"),
            clause,
        ));
    };

    match arg {
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) if aggregate == AggregateFunc::Count => {
            Ok((aggregate, None))
        }
        FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => {
            if let Some(column) = column_of(expr, scope) {
                Ok((aggregate, Some(column)))
            } else if aggregate == AggregateFunc::Count && literal_of(expr).is_some() {
                // COUNT(1) counts rows like COUNT(*)
                Ok((aggregate, None))
            } else {
                Err(EngineError::syntax_at(
                    "aggregate arguments must be columns",
                    clause,
                ))
            }
        }
        _ => Err(EngineError::syntax_at(
            "aggregate arguments must be columns",
            clause,
        )),
    }
}

fn order_expr(expr: &Expr, scope: &Scope) -> EngineResult<OrderExpr> {
    if let Some(column) = column_of(expr, scope) {
        return Ok(OrderExpr::Column(column));
    }
    match expr {
        Expr::Function(func) => {
            let (func, arg) = aggregate_call(func, scope)?;
            Ok(OrderExpr::Aggregate { func, arg })
        }
        _ => Err(EngineError::syntax_at(
            "ORDER BY supports columns, aliases and aggregates",
            expr.to_string(),
        )),
    }
}

fn unsigned(expr: &Expr, clause: &str) -> EngineResult<u64> {
    match literal_of(expr) {
        Some(Literal::Int(i)) if i >= 0 => Ok(i as u64),
        _ => Err(EngineError::syntax_at(
            format!("{clause} must be a non-negative integer literal"),
            expr.to_string(),
        )),
    }
}

// --- WHERE ---

fn predicate(expr: &Expr, scope: &Scope) -> EngineResult<Predicate> {
    match expr {
        Expr::Nested(inner) => predicate(inner, scope),
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(flatten(
                predicate(left, scope)?,
                predicate(right, scope)?,
                true,
            )),
            BinaryOperator::Or => Ok(flatten(
                predicate(left, scope)?,
                predicate(right, scope)?,
                false,
            )),
            BinaryOperator::Eq => comparison(expr, left, CompareOp::Eq, right, scope),
            BinaryOperator::NotEq => comparison(expr, left, CompareOp::NotEq, right, scope),
            BinaryOperator::Lt => comparison(expr, left, CompareOp::Lt, right, scope),
            BinaryOperator::LtEq => comparison(expr, left, CompareOp::LtEq, right, scope),
            BinaryOperator::Gt => comparison(expr, left, CompareOp::Gt, right, scope),
            BinaryOperator::GtEq => comparison(expr, left, CompareOp::GtEq, right, scope),
            _ => Err(EngineError::syntax_at(
                format!("operator {op} is not supported"),
                expr.to_string(),
            )),
        },
        Expr::UnaryOp {
            op: UnaryOperator::Not,
            expr: inner,
        } => Ok(Predicate::Not(Box::new(predicate(inner, scope)?))),
        Expr::IsNull(inner) => Ok(Predicate::IsNull(required_column(inner, scope)?)),
        Expr::IsNotNull(inner) => Ok(Predicate::Not(Box::new(Predicate::IsNull(
            required_column(inner, scope)?,
        )))),
        Expr::InList {
            expr: inner,
            list,
            negated,
        } => {
            let column = required_column(inner, scope)?;
            let values = list
                .iter()
                .map(required_literal)
                .collect::<EngineResult<Vec<_>>>()?;
            Ok(negate_if(*negated, Predicate::In { column, values }))
        }
        Expr::Between {
            expr: inner,
            negated,
            low,
            high,
        } => {
            let column = required_column(inner, scope)?;
            let range = Predicate::And(vec![
                Predicate::compare(column.clone(), CompareOp::GtEq, required_literal(low)?),
                Predicate::compare(column, CompareOp::LtEq, required_literal(high)?),
            ]);
            Ok(negate_if(*negated, range))
        }
        Expr::Like {
            negated,
            expr: inner,
            pattern,
            escape_char,
            ..
        } => {
            if escape_char.is_some() {
                return Err(EngineError::syntax_at(
                    "LIKE ... ESCAPE is not supported",
                    expr.to_string(),
                ));
            }
            let column = required_column(inner, scope)?;
            let Some(Literal::String(pattern)) = literal_of(pattern) else {
                return Err(EngineError::syntax_at(
                    "LIKE patterns must be string literals",
                    expr.to_string(),
                ));
            };
            Ok(negate_if(*negated, Predicate::Like { column, pattern }))
        }
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            // Bare boolean column
            let column = required_column(expr, scope)?;
            Ok(Predicate::compare(column, CompareOp::Eq, Literal::Bool(true)))
        }
        Expr::Subquery(_) | Expr::InSubquery { .. } | Expr::Exists { .. } => Err(
            EngineError::syntax_at("subqueries are not supported", expr.to_string()),
        ),
        Expr::Function(func) if func.over.is_some() => Err(EngineError::syntax_at(
            "window functions are not supported",
            expr.to_string(),
        )),
        Expr::Function(_) => Err(EngineError::syntax_at(
            "functions are not supported in WHERE",
            expr.to_string(),
        )),
        _ => Err(EngineError::syntax_at(
            "unsupported expression in WHERE",
            expr.to_string(),
        )),
    }
}

fn flatten(left: Predicate, right: Predicate, conjunction: bool) -> Predicate {
    let mut parts = Vec::new();
    for side in [left, right] {
        match (side, conjunction) {
            (Predicate::And(inner), true) | (Predicate::Or(inner), false) => parts.extend(inner),
            (other, _) => parts.push(other),
        }
    }
    if conjunction {
        Predicate::And(parts)
    } else {
        Predicate::Or(parts)
    }
}

fn negate_if(negated: bool, predicate: Predicate) -> Predicate {
    if negated {
        Predicate::Not(Box::new(predicate))
    } else {
        predicate
    }
}

fn comparison(
    whole: &Expr,
    left: &Expr,
    op: CompareOp,
    right: &Expr,
    scope: &Scope,
) -> EngineResult<Predicate> {
    if matches!(left, Expr::Subquery(_)) || matches!(right, Expr::Subquery(_)) {
        return Err(EngineError::syntax_at(
            "subqueries are not supported",
            whole.to_string(),
        ));
    }
    match (column_of(left, scope), column_of(right, scope)) {
        (Some(column), None) => match literal_of(right) {
            Some(literal) => Ok(Predicate::compare(column, op, literal)),
            None => Err(non_literal(whole)),
        },
        (None, Some(column)) => match literal_of(left) {
            Some(literal) => Ok(Predicate::compare(column, op.flipped(), literal)),
            None => Err(non_literal(whole)),
        },
        (Some(_), Some(_)) => Err(EngineError::syntax_at(
            "column-to-column comparisons are only supported in JOIN ... ON",
            whole.to_string(),
        )),
        (None, None) => Err(non_literal(whole)),
    }
}

fn non_literal(expr: &Expr) -> EngineError {
    EngineError::syntax_at(
        "comparisons must be between a column and a literal",
        expr.to_string(),
    )
}

fn required_column(expr: &Expr, scope: &Scope) -> EngineResult<ColumnRef> {
    column_of(expr, scope)
        .ok_or_else(|| EngineError::syntax_at("expected a column", expr.to_string()))
}

fn required_literal(expr: &Expr) -> EngineResult<Literal> {
    literal_of(expr)
        .ok_or_else(|| EngineError::syntax_at("expected a literal value", expr.to_string()))
}

fn literal_of(expr: &Expr) -> Option<Literal> {
    match expr {
        Expr::Value(value) => match &value.value {
            SqlValue::Number(n, _) => n
                .parse::<i64>()
                .map(Literal::Int)
                .ok()
                .or_else(|| n.parse::<f64>().ok().map(Literal::Float)),
            SqlValue::SingleQuotedString(s) => Some(Literal::String(s.clone())),
            SqlValue::Boolean(b) => Some(Literal::Bool(*b)),
            SqlValue::Null => Some(Literal::Null),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr: inner,
        } => match literal_of(inner)? {
            Literal::Int(i) => Some(Literal::Int(-i)),
            Literal::Float(f) => Some(Literal::Float(-f)),
            _ => None,
        },
        Expr::UnaryOp {
            op: UnaryOperator::Plus,
            expr: inner,
        } => match literal_of(inner)? {
            numeric @ (Literal::Int(_) | Literal::Float(_)) => Some(numeric),
            _ => None,
        },
        Expr::Nested(inner) => literal_of(inner),
        Expr::TypedString { .. } => typed_literal(&expr.to_string()),
        _ => None,
    }
}

/// `TIMESTAMP '2024-01-01 10:00:00'` / `DATE '2024-01-01'`
fn typed_literal(text: &str) -> Option<Literal> {
    let (kind, rest) = text.split_once(' ')?;
    match kind.to_ascii_uppercase().as_str() {
        "TIMESTAMP" | "DATE" | "DATETIME" => {
            let value = rest.trim().trim_matches('\'');
            parse_timestamp(value).map(Literal::Timestamp)
        }
        _ => None,
    }
}

// --- INSERT / DELETE ---

fn compile_insert(insert: &sql::Insert) -> EngineResult<InsertStatement> {
    let table_text = insert.table.to_string();
    let name = Parser::new(&GenericDialect {})
        .try_with_sql(&table_text)
        .and_then(|mut parser| parser.parse_object_name(false))
        .map_err(|e| EngineError::syntax_at(e.to_string(), table_text.clone()))?;
    let (source, table) = split_name(&name)?;
    let table = TableRef {
        source,
        table,
        alias: None,
    };

    let columns: Vec<String> = insert
        .columns
        .iter()
        .map(|c| unquote(&c.to_string()))
        .collect();

    let Some(source) = &insert.source else {
        return Err(EngineError::syntax_error("INSERT requires a VALUES list"));
    };
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(EngineError::syntax_at(
            "INSERT ... SELECT is not supported",
            source.to_string(),
        ));
    };

    let mut rows = Vec::with_capacity(values.rows.len());
    for row in &values.rows {
        let literals = row
            .iter()
            .map(required_literal)
            .collect::<EngineResult<Vec<_>>>()?;
        if !columns.is_empty() && literals.len() != columns.len() {
            return Err(EngineError::syntax_error(format!(
                "INSERT row has {} values for {} columns",
                literals.len(),
                columns.len()
            )));
        }
        rows.push(literals);
    }

    Ok(InsertStatement {
        table,
        columns,
        rows,
    })
}

fn compile_delete(delete: &sql::Delete) -> EngineResult<DeleteStatement> {
    let tables = match &delete.from {
        FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables) => tables,
    };
    let [twj] = tables.as_slice() else {
        return Err(EngineError::syntax_error("DELETE targets exactly one table"));
    };
    if !twj.joins.is_empty() || delete.using.is_some() {
        return Err(EngineError::syntax_at(
            "DELETE with joins is not supported",
            twj.to_string(),
        ));
    }
    let table = table_ref(&twj.relation)?;
    let scope = Scope::single(&table);
    let selection = delete
        .selection
        .as_ref()
        .map(|expr| predicate(expr, &scope))
        .transpose()?;
    Ok(DeleteStatement { table, selection })
}

// --- UPDATE ---
//
// UPDATE is split at the token level: the target and WHERE clause go through
// the SELECT path, each SET value is parsed as a standalone expression.

pub(crate) fn tokenize(sql: &str) -> EngineResult<Vec<Token>> {
    Tokenizer::new(&GenericDialect {}, sql)
        .tokenize()
        .map_err(|e| EngineError::syntax_error(e.to_string()))
}

fn leading_keyword(sql: &str) -> EngineResult<Option<Keyword>> {
    Ok(tokenize(sql)?.into_iter().find_map(|token| match token {
        Token::Whitespace(_) => None,
        Token::Word(word) => Some(Some(word.keyword)),
        _ => Some(None),
    }).flatten())
}

fn is_keyword(token: &Token, keyword: Keyword) -> bool {
    matches!(token, Token::Word(word) if word.keyword == keyword)
}

fn render(tokens: &[Token]) -> String {
    tokens.iter().map(token_text).collect::<String>().trim().to_string()
}

/// Source text of a token. String literals are re-escaped.
pub(crate) fn token_text(token: &Token) -> String {
    match token {
        Token::SingleQuotedString(s) => SqlValue::SingleQuotedString(s.clone()).to_string(),
        other => other.to_string(),
    }
}

/// Positions of top-level (paren depth 0) tokens matching `pred`.
fn top_level_positions(tokens: &[Token], pred: impl Fn(&Token) -> bool) -> Vec<usize> {
    let mut depth = 0i32;
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::LParen => depth += 1,
            Token::RParen => depth -= 1,
            _ if depth == 0 && pred(token) => out.push(i),
            _ => {}
        }
    }
    out
}

fn compile_update(sql: &str) -> EngineResult<UpdateStatement> {
    let mut tokens = tokenize(sql)?;
    tokens.retain(|t| !matches!(t, Token::EOF));

    if let Some(&semi) = top_level_positions(&tokens, |t| matches!(t, Token::SemiColon)).first() {
        let rest = render(&tokens[semi + 1..]);
        if !rest.trim_matches(';').trim().is_empty() {
            return Err(EngineError::syntax_at("multiple statements are not supported", rest));
        }
        tokens.truncate(semi);
    }

    let update_at = tokens
        .iter()
        .position(|t| is_keyword(t, Keyword::UPDATE))
        .ok_or_else(|| EngineError::syntax_error("expected UPDATE"))?;
    let set_at = top_level_positions(&tokens, |t| is_keyword(t, Keyword::SET))
        .into_iter()
        .find(|&i| i > update_at)
        .ok_or_else(|| EngineError::syntax_at("UPDATE requires a SET clause", sql))?;
    let where_at = top_level_positions(&tokens, |t| is_keyword(t, Keyword::WHERE))
        .into_iter()
        .find(|&i| i > set_at);

    let target = render(&tokens[update_at + 1..set_at]);
    let assignments_end = where_at.unwrap_or(tokens.len());
    let assignment_tokens = &tokens[set_at + 1..assignments_end];

    // Reuse the SELECT path for the target table and the WHERE clause.
    let lookup = match where_at {
        Some(at) => format!("SELECT * FROM {target} WHERE {}", render(&tokens[at + 1..])),
        None => format!("SELECT * FROM {target}"),
    };
    let lookup = match compile(&lookup)?.statement {
        Statement::Select(select) => select,
        _ => return Err(EngineError::internal("UPDATE lookup did not compile to SELECT")),
    };
    if !lookup.joins.is_empty() {
        return Err(EngineError::syntax_at("UPDATE with joins is not supported", target));
    }

    let mut assignments = Vec::new();
    let mut start = 0;
    let mut bounds = top_level_positions(assignment_tokens, |t| matches!(t, Token::Comma));
    bounds.push(assignment_tokens.len());
    for end in bounds {
        let part = &assignment_tokens[start..end];
        start = end + 1;
        let clause = render(part);
        let eq = part
            .iter()
            .position(|t| matches!(t, Token::Eq))
            .ok_or_else(|| EngineError::syntax_at("expected column = value", clause.clone()))?;
        let column = part[..eq]
            .iter()
            .rev()
            .find_map(|t| match t {
                Token::Word(word) => Some(word.value.clone()),
                _ => None,
            })
            .ok_or_else(|| EngineError::syntax_at("expected a column name", clause.clone()))?;
        let value_text = render(&part[eq + 1..]);
        let value = Parser::new(&GenericDialect {})
            .try_with_sql(&value_text)
            .and_then(|mut parser| parser.parse_expr())
            .map_err(|e| EngineError::syntax_at(e.to_string(), clause.clone()))?;
        let literal = required_literal(&value)?;
        assignments.push((column, literal));
    }
    if assignments.is_empty() {
        return Err(EngineError::syntax_at("UPDATE requires a SET clause", sql));
    }

    Ok(UpdateStatement {
        table: lookup.from,
        assignments,
        selection: lookup.selection,
    })
}
