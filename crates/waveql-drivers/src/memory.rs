// SPDX-License-Identifier: Apache-2.0

//! In-process source over JSON records.
//!
//! Evaluates whatever its declared capability accepts (filters, aggregates,
//! joins, ordering, limit and offset) the way a remote API would, and keeps
//! a log of received requests so plans can be checked against what actually
//! reached the source.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as Json};
use tracing::debug;

use waveql_core::capability::{AggregateFunc, Capability};
use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::{compare_value, ColumnRef, Predicate};
use waveql_core::traits::{
    FetchRequest, Page, PushedAggregate, PushedJoin, SourceTransport, WriteOperation, WriteRequest,
};
use waveql_core::types::Value;

pub struct MemoryTransport {
    capability: Capability,
    tables: RwLock<HashMap<String, Vec<Json>>>,
    requests: Mutex<Vec<FetchRequest>>,
    latency: Option<Duration>,
    failure: Mutex<Option<EngineError>>,
}

impl MemoryTransport {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            tables: RwLock::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            latency: None,
            failure: Mutex::new(None),
        }
    }

    pub fn with_table(self, name: impl Into<String>, records: Vec<Json>) -> Self {
        self.tables.write().insert(name.into(), records);
        self
    }

    /// Delay applied before every page, to simulate a slow API.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes every subsequent fetch fail with `error`.
    pub fn fail_with(&self, error: EngineError) {
        *self.failure.lock() = Some(error);
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Fetch requests received so far, one entry per page.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn records(&self, table: &str) -> Vec<Json> {
        self.tables.read().get(table).cloned().unwrap_or_default()
    }

    fn table(&self, name: &str) -> EngineResult<Vec<Json>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::transport_fatal("memory", format!("unknown table '{name}'")))
    }

    /// All records the request selects, before pagination.
    fn evaluate(&self, request: &FetchRequest) -> EngineResult<Vec<Json>> {
        let mut records = self.table(&request.table)?;
        let joined = !request.joins.is_empty();
        if joined {
            records = records
                .into_iter()
                .map(|r| {
                    let mut keyed = Map::new();
                    keyed.insert(request.alias.clone(), r);
                    Json::Object(keyed)
                })
                .collect();
            for join in &request.joins {
                records = self.join(records, join)?;
            }
        }

        if let Some(filter) = &request.filter {
            records.retain(|record| matches(filter, record, joined.then_some(request.alias.as_str())));
        }

        if let Some(aggregate) = &request.aggregate {
            records = aggregate_records(&records, aggregate);
        }

        if !request.order_by.is_empty() {
            let keys: Vec<(Vec<String>, bool)> = request
                .order_by
                .iter()
                .map(|o| (o.column.split('.').map(str::to_string).collect(), o.descending))
                .collect();
            let mut decorated: Vec<(Value, Json)> =
                records.into_iter().map(|r| (to_value(&r), r)).collect();
            decorated.sort_by(|(a, _), (b, _)| {
                for (path, descending) in &keys {
                    let ordering = null_last(a.get_path(path), b.get_path(path), *descending);
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
            records = decorated.into_iter().map(|(_, r)| r).collect();
        }

        let offset = request.offset.unwrap_or(0) as usize;
        let limit = request.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    fn join(&self, left: Vec<Json>, join: &PushedJoin) -> EngineResult<Vec<Json>> {
        let right = self.table(&join.table)?;
        let mut out = Vec::new();
        for l in &left {
            for r in &right {
                let mut keyed = match l {
                    Json::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                keyed.insert(join.alias.clone(), r.clone());
                let candidate = to_value(&Json::Object(keyed.clone()));
                let hit = join.on.iter().all(|(a, b)| {
                    let a = candidate.get_path(&full_path(a, None));
                    let b = candidate.get_path(&full_path(b, None));
                    match (a, b) {
                        (Some(a), Some(b)) => compare_value(a, b) == Some(Ordering::Equal),
                        _ => false,
                    }
                });
                if hit {
                    out.push(Json::Object(keyed));
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl SourceTransport for MemoryTransport {
    fn source_kind(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capability {
        self.capability.clone()
    }

    async fn fetch(&self, request: &FetchRequest, page_token: Option<&str>) -> EngineResult<Page> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        self.requests.lock().push(request.clone());

        let records = self.evaluate(request)?;
        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| EngineError::transport_fatal("memory", format!("bad page token '{token}'")))?,
            None => 0,
        };
        let page_size = request.page_size.max(1);
        let end = (start + page_size).min(records.len());
        let page = records.get(start..end).map(<[Json]>::to_vec).unwrap_or_default();
        debug!(table = %request.table, start, returned = page.len(), "Memory fetch");

        Ok(Page {
            records: page,
            next_page: (end < records.len()).then(|| end.to_string()),
        })
    }

    async fn write(&self, request: &WriteRequest) -> EngineResult<u64> {
        let mut tables = self.tables.write();
        let table = tables.entry(request.table.clone()).or_default();
        let selected = |record: &Json| {
            request
                .filter
                .as_ref()
                .map(|f| matches(f, record, None))
                .unwrap_or(true)
        };

        let affected = match request.operation {
            WriteOperation::Insert => {
                for row in &request.rows {
                    let record: Map<String, Json> = row
                        .iter()
                        .map(|(column, literal)| (column.clone(), literal.to_json()))
                        .collect();
                    table.push(Json::Object(record));
                }
                request.rows.len()
            }
            WriteOperation::Update => {
                let assignments = request.rows.first().cloned().unwrap_or_default();
                let mut count = 0;
                for record in table.iter_mut() {
                    if !selected(&*record) {
                        continue;
                    }
                    if let Json::Object(map) = record {
                        for (column, literal) in &assignments {
                            map.insert(column.clone(), literal.to_json());
                        }
                        count += 1;
                    }
                }
                count
            }
            WriteOperation::Delete => {
                let before = table.len();
                table.retain(|record| !selected(record));
                before - table.len()
            }
        };
        Ok(affected as u64)
    }

    async fn list_tables(&self) -> EngineResult<Vec<String>> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Untyped conversion used for in-process evaluation.
fn to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => n
            .as_i64()
            .map(Value::Int)
            .or_else(|| n.as_f64().map(Value::Float))
            .unwrap_or(Value::Null),
        Json::String(s) => Value::Text(s.clone()),
        Json::Array(items) => Value::List(items.iter().map(to_value).collect()),
        Json::Object(map) => Value::Struct(map.iter().map(|(k, v)| (k.clone(), to_value(v))).collect()),
    }
}

/// Path of a column inside a record. Records of joined fetches are keyed by
/// alias; unqualified columns there belong to the driving table.
fn full_path(column: &ColumnRef, driving_alias: Option<&str>) -> Vec<String> {
    column
        .qualifier
        .as_deref()
        .or(driving_alias)
        .map(str::to_string)
        .into_iter()
        .chain(column.path.iter().cloned())
        .collect()
}

fn matches(filter: &Predicate, record: &Json, driving_alias: Option<&str>) -> bool {
    let value = to_value(record);
    filter.matches(&|column: &ColumnRef| {
        let path = match driving_alias {
            Some(_) => full_path(column, driving_alias),
            None => column.path.clone(),
        };
        value.get_path(&path)
    })
}

fn null_last(a: Option<&Value>, b: Option<&Value>, descending: bool) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ordering = compare_value(a, b).unwrap_or(Ordering::Equal);
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        }
    }
}

fn aggregate_records(records: &[Json], aggregate: &PushedAggregate) -> Vec<Json> {
    let paths: Vec<Vec<String>> = aggregate
        .group_by
        .iter()
        .map(|g| g.split('.').map(str::to_string).collect())
        .collect();

    let mut groups: Vec<(Vec<Value>, Vec<Value>)> = Vec::new();
    for record in records {
        let value = to_value(record);
        let key: Vec<Value> = paths
            .iter()
            .map(|p| value.get_path(p).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(value),
            None => groups.push((key, vec![value])),
        }
    }
    if groups.is_empty() && aggregate.group_by.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = Map::new();
            for (name, value) in aggregate.group_by.iter().zip(key) {
                out.insert(name.clone(), value.to_json());
            }
            for call in &aggregate.aggregates {
                let inputs: Vec<&Value> = match &call.column {
                    None => members.iter().collect(),
                    Some(column) => {
                        let path: Vec<String> = column.split('.').map(str::to_string).collect();
                        members
                            .iter()
                            .filter_map(|m| m.get_path(&path))
                            .filter(|v| !v.is_null())
                            .collect()
                    }
                };
                out.insert(call.output.clone(), fold(call.func, &inputs).to_json());
            }
            Json::Object(out)
        })
        .collect()
}

fn fold(func: AggregateFunc, inputs: &[&Value]) -> Value {
    match func {
        AggregateFunc::Count => Value::Int(inputs.len() as i64),
        AggregateFunc::Sum | AggregateFunc::Avg => {
            if inputs.is_empty() {
                return Value::Null;
            }
            let all_int = inputs.iter().all(|v| matches!(v, Value::Int(_)));
            let total: f64 = inputs
                .iter()
                .filter_map(|v| match v {
                    Value::Int(i) => Some(*i as f64),
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .sum();
            match func {
                AggregateFunc::Sum if all_int => Value::Int(
                    inputs
                        .iter()
                        .filter_map(|v| match v {
                            Value::Int(i) => Some(*i),
                            _ => None,
                        })
                        .sum(),
                ),
                AggregateFunc::Sum => Value::Float(total),
                _ => Value::Float(total / inputs.len() as f64),
            }
        }
        AggregateFunc::Min | AggregateFunc::Max => inputs
            .iter()
            .copied()
            .reduce(|best, v| {
                let ordering = compare_value(v, best).unwrap_or(Ordering::Equal);
                let better = match func {
                    AggregateFunc::Min => ordering == Ordering::Less,
                    _ => ordering == Ordering::Greater,
                };
                if better {
                    v
                } else {
                    best
                }
            })
            .cloned()
            .unwrap_or(Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use waveql_core::capability::{DialectKind, FragmentEncoding};
    use waveql_core::predicate::{CompareOp, Literal};
    use waveql_core::traits::{AggregateCall, OrderSpec};

    fn transport() -> MemoryTransport {
        MemoryTransport::new(Capability::full(DialectKind::Sql, FragmentEncoding::SqlWhere)).with_table(
            "tickets",
            vec![
                json!({"id": 1, "state": "open", "priority": 1, "owner": 10}),
                json!({"id": 2, "state": "closed", "priority": 3, "owner": 11}),
                json!({"id": 3, "state": "open", "priority": 2, "owner": 10}),
                json!({"id": 4, "state": "open", "priority": null, "owner": 12}),
            ],
        )
    }

    #[tokio::test]
    async fn pages_follow_tokens_until_exhausted() {
        let t = transport();
        let request = FetchRequest::scan("tickets", 3);
        let first = t.fetch(&request, None).await.unwrap();
        assert_eq!(first.records.len(), 3);
        let token = first.next_page.unwrap();
        let second = t.fetch(&request, Some(&token)).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next_page.is_none());
        assert_eq!(t.requests().len(), 2);
    }

    #[tokio::test]
    async fn filter_order_and_limit() {
        let t = transport();
        let mut request = FetchRequest::scan("tickets", 10);
        request.filter = Some(Predicate::compare(
            ColumnRef::new("state"),
            CompareOp::Eq,
            Literal::String("open".into()),
        ));
        request.order_by = vec![OrderSpec {
            column: "priority".into(),
            descending: true,
        }];
        request.limit = Some(2);
        let page = t.fetch(&request, None).await.unwrap();
        let ids: Vec<i64> = page.records.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![3, 1]);
    }

    #[tokio::test]
    async fn grouped_aggregates() {
        let t = transport();
        let mut request = FetchRequest::scan("tickets", 10);
        request.aggregate = Some(PushedAggregate {
            group_by: vec!["state".into()],
            aggregates: vec![
                AggregateCall {
                    func: AggregateFunc::Count,
                    column: None,
                    output: "count".into(),
                },
                AggregateCall {
                    func: AggregateFunc::Avg,
                    column: Some("priority".into()),
                    output: "avg_priority".into(),
                },
            ],
        });
        let page = t.fetch(&request, None).await.unwrap();
        assert_eq!(
            page.records,
            vec![
                json!({"state": "open", "count": 3, "avg_priority": 1.5}),
                json!({"state": "closed", "count": 1, "avg_priority": 3.0}),
            ]
        );
    }

    #[tokio::test]
    async fn joined_records_are_keyed_by_alias() {
        let t = transport().with_table(
            "users",
            vec![json!({"uid": 10, "name": "ann"}), json!({"uid": 11, "name": "bo"})],
        );
        let mut request = FetchRequest::scan("tickets", 10);
        request.alias = "t".into();
        request.joins = vec![PushedJoin {
            table: "users".into(),
            alias: "u".into(),
            on: vec![(ColumnRef::qualified("t", "owner"), ColumnRef::qualified("u", "uid"))],
        }];
        request.filter = Some(Predicate::compare(
            ColumnRef::qualified("u", "name"),
            CompareOp::Eq,
            Literal::String("ann".into()),
        ));
        let page = t.fetch(&request, None).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0]["t"]["id"], 1);
        assert_eq!(page.records[0]["u"]["name"], "ann");
    }

    #[tokio::test]
    async fn writes_apply_filters() {
        let t = transport();
        let update = WriteRequest {
            operation: WriteOperation::Update,
            table: "tickets".into(),
            rows: vec![vec![("state".into(), Literal::String("closed".into()))]],
            filter: Some(Predicate::compare(ColumnRef::new("owner"), CompareOp::Eq, Literal::Int(10))),
            fragment: None,
        };
        assert_eq!(t.write(&update).await.unwrap(), 2);

        let delete = WriteRequest {
            operation: WriteOperation::Delete,
            table: "tickets".into(),
            rows: vec![],
            filter: Some(Predicate::compare(
                ColumnRef::new("state"),
                CompareOp::Eq,
                Literal::String("closed".into()),
            )),
            fragment: None,
        };
        assert_eq!(t.write(&delete).await.unwrap(), 3);
        assert_eq!(t.records("tickets").len(), 1);
    }

    #[tokio::test]
    async fn injected_failures_surface() {
        let t = transport();
        t.fail_with(EngineError::transport("memory", "rate limited"));
        let err = t.fetch(&FetchRequest::scan("tickets", 10), None).await.unwrap_err();
        assert!(err.is_retryable());
        t.recover();
        assert!(t.fetch(&FetchRequest::scan("tickets", 10), None).await.is_ok());
    }
}
