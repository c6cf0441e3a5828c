// SPDX-License-Identifier: Apache-2.0

//! Collaborator traits
//!
//! `SourceTransport` is the boundary every remote source implements: it
//! receives already-translated fetch requests and returns raw JSON pages.
//! `LocalEngine` is the embedded analytical engine that evaluates whatever
//! could not be pushed down.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capability::{AggregateFunc, Capability, FragmentEncoding};
use crate::error::EngineResult;
use crate::predicate::{ColumnRef, Literal, Predicate};
use crate::types::{Row, Schema, Table};

/// A filter rendered in a source's native language
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeQueryFragment {
    pub text: String,
    pub encoding: FragmentEncoding,
}

/// One aggregate evaluated by the source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateCall {
    pub func: AggregateFunc,
    /// `None` for `COUNT(*)`.
    pub column: Option<String>,
    /// Key of the aggregate in returned records.
    pub output: String,
}

/// GROUP BY unit pushed to a source as a whole
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedAggregate {
    pub group_by: Vec<String>,
    pub aggregates: Vec<AggregateCall>,
}

/// Inner join between two tables of the same source.
///
/// Records returned for a joined fetch are objects keyed by table alias, each
/// holding that table's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedJoin {
    pub table: String,
    pub alias: String,
    /// Equality pairs `(left, right)`, qualified by alias.
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub column: String,
    pub descending: bool,
}

/// Everything a transport needs to issue one logical fetch (all pages)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub table: String,
    /// Alias of the driving table; qualifies columns in joined fetches.
    pub alias: String,
    pub fragment: Option<NativeQueryFragment>,
    /// The predicate behind `fragment`, for transports that evaluate in process.
    pub filter: Option<Predicate>,
    /// Top-level columns needed; empty means all.
    pub columns: Vec<String>,
    pub aggregate: Option<PushedAggregate>,
    pub joins: Vec<PushedJoin>,
    pub order_by: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub page_size: usize,
}

impl FetchRequest {
    /// Unfiltered listing of a table.
    pub fn scan(table: impl Into<String>, page_size: usize) -> Self {
        let table = table.into();
        Self {
            alias: table.clone(),
            table,
            fragment: None,
            filter: None,
            columns: Vec::new(),
            aggregate: None,
            joins: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            page_size,
        }
    }
}

/// One page of raw records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<serde_json::Value>,
    /// Opaque continuation token; `None` when the source is exhausted.
    pub next_page: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOperation {
    Insert,
    Update,
    Delete,
}

/// Data modification routed to a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub operation: WriteOperation,
    pub table: String,
    /// INSERT: one entry per row. UPDATE: exactly one entry (the SET list).
    pub rows: Vec<Vec<(String, Literal)>>,
    pub filter: Option<Predicate>,
    pub fragment: Option<NativeQueryFragment>,
}

/// Boundary to a remote (or file-backed) data source
#[async_trait]
pub trait SourceTransport: Send + Sync {
    /// Short kind label used in logs ("servicenow", "file", "memory", ...)
    fn source_kind(&self) -> &'static str;

    /// Static description of what the source evaluates natively
    fn capabilities(&self) -> Capability;

    /// Fetches one page. `page_token` is `None` for the first page and
    /// otherwise the `next_page` of the previous response.
    async fn fetch(&self, request: &FetchRequest, page_token: Option<&str>) -> EngineResult<Page>;

    /// Applies a write and returns the number of affected records
    async fn write(&self, request: &WriteRequest) -> EngineResult<u64>;

    /// Tables this source exposes, when it can enumerate them
    async fn list_tables(&self) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Embedded analytical engine executing the local stage of a plan
pub trait LocalEngine: Send {
    /// Creates an empty table with the given schema
    fn load_table(&mut self, name: &str, schema: &Schema) -> EngineResult<()>;

    /// Appends typed rows to a previously loaded table
    fn append_rows(&mut self, name: &str, schema: &Schema, rows: &[Row]) -> EngineResult<()>;

    /// Retypes the columns of a loaded table whose type differs between
    /// `from` and `to`. Rows already appended are cast in place.
    fn widen_table(&mut self, name: &str, from: &Schema, to: &Schema) -> EngineResult<()>;

    /// Runs a query over the loaded tables
    fn run(&mut self, sql: &str) -> EngineResult<Table>;
}
