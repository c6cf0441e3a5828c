// SPDX-License-Identifier: Apache-2.0

//! Connections
//!
//! A [`Connection`] owns the source catalog, the schema registry and the
//! statement cache. Queries go through three stages:
//! `prepare` (SQL → compiled statement, cached), `plan` (schemas and
//! capabilities → [`Plan`]) and `execute` (plan → [`ResultSet`]).

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, instrument};

use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::Literal;
use waveql_core::schema::SchemaRegistry;
use waveql_core::traits::{FetchRequest, SourceTransport};
use waveql_core::types::{Schema, TableKey};
use waveql_sql::ast::{CompiledQuery, Statement, TableRef};
use waveql_sql::{ParameterizedQuery, StatementCache};

use crate::catalog::{SourceCatalog, SourceInfo};
use crate::config::FederationConfig;
use crate::cursor::ResultSet;
use crate::federation::coordinator::{self, ExecContext};
use crate::federation::planner::{self, PlanContext};
use crate::federation::types::Plan;

pub struct Connection {
    catalog: Arc<SourceCatalog>,
    registry: Arc<SchemaRegistry>,
    statements: StatementCache,
    config: FederationConfig,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(config: FederationConfig) -> Self {
        let registry = SchemaRegistry::new(config.evolution, config.schema_sample_size)
            .with_ttl(config.schema_ttl());
        Self {
            catalog: Arc::new(SourceCatalog::new()),
            registry: Arc::new(registry),
            statements: StatementCache::new(config.statement_cache_size),
            config,
            closed: AtomicBool::new(false),
        }
    }

    /// Shares a schema registry between connections.
    pub fn with_registry(mut self, registry: Arc<SchemaRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_source(self, id: impl Into<String>, transport: Arc<dyn SourceTransport>) -> Self {
        self.register_source(id, transport);
        self
    }

    pub fn register_source(&self, id: impl Into<String>, transport: Arc<dyn SourceTransport>) {
        let id = id.into();
        info!(source_id = %id, kind = transport.source_kind(), "source registered");
        // Cached schemas may describe a different transport registered under the same id.
        self.registry.invalidate_source(&id);
        self.catalog.register(id, transport);
    }

    pub fn set_default_source(&self, id: &str) -> EngineResult<()> {
        self.catalog.set_default(id)
    }

    pub fn config(&self) -> &FederationConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        self.catalog.list()
    }

    /// Clears the failed mark of a source after an unrecoverable error.
    pub fn reset_source(&self, id: &str) -> bool {
        self.catalog.reset(id)
    }

    /// Compiles `sql`, reusing the cached statement when the text was seen before.
    pub fn prepare(&self, sql: &str) -> EngineResult<Arc<CompiledQuery>> {
        self.ensure_open()?;
        self.statements.get_or_compile(sql)
    }

    /// Tokenizes a statement with `?` parameters, reusing the cached template.
    pub fn prepare_parameterized(&self, sql: &str) -> EngineResult<Arc<ParameterizedQuery>> {
        self.ensure_open()?;
        self.statements.get_or_parameterize(sql)
    }

    /// Plans a compiled statement, sampling the schema of every table that is
    /// not cached yet.
    #[instrument(skip(self, compiled), fields(kind = compiled.statement.kind()))]
    pub async fn plan(&self, compiled: &CompiledQuery) -> EngineResult<Plan> {
        self.ensure_open()?;
        let mut ctx = PlanContext {
            default_source: self.catalog.default_source(),
            capabilities: self.catalog.capabilities(),
            schemas: HashMap::new(),
            row_limit_per_source: self.config.row_limit_per_source,
        };

        let mut listed: HashMap<String, Vec<String>> = HashMap::new();
        for (table, required) in tables_of(&compiled.statement) {
            let source_id = ctx.source_for(table)?;
            let transport = self.catalog.get(&source_id)?;
            if !listed.contains_key(&source_id) {
                let tables = transport.list_tables().await?;
                listed.insert(source_id.clone(), tables);
            }
            let known = &listed[&source_id];
            if !known.is_empty() && !known.iter().any(|t| t == &table.table) {
                return Err(EngineError::query_error(format!(
                    "unknown table '{}.{}'",
                    source_id, table.table
                )));
            }

            let key = TableKey::new(&source_id, &table.table);
            if ctx.schemas.contains_key(&key) {
                continue;
            }
            let schema = match self.registry.get(&key) {
                Some(schema) => Some(schema),
                None if required => Some(self.seed_schema(transport.as_ref(), &key).await?),
                None => None,
            };
            if let Some(schema) = schema {
                ctx.schemas.insert(key, schema);
            }
        }

        let plan = planner::plan(compiled, &ctx)?;
        debug!(plan = %plan, "planned");
        Ok(plan)
    }

    /// Runs a plan. Writes complete before this returns; selects return as
    /// soon as the output columns are known and stream their rows.
    #[instrument(skip(self, plan), fields(write = plan.is_write()))]
    pub async fn execute(&self, plan: &Plan) -> EngineResult<ResultSet> {
        self.ensure_open()?;
        match plan {
            Plan::Write(write) => {
                let transport = self.catalog.get(&write.source_id)?;
                let affected = timeout(self.config.fetch_timeout(), transport.write(&write.request))
                    .await
                    .map_err(|_| EngineError::Timeout {
                        timeout_ms: self.config.fetch_timeout_ms,
                    })?
                    .map_err(|e| {
                        if let EngineError::Transport { message, retryable: false, .. } = &e {
                            self.catalog.mark_failed(&write.source_id, message.clone());
                        }
                        e
                    })?;
                debug!(affected, "write applied");
                Ok(ResultSet::from_write(affected))
            }
            Plan::Select(select) => {
                let ctx = ExecContext {
                    catalog: self.catalog.clone(),
                    registry: self.registry.clone(),
                    config: self.config.clone(),
                };
                coordinator::execute(select.clone(), ctx).await
            }
        }
    }

    /// Prepare, plan and execute in one call.
    pub async fn query(&self, sql: &str) -> EngineResult<ResultSet> {
        let compiled = self.prepare(sql)?;
        let plan = self.plan(&compiled).await?;
        self.execute(&plan).await
    }

    /// Like [`Connection::query`], with `params` bound to the `?` slots in order.
    /// Binding happens before planning; the cached template keeps its slots.
    pub async fn query_with(&self, sql: &str, params: &[Literal]) -> EngineResult<ResultSet> {
        let compiled = self.prepare_parameterized(sql)?.bind(params)?;
        let plan = self.plan(&compiled).await?;
        self.execute(&plan).await
    }

    /// Runs one write statement once per parameter set and returns the total
    /// affected row count.
    #[instrument(skip(self, param_sets), fields(sets = param_sets.len()))]
    pub async fn execute_many(&self, sql: &str, param_sets: &[Vec<Literal>]) -> EngineResult<u64> {
        let template = self.prepare_parameterized(sql)?;
        let mut affected = 0;
        for params in param_sets {
            let compiled = template.bind(params)?;
            if matches!(compiled.statement, Statement::Select(_)) {
                return Err(EngineError::query_error(
                    "execute_many runs INSERT, UPDATE or DELETE statements",
                ));
            }
            let plan = self.plan(&compiled).await?;
            affected += self.execute(&plan).await?.rowcount().unwrap_or(0);
        }
        Ok(affected)
    }

    /// EXPLAIN-style description of how `sql` would run.
    pub async fn explain(&self, sql: &str) -> EngineResult<String> {
        let compiled = self.prepare(sql)?;
        Ok(self.plan(&compiled).await?.to_string())
    }

    /// Drops the cached schema of one table; the next query samples it again.
    pub fn invalidate_schema(&self, source_id: &str, table: &str) -> bool {
        self.registry.invalidate(&TableKey::new(source_id, table))
    }

    pub async fn list_tables(&self, source_id: &str) -> EngineResult<Vec<String>> {
        self.catalog.get(source_id)?.list_tables().await
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.statements.clear();
            info!("connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::query_error("connection is closed"));
        }
        Ok(())
    }

    /// Samples up to `schema_seed_rows` records and publishes their schema.
    async fn seed_schema(&self, transport: &dyn SourceTransport, key: &TableKey) -> EngineResult<Arc<Schema>> {
        let request = FetchRequest::scan(key.table.as_str(), self.config.schema_seed_rows.max(1));
        let permits = coordinator::fetch_permits(self.config.max_in_flight_fetches);
        let _permit = permits
            .acquire()
            .await
            .map_err(|_| EngineError::internal("fetch semaphore closed"))?;
        let page = timeout(self.config.fetch_timeout(), transport.fetch(&request, None))
            .await
            .map_err(|_| EngineError::Timeout {
                timeout_ms: self.config.fetch_timeout_ms,
            })?
            .map_err(|e| match e {
                EngineError::Transport { message, retryable, .. } => EngineError::Transport {
                    source_id: key.source_id.to_string(),
                    message,
                    retryable,
                },
                other => other,
            })?;
        if page.records.is_empty() {
            return Err(EngineError::query_error(format!(
                "cannot infer the schema of '{key}': the source returned no records"
            )));
        }
        let records = &page.records[..page.records.len().min(self.config.schema_seed_rows.max(1))];
        let schema = self.registry.infer_and_publish(key.clone(), records);
        debug!(table = %key, columns = schema.len(), "schema inferred");
        Ok(schema)
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new(FederationConfig::default())
    }
}

/// Tables named by a statement, in order of appearance, with whether their
/// schema is needed to plan it.
fn tables_of(statement: &Statement) -> Vec<(&TableRef, bool)> {
    let mut seen = BTreeSet::new();
    let refs: Vec<(&TableRef, bool)> = match statement {
        Statement::Select(select) => select.tables().map(|t| (t, true)).collect(),
        Statement::Insert(insert) => vec![(&insert.table, insert.columns.is_empty())],
        Statement::Update(update) => vec![(&update.table, false)],
        Statement::Delete(delete) => vec![(&delete.table, false)],
    };
    refs.into_iter()
        .filter(|(t, _)| seen.insert((t.source.clone(), t.table.clone())))
        .collect()
}
