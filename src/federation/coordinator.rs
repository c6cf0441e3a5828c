// SPDX-License-Identifier: Apache-2.0

//! Execution coordinator
//!
//! Runs a [`SelectPlan`]:
//! 1. Fetch steps without dependencies start at once, each in its own task;
//!    page requests share a process-wide in-flight limit
//! 2. Every page is typed against the step's pinned schema, filtered by the
//!    step's residual and forwarded as it arrives: straight to the result set
//!    for pass-through plans, otherwise to the local-stage worker
//! 3. When a semi-join driver completes, its distinct keys narrow the fetch
//!    of the dependent step
//! 4. Once every input is loaded the worker runs the local SQL
//!
//! A failing step aborts the query: the remaining fetch tasks are shut down
//! before the error reaches the result set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Instrument};

use waveql_core::error::{EngineError, EngineResult};
use waveql_core::predicate::{Literal, Predicate};
use waveql_core::schema::{diff, infer, widen_to_fit, EvolutionStrategy};
use waveql_core::traits::{FetchRequest, LocalEngine, SourceTransport};
use waveql_core::types::{QueryId, Row, Schema, Table, TableKey};
use waveql_core::SchemaRegistry;
use waveql_query::DirectProjection;
use waveql_sql::translate;

use super::duckdb_engine::DuckDbEngine;
use super::planner::coerce_key;
use super::types::{
    column_value, ExecutionSummary, Finish, SelectPlan, SourceFetchStep, StepSummary, StreamEvent,
};
use crate::catalog::SourceCatalog;
use crate::config::FederationConfig;
use crate::cursor::ResultSet;
use crate::metrics;

struct FetchPermits {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl FetchPermits {
    fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }
}

static FETCH_PERMITS: OnceLock<FetchPermits> = OnceLock::new();
static LIMIT_MISMATCH_REPORTED: AtomicBool = AtomicBool::new(false);

/// Installs the process-wide in-flight fetch limit. Returns `false` when a
/// limit is already installed; it cannot change afterwards.
pub fn init_fetch_limit(limit: usize) -> bool {
    let mut installed = false;
    FETCH_PERMITS.get_or_init(|| {
        installed = true;
        FetchPermits::new(limit)
    });
    installed
}

/// The installed in-flight fetch limit, if any query has run yet.
pub fn fetch_limit() -> Option<usize> {
    FETCH_PERMITS.get().map(|p| p.limit)
}

/// In-flight page fetches across every query of the process. Sized by
/// [`init_fetch_limit`], or else by the first connection that fetches.
pub(crate) fn fetch_permits(requested: usize) -> Arc<Semaphore> {
    let permits = FETCH_PERMITS.get_or_init(|| FetchPermits::new(requested));
    if permits.limit != requested.max(1) && !LIMIT_MISMATCH_REPORTED.swap(true, Ordering::Relaxed) {
        warn!(
            installed = permits.limit,
            requested,
            "max_in_flight_fetches differs from the process-wide limit; the installed limit applies"
        );
    }
    permits.semaphore.clone()
}

/// Everything a running query needs from its connection.
#[derive(Clone)]
pub struct ExecContext {
    pub catalog: Arc<SourceCatalog>,
    pub registry: Arc<SchemaRegistry>,
    pub config: FederationConfig,
}

/// Starts `plan` and returns its result set once the output columns are known.
#[instrument(skip(plan, ctx), fields(steps = plan.steps.len()))]
pub async fn execute(plan: Arc<SelectPlan>, ctx: ExecContext) -> EngineResult<ResultSet> {
    let query_id = QueryId::new();
    let cancel = CancellationToken::new();
    let (sender, receiver) = mpsc::channel(ctx.config.stream_buffer.max(1));

    let task_cancel = cancel.clone();
    let span = tracing::info_span!("federated_query", %query_id);
    tokio::spawn(
        async move {
            let start = Instant::now();
            let query_timeout = ctx.config.query_timeout_ms;
            let outcome = tokio::select! {
                _ = task_cancel.cancelled() => Err(EngineError::Cancelled),
                result = timeout(ctx.config.query_timeout(), run(&plan, &ctx, &sender, query_id)) => {
                    result.unwrap_or(Err(EngineError::Timeout { timeout_ms: query_timeout }))
                }
            };
            // Anything still running belongs to an abandoned query.
            task_cancel.cancel();

            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            match outcome {
                Ok(mut summary) => {
                    summary.total_time_ms = elapsed_ms;
                    metrics::record_query(elapsed_ms, true);
                    debug!(elapsed_ms, "federated query finished");
                    let _ = sender.send(StreamEvent::Done(Box::new(summary))).await;
                }
                Err(error) => {
                    match &error {
                        EngineError::Cancelled => metrics::record_cancel(),
                        EngineError::Timeout { .. } => metrics::record_timeout(),
                        _ => {}
                    }
                    metrics::record_query(elapsed_ms, false);
                    warn!(error = %error, "federated query failed");
                    let _ = sender.send(StreamEvent::Error(error)).await;
                }
            }
        }
        .instrument(span),
    );

    ResultSet::open(receiver, cancel).await
}

/// Page traffic from fetch tasks to the coordinator. `Done` is the last
/// message of a step, so every page of a step precedes it.
enum FetchEvent {
    /// `schema` is the step schema the rows were typed against; it only
    /// differs from the planned one after a mid-fetch widening.
    Page {
        step: usize,
        schema: Arc<Schema>,
        rows: Vec<Row>,
    },
    Done(StepSummary),
}

/// Where fetched rows go.
enum Sink {
    Direct(DirectProjection),
    Local(LocalWorker),
}

async fn run(
    plan: &SelectPlan,
    ctx: &ExecContext,
    out: &mpsc::Sender<StreamEvent>,
    query_id: QueryId,
) -> EngineResult<ExecutionSummary> {
    let mut summary = ExecutionSummary::new(query_id);

    let mut sink = match &plan.finish {
        Finish::PassThrough(projection) => {
            emit(out, StreamEvent::Columns(Arc::new(projection.schema()))).await?;
            Sink::Direct(projection.clone())
        }
        Finish::Local(_) => {
            let worker = LocalWorker::spawn(ctx.config.stream_buffer);
            for step in &plan.steps {
                worker.load(&step.local_table, step.schema.clone()).await?;
            }
            Sink::Local(worker)
        }
    };

    let transports = plan
        .steps
        .iter()
        .map(|s| ctx.catalog.get(&s.source_id))
        .collect::<EngineResult<Vec<_>>>()?;

    let (events, mut inbox) = mpsc::channel::<FetchEvent>(ctx.config.stream_buffer.max(1));
    let mut tasks = JoinSet::new();
    let mut keys = KeyCollector::new(plan);
    let mut schemas: Vec<Arc<Schema>> = plan.steps.iter().map(|s| s.schema.clone()).collect();

    for step in plan.steps.iter().filter(|s| s.semi_join.is_none()) {
        spawn_fetch(&mut tasks, step, step.request.clone(), step.residual.clone(), &transports, ctx, &events);
    }

    let mut remaining = plan.steps.len();
    while remaining > 0 {
        tokio::select! {
            event = inbox.recv() => match event {
                Some(FetchEvent::Page { step, schema, rows }) => {
                    if !Arc::ptr_eq(&schema, &schemas[step]) {
                        widen(&mut sink, &plan.steps[step], &schemas[step], &schema, out).await?;
                        schemas[step] = schema;
                    }
                    keys.collect(plan, step, &rows);
                    deliver(&mut sink, &plan.steps[step], &schemas[step], rows, out).await?;
                }
                Some(FetchEvent::Done(step_summary)) => {
                    if step_summary.row_limit_hit {
                        summary.warnings.push(format!(
                            "Source '{}.{}' returned the maximum {} rows. Results may be incomplete.",
                            step_summary.source_id, step_summary.table, step_summary.row_count
                        ));
                    }
                    let mut finished = vec![step_summary.step];
                    summary.steps.push(step_summary);
                    while let Some(driver) = finished.pop() {
                        remaining -= 1;
                        for target in plan.dependents(driver) {
                            match keys.restrict(target, &mut summary.warnings) {
                                Some((request, residual)) => {
                                    spawn_fetch(&mut tasks, target, request, residual, &transports, ctx, &events);
                                }
                                None => {
                                    debug!(table = %target.table, "semi-join produced no keys; fetch skipped");
                                    summary.steps.push(StepSummary {
                                        step: target.index,
                                        source_id: target.source_id.clone(),
                                        table: target.table.clone(),
                                        skipped: true,
                                        ..Default::default()
                                    });
                                    finished.push(target.index);
                                }
                            }
                        }
                    }
                }
                None => return Err(EngineError::internal("fetch channel closed")),
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let failure = match joined {
                    Ok(Ok(())) => None,
                    Ok(Err(error)) => Some(error),
                    Err(e) => Some(EngineError::internal(format!("Source fetch task panicked: {e}"))),
                };
                if let Some(error) = failure {
                    tasks.shutdown().await;
                    if let EngineError::Transport { source_id, message, retryable: false } = &error {
                        ctx.catalog.mark_failed(source_id, message.clone());
                    }
                    return Err(error);
                }
            }
        }
    }
    tasks.shutdown().await;
    summary.steps.sort_by_key(|s| s.step);

    if let (Finish::Local(stage), Sink::Local(worker)) = (&plan.finish, sink) {
        let start = Instant::now();
        let table = worker.run(stage.sql.clone()).await?;
        summary.local_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        emit(out, StreamEvent::Columns(table.schema.clone())).await?;
        for row in table.rows {
            emit(out, StreamEvent::Row(row)).await?;
        }
    }
    Ok(summary)
}

async fn emit(out: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> EngineResult<()> {
    // The receiver is gone only when the result set was dropped.
    out.send(event).await.map_err(|_| EngineError::Cancelled)
}

async fn deliver(
    sink: &mut Sink,
    step: &SourceFetchStep,
    schema: &Arc<Schema>,
    rows: Vec<Row>,
    out: &mpsc::Sender<StreamEvent>,
) -> EngineResult<()> {
    match sink {
        Sink::Direct(projection) => {
            for row in &rows {
                emit(out, StreamEvent::Row(projection.apply(row))).await?;
            }
            Ok(())
        }
        Sink::Local(worker) => worker.append(&step.local_table, schema.clone(), rows).await,
    }
}

/// Carries a widened step schema downstream: the temp table is retyped, or
/// the result set gets a new description. Rows already streamed keep their
/// values.
async fn widen(
    sink: &mut Sink,
    step: &SourceFetchStep,
    from: &Arc<Schema>,
    to: &Arc<Schema>,
    out: &mpsc::Sender<StreamEvent>,
) -> EngineResult<()> {
    match sink {
        Sink::Direct(projection) => {
            projection.retype(to);
            emit(out, StreamEvent::Columns(Arc::new(projection.schema()))).await
        }
        Sink::Local(worker) => worker.widen(&step.local_table, from.clone(), to.clone()).await,
    }
}

fn spawn_fetch(
    tasks: &mut JoinSet<EngineResult<()>>,
    step: &SourceFetchStep,
    request: FetchRequest,
    residual: Option<Predicate>,
    transports: &[Arc<dyn SourceTransport>],
    ctx: &ExecContext,
    events: &mpsc::Sender<FetchEvent>,
) {
    let fetch = StepFetch {
        index: step.index,
        source_id: step.source_id.clone(),
        table: step.table.clone(),
        request,
        residual,
        schema: step.schema.clone(),
        joined: step.is_joined(),
        observe: step.observe.clone(),
        row_limit: step.row_limit,
    };
    let transport = transports[step.index].clone();
    let registry = ctx.registry.clone();
    let config = ctx.config.clone();
    let events = events.clone();
    tasks.spawn(async move { fetch.run(transport, registry, config, events).await });
}

/// One step's fetch, owned by its task.
struct StepFetch {
    index: usize,
    source_id: String,
    table: String,
    request: FetchRequest,
    residual: Option<Predicate>,
    schema: Arc<Schema>,
    joined: bool,
    observe: Option<TableKey>,
    row_limit: Option<u64>,
}

impl StepFetch {
    #[instrument(skip_all, fields(source_id = %self.source_id, table = %self.table))]
    async fn run(
        self,
        transport: Arc<dyn SourceTransport>,
        registry: Arc<SchemaRegistry>,
        config: FederationConfig,
        events: mpsc::Sender<FetchEvent>,
    ) -> EngineResult<()> {
        let start = Instant::now();
        let permits = fetch_permits(config.max_in_flight_fetches);
        let mut token: Option<String> = None;
        let mut pages = 0u64;
        let mut row_count = 0u64;
        let mut fetched = 0u64;
        let mut row_limit_hit = false;
        let mut schema = self.schema.clone();

        loop {
            let page = {
                let _permit = permits
                    .acquire()
                    .await
                    .map_err(|_| EngineError::internal("fetch semaphore closed"))?;
                timeout(config.fetch_timeout(), transport.fetch(&self.request, token.as_deref()))
                    .await
                    .map_err(|_| EngineError::Timeout {
                        timeout_ms: config.fetch_timeout_ms,
                    })?
                    .map_err(|e| self.attribute(e))?
            };
            pages += 1;
            fetched += page.records.len() as u64;

            // A projected page must not replace the full table schema.
            let observable = self.request.columns.is_empty() || registry.strategy() != EvolutionStrategy::Replace;
            if pages == 1 && observable {
                if let Some(key) = &self.observe {
                    let observed = infer(&page.records, config.schema_sample_size);
                    let changes = registry.observe(key, &observed)?;
                    if !changes.is_empty() {
                        debug!(changes = changes.len(), "source schema changed");
                    }
                }
            }

            let mut rows = self.type_page(&page.records, &mut schema, &registry, observable)?;
            if let Some(residual) = &self.residual {
                rows.retain(|row| residual.matches(&|c| column_value(&schema, self.joined, row, c)));
            }

            if let Some(limit) = self.row_limit {
                let room = limit.saturating_sub(row_count) as usize;
                // Reaching the limit exactly is only a truncation if the source has more.
                if rows.len() > room || (rows.len() == room && page.next_page.is_some()) {
                    rows.truncate(room);
                    row_limit_hit = true;
                }
            }
            row_count += rows.len() as u64;
            metrics::record_page(rows.len() as u64);

            if !rows.is_empty() {
                events
                    .send(FetchEvent::Page {
                        step: self.index,
                        schema: schema.clone(),
                        rows,
                    })
                    .await
                    .map_err(|_| EngineError::Cancelled)?;
            }

            let exhausted = self.request.limit.is_some_and(|limit| fetched >= limit);
            match page.next_page {
                Some(next) if !row_limit_hit && !exhausted => token = Some(next),
                _ => break,
            }
        }

        if row_limit_hit {
            warn!(rows = row_count, "row limit reached; fetch stopped");
        }
        debug!(pages, rows = row_count, "fetch finished");
        events
            .send(FetchEvent::Done(StepSummary {
                step: self.index,
                source_id: self.source_id.clone(),
                table: self.table.clone(),
                pages,
                row_count,
                fetch_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                skipped: false,
                row_limit_hit,
            }))
            .await
            .map_err(|_| EngineError::Cancelled)
    }

    /// Types one page of records.
    ///
    /// A record that does not fit the schema is a drift the pinned sample
    /// missed. Under `Strict` that is an error listing what the record
    /// changes; otherwise the affected columns are widened, the widening is
    /// published, and the page is typed again.
    fn type_page(
        &self,
        records: &[serde_json::Value],
        schema: &mut Arc<Schema>,
        registry: &SchemaRegistry,
        observable: bool,
    ) -> EngineResult<Vec<Row>> {
        'page: loop {
            let mut rows = Vec::with_capacity(records.len());
            for record in records {
                let reason = match Row::from_record(record, &**schema) {
                    Ok(row) => {
                        rows.push(row);
                        continue;
                    }
                    Err(reason) => reason,
                };

                let widened = widen_to_fit(&**schema, record);
                let changes = diff(&**schema, &widened);
                if changes.is_empty() {
                    return Err(EngineError::query_error(format!(
                        "'{}.{}' returned a record that cannot be typed: {reason}",
                        self.source_id, self.table
                    )));
                }
                if registry.strategy() == EvolutionStrategy::Strict {
                    warn!(error = %reason, "record does not match the pinned schema");
                    return Err(EngineError::schema_evolution(&self.source_id, &self.table, changes));
                }

                debug!(changes = changes.len(), error = %reason, "schema widened mid-fetch");
                if observable {
                    if let Some(key) = &self.observe {
                        registry.observe(key, &widened)?;
                    }
                }
                *schema = Arc::new(widened);
                continue 'page;
            }
            return Ok(rows);
        }
    }

    /// Transports report their kind; errors name the source id instead.
    fn attribute(&self, error: EngineError) -> EngineError {
        match error {
            EngineError::Transport { message, retryable, .. } => EngineError::Transport {
                source_id: self.source_id.clone(),
                message,
                retryable,
            },
            other => other,
        }
    }
}

/// Distinct join keys collected for each semi-join target, in first-seen order.
struct KeyCollector {
    targets: HashMap<usize, TargetKeys>,
}

struct TargetKeys {
    values: Vec<Literal>,
    seen: HashSet<String>,
    overflow: bool,
}

impl KeyCollector {
    fn new(plan: &SelectPlan) -> Self {
        let targets = plan
            .steps
            .iter()
            .filter(|s| s.semi_join.is_some())
            .map(|s| {
                let keys = TargetKeys {
                    values: Vec::new(),
                    seen: HashSet::new(),
                    overflow: false,
                };
                (s.index, keys)
            })
            .collect();
        Self { targets }
    }

    fn collect(&mut self, plan: &SelectPlan, step: usize, rows: &[Row]) {
        let driver = &plan.steps[step];
        for target in plan.dependents(step) {
            let (Some(join), Some(keys)) = (&target.semi_join, self.targets.get_mut(&target.index)) else {
                continue;
            };
            if keys.overflow {
                continue;
            }
            for row in rows {
                let Some(literal) = driver
                    .value_of(row, &join.driver_column)
                    .filter(|v| !v.is_null())
                    .and_then(Literal::from_value)
                else {
                    continue;
                };
                if keys.seen.insert(format!("{literal:?}")) {
                    if keys.values.len() == target.capability.max_in_list {
                        keys.overflow = true;
                        keys.values.clear();
                        break;
                    }
                    keys.values.push(literal);
                }
            }
        }
    }

    /// Request and residual of `target` narrowed to the driver's keys, or
    /// `None` when there are no keys and the fetch can be skipped. Too many
    /// keys fall back to the planned fetch.
    fn restrict(
        &self,
        target: &SourceFetchStep,
        warnings: &mut Vec<String>,
    ) -> Option<(FetchRequest, Option<Predicate>)> {
        let join = target.semi_join.as_ref()?;
        let keys = self.targets.get(&target.index)?;
        if keys.overflow {
            let message = format!(
                "Semi-join into '{}.{}' skipped: more than {} distinct keys; the full table was fetched",
                target.source_id, target.table, target.capability.max_in_list
            );
            warn!("{message}");
            warnings.push(message);
            return Some((target.request.clone(), target.residual.clone()));
        }
        if keys.values.is_empty() {
            return None;
        }

        let values = keys
            .values
            .iter()
            .map(|k| coerce_key(k, &join.target_type))
            .collect();
        let key_filter = Predicate::In {
            column: join.target_column.clone(),
            values,
        };
        let filter = Predicate::conjoin(join.base_filter.iter().cloned().chain([key_filter]).collect())?;
        let translated = translate(&filter, &target.capability);
        let mut request = target.request.clone();
        request.fragment = translated.fragment().cloned();
        request.filter = translated.pushed_predicate().cloned();
        debug!(table = %target.table, keys = keys.values.len(), "semi-join keys pushed");
        Some((request, translated.residual))
    }
}

enum LocalCommand {
    Load {
        table: String,
        schema: Arc<Schema>,
    },
    Append {
        table: String,
        schema: Arc<Schema>,
        rows: Vec<Row>,
    },
    Widen {
        table: String,
        from: Arc<Schema>,
        to: Arc<Schema>,
    },
    Run {
        sql: String,
        reply: oneshot::Sender<EngineResult<Table>>,
    },
}

/// Blocking thread owning the query's DuckDB instance. The engine (and all
/// temp tables) is dropped when the worker's channel closes.
struct LocalWorker {
    commands: mpsc::Sender<LocalCommand>,
}

impl LocalWorker {
    fn spawn(buffer: usize) -> Self {
        let (commands, mut inbox) = mpsc::channel::<LocalCommand>(buffer.max(1));
        tokio::task::spawn_blocking(move || {
            let mut engine = DuckDbEngine::new();
            // The first failure is reported when the local SQL is requested.
            while let Some(command) = inbox.blocking_recv() {
                match command {
                    LocalCommand::Load { table, schema } => {
                        if let Ok(duck) = engine.as_mut() {
                            if let Err(e) = duck.load_table(&table, &schema) {
                                engine = Err(e);
                            }
                        }
                    }
                    LocalCommand::Append { table, schema, rows } => {
                        if let Ok(duck) = engine.as_mut() {
                            if let Err(e) = duck.append_rows(&table, &schema, &rows) {
                                engine = Err(e);
                            }
                        }
                    }
                    LocalCommand::Widen { table, from, to } => {
                        if let Ok(duck) = engine.as_mut() {
                            if let Err(e) = duck.widen_table(&table, &from, &to) {
                                engine = Err(e);
                            }
                        }
                    }
                    LocalCommand::Run { sql, reply } => {
                        let result = match engine.as_mut() {
                            Ok(duck) => duck.run(&sql),
                            Err(e) => Err(e.clone()),
                        };
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
        });
        Self { commands }
    }

    async fn send(&self, command: LocalCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::internal("local stage worker stopped"))
    }

    async fn load(&self, table: &str, schema: Arc<Schema>) -> EngineResult<()> {
        self.send(LocalCommand::Load {
            table: table.to_string(),
            schema,
        })
        .await
    }

    async fn append(&self, table: &str, schema: Arc<Schema>, rows: Vec<Row>) -> EngineResult<()> {
        self.send(LocalCommand::Append {
            table: table.to_string(),
            schema,
            rows,
        })
        .await
    }

    async fn widen(&self, table: &str, from: Arc<Schema>, to: Arc<Schema>) -> EngineResult<()> {
        self.send(LocalCommand::Widen {
            table: table.to_string(),
            from,
            to,
        })
        .await
    }

    async fn run(self, sql: String) -> EngineResult<Table> {
        let (reply, result) = oneshot::channel();
        self.send(LocalCommand::Run { sql, reply }).await?;
        result
            .await
            .map_err(|_| EngineError::internal("local stage task panicked"))?
    }
}
