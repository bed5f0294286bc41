//! Route executor: bind, resolve dependencies, consult the cache, execute on
//! miss, persist, and slice.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use route_store::order::{check_sorted, concat, slice};
use route_store::{
    CacheRead, CancelFlag, EntryKey, HitSource, InvariantColumn, InvariantTokens, LookupRequest,
    MaterializeOutcome, MaterializeRequest, PagedCacheStore, RowWindow, SortKey, StoreError,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::binder::{bind, redact_raw, RawParams};
use crate::canonical::cache_key;
use crate::engine::QueryEngine;
use crate::error::{ErrorKind, RouteError, Stage, StageFailure};
use crate::metrics::ExecutorMetrics;
use crate::query::{build_query, referenced_placeholders};
use crate::registry::RouteRegistry;
use crate::resolver::CallStack;
use crate::route::{Dependency, DependencyMode, RouteDefinition};
use crate::ExecutorConfig;

/// One route run inside a request, in completion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub route_id: String,
    /// Alias the parent registered this run under; `None` for the requested route.
    pub alias: Option<String>,
    pub mode: Option<DependencyMode>,
    pub depth: usize,
    pub cache_hit: bool,
    pub used_cache: bool,
    pub rows: usize,
    pub elapsed: Duration,
}

/// Result of a top-level request.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub route_id: String,
    pub schema: SchemaRef,
    /// Rows inside the effective window.
    pub rows: RecordBatch,
    /// Rows matching the request before windowing.
    pub total_rows: usize,
    /// Effective offset after page snapping.
    pub offset: usize,
    /// Effective limit after page snapping.
    pub limit: Option<usize>,
    /// The cache was consulted for this route.
    pub used_cache: bool,
    /// Rows were served from cached pages.
    pub cache_hit: bool,
    pub call_sequence: Vec<CallRecord>,
    pub elapsed: Duration,
}

/// Output of one route run, top-level or dependency.
#[derive(Debug, Clone)]
pub(crate) struct RouteOutput {
    pub schema: SchemaRef,
    pub rows: RecordBatch,
    pub total_rows: usize,
    pub used_cache: bool,
    pub cache_hit: bool,
    pub hit_source: Option<HitSource>,
    /// Whether this run's materialization was committed, when it ran one.
    pub persisted: Option<bool>,
    pub cache_entry: Option<(EntryKey, InvariantTokens)>,
    pub call_sequence: Vec<CallRecord>,
}

/// Stage most recently entered by any run of a request, for timeout reports.
#[derive(Debug, Clone, Default)]
pub(crate) struct StageCell(Arc<AtomicU8>);

impl StageCell {
    const STAGES: [Stage; 8] = [
        Stage::Validate,
        Stage::Bind,
        Stage::ResolveDependencies,
        Stage::CacheLookup,
        Stage::Execute,
        Stage::Sort,
        Stage::Persist,
        Stage::Slice,
    ];

    fn set(&self, stage: Stage) {
        let idx = Self::STAGES
            .iter()
            .position(|candidate| *candidate == stage)
            .unwrap_or(0);
        self.0.store(idx as u8, Ordering::SeqCst);
    }

    fn get(&self) -> Stage {
        Self::STAGES
            .get(self.0.load(Ordering::SeqCst) as usize)
            .copied()
            .unwrap_or(Stage::Validate)
    }
}

/// Per-run call context threaded through dependency resolution.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    pub stack: CallStack,
    pub alias: Option<String>,
    pub mode: Option<DependencyMode>,
    pub cancel: CancelFlag,
    pub stage: StageCell,
}

impl Invocation {
    fn root(route_id: &str, cancel: CancelFlag) -> Self {
        Self {
            stack: CallStack::root(route_id),
            alias: None,
            mode: None,
            cancel,
            stage: StageCell::default(),
        }
    }

    pub(crate) fn nested(&self, stack: CallStack, dependency: &Dependency) -> Self {
        Self {
            stack,
            alias: Some(dependency.alias.clone()),
            mode: Some(dependency.mode),
            cancel: self.cancel.clone(),
            stage: self.stage.clone(),
        }
    }

    /// Materialized-path dependencies always go through the cache.
    fn force_cache(&self) -> bool {
        self.mode == Some(DependencyMode::MaterializedPath)
    }
}

/// Cancels in-flight materializations if the request future is dropped.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Effective cache settings of one route.
#[derive(Debug, Clone)]
pub(crate) struct CacheSettings {
    pub ttl: Duration,
    pub rows_per_page: usize,
    pub order_by: Vec<SortKey>,
    pub invariant_columns: Vec<InvariantColumn>,
}

/// Serves route requests.
#[derive(Debug, Clone)]
pub struct RouteExecutor {
    pub(crate) registry: Arc<RouteRegistry>,
    pub(crate) engine: Arc<dyn QueryEngine>,
    pub(crate) store: PagedCacheStore,
    pub(crate) config: ExecutorConfig,
    pub(crate) metrics: Arc<ExecutorMetrics>,
}

impl RouteExecutor {
    pub fn new(
        config: ExecutorConfig,
        registry: Arc<RouteRegistry>,
        engine: Arc<dyn QueryEngine>,
    ) -> Self {
        let store = PagedCacheStore::new(config.store_config());
        Self::with_store(config, registry, engine, store)
    }

    pub fn with_store(
        config: ExecutorConfig,
        registry: Arc<RouteRegistry>,
        engine: Arc<dyn QueryEngine>,
        store: PagedCacheStore,
    ) -> Self {
        Self {
            registry,
            engine,
            store,
            config,
            metrics: Arc::new(ExecutorMetrics::default()),
        }
    }

    pub fn metrics(&self) -> Arc<ExecutorMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn store(&self) -> &PagedCacheStore {
        &self.store
    }

    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Executes a registered route by id.
    pub async fn execute_route(
        &self,
        route_id: &str,
        params: RawParams,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<ExecutionResult, RouteError> {
        let Some(route) = self.registry.get(route_id) else {
            let err = RouteError::static_check(
                ErrorKind::Configuration,
                route_id,
                Stage::Validate,
                format!("route `{route_id}` is not registered"),
            );
            self.metrics.record_request();
            self.metrics.record_error(err.kind());
            return Err(err);
        };
        self.execute(&route, params, offset, limit).await
    }

    /// Executes `route` for one request.
    ///
    /// Dependencies resolve through the registry. The whole request,
    /// dependencies included, is bounded by the configured request timeout.
    pub async fn execute(
        &self,
        route: &RouteDefinition,
        params: RawParams,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<ExecutionResult, RouteError> {
        let started = Instant::now();
        self.metrics.record_request();
        let result = self.execute_inner(route, params, offset, limit, started).await;
        match &result {
            Ok(result) => {
                self.metrics.record_rows_returned(result.rows.num_rows());
            }
            Err(err) => {
                self.metrics.record_error(err.kind());
                warn!(
                    route_id = %err.route_id(),
                    kind = %err.kind(),
                    stage = %err.stage(),
                    elapsed_ms = err.elapsed().as_millis() as u64,
                    detail = %err.detail(),
                    "route request failed"
                );
            }
        }
        result
    }

    async fn execute_inner(
        &self,
        route: &RouteDefinition,
        params: RawParams,
        offset: Option<usize>,
        limit: Option<usize>,
        started: Instant,
    ) -> Result<ExecutionResult, RouteError> {
        route.validate()?;
        self.registry.check_graph(route)?;

        let requested = (offset.is_some() || limit.is_some())
            .then(|| RowWindow::new(offset.unwrap_or(0), limit));
        let window = requested.map(|window| match route.cache.rows_per_page {
            Some(page_rows) if route.cache.enforce_page_size != Some(false) => {
                window.snap_to_pages(page_rows)
            }
            _ => window,
        });

        let cancel = CancelFlag::new();
        let _cancel_guard = CancelOnDrop(cancel.clone());
        let call = Invocation::root(&route.id, cancel.clone());
        let stage = call.stage.clone();
        let summary = redact_raw(&params);
        let run = self.run_route(Arc::new(route.clone()), params, window, call);

        let output = if self.config.request_timeout.is_zero() {
            run.await?
        } else {
            match tokio::time::timeout(self.config.request_timeout, run).await {
                Ok(output) => output?,
                Err(_) => {
                    cancel.cancel();
                    self.metrics.record_timeout();
                    return Err(RouteError::from_failure(
                        StageFailure::timeout(self.config.request_timeout),
                        &route.id,
                        stage.get(),
                        started.elapsed(),
                        summary,
                    ));
                }
            }
        };

        let effective = window.unwrap_or_default();
        Ok(ExecutionResult {
            route_id: route.id.clone(),
            schema: output.schema,
            rows: output.rows,
            total_rows: output.total_rows,
            offset: effective.offset,
            limit: effective.limit,
            used_cache: output.used_cache,
            cache_hit: output.cache_hit,
            call_sequence: output.call_sequence,
            elapsed: started.elapsed(),
        })
    }

    pub(crate) fn cache_settings(&self, route: &RouteDefinition) -> CacheSettings {
        CacheSettings {
            ttl: route
                .cache
                .ttl_secs
                .map(Duration::from_secs)
                .unwrap_or(self.config.default_ttl),
            rows_per_page: route
                .cache
                .rows_per_page
                .unwrap_or(self.config.default_rows_per_page)
                .max(1),
            order_by: route.cache.order_by.clone(),
            invariant_columns: route
                .cache
                .invariant_filters
                .iter()
                .map(|filter| filter.column_mapping())
                .collect(),
        }
    }

    /// Runs one route (and, recursively, its dependencies).
    pub(crate) fn run_route<'a>(
        &'a self,
        route: Arc<RouteDefinition>,
        raw: RawParams,
        window: Option<RowWindow>,
        call: Invocation,
    ) -> BoxFuture<'a, Result<RouteOutput, RouteError>> {
        let span = info_span!(
            "route",
            route_id = %route.id,
            depth = call.stack.depth(),
            alias = call.alias.as_deref().unwrap_or("")
        );
        async move {
            let started = Instant::now();
            let fail = |stage: Stage, failure: StageFailure, summary: String| {
                RouteError::from_failure(failure, &route.id, stage, started.elapsed(), summary)
            };

            call.stage.set(Stage::Bind);
            let params = bind(&route, &raw)
                .map_err(|failure| fail(Stage::Bind, failure, redact_raw(&raw)))?;
            let summary = params.redacted_summary();

            call.stage.set(Stage::ResolveDependencies);
            let resolved = self
                .resolve_dependencies(&route, &params, &call, started)
                .await?;
            let mut call_sequence = resolved.call_sequence;

            let key = cache_key(&route, &params, &referenced_placeholders(&route.body));
            let caching = route.cache.enabled || call.force_cache();
            let settings = self.cache_settings(&route);
            let entry = EntryKey::new(route.id.clone(), key.base_key.clone());

            if caching {
                call.stage.set(Stage::CacheLookup);
                let hit = self
                    .lookup(&route, &entry, &key.tokens, &settings, window)
                    .await;
                if let Some(hit) = hit {
                    let record = call.record(&route.id, true, true, hit.total_rows, started);
                    call_sequence.push(record);
                    return Ok(RouteOutput {
                        schema: hit.schema,
                        rows: hit.rows,
                        total_rows: hit.total_rows,
                        used_cache: true,
                        cache_hit: true,
                        hit_source: Some(hit.source),
                        persisted: None,
                        cache_entry: Some((entry, key.tokens)),
                        call_sequence,
                    });
                }
            } else {
                self.metrics.record_bypass();
            }

            call.stage.set(Stage::Execute);
            let plan = build_query(&route, &params, &key.tokens)
                .map_err(|failure| fail(Stage::Execute, failure, summary.clone()))?;
            let mut session = self
                .engine
                .open_session(&route.id)
                .await
                .map_err(|err| {
                    let failure = StageFailure::engine("open query session", &err);
                    fail(Stage::Execute, failure, summary.clone())
                })?;
            self.metrics.record_engine_session();
            for (alias, table) in resolved.aliases {
                session.register_alias(&alias, table).map_err(|err| {
                    let failure = StageFailure::engine("register dependency alias", &err);
                    fail(Stage::Execute, failure, summary.clone())
                })?;
            }
            self.metrics.record_engine_execution();
            debug!(
                route_id = %route.id,
                sql = %plan.sql,
                bound = plan.bindings.len(),
                "executing route query"
            );
            let output = session
                .execute(&plan.sql, plan.bindings)
                .await
                .map_err(|err| {
                    let failure = StageFailure::engine("query failed", &err);
                    fail(Stage::Execute, failure, summary.clone())
                })?;
            drop(session);

            call.stage.set(Stage::Sort);
            let schema = output
                .batches
                .first()
                .map(RecordBatch::schema)
                .unwrap_or(output.schema);
            let batch = concat(&schema, &output.batches).map_err(|err| {
                fail(Stage::Sort, StageFailure::store("collect result rows", &err), summary.clone())
            })?;
            check_sorted(&batch, &settings.order_by)
                .map_err(|err| fail(Stage::Sort, ordering_failure(err), summary.clone()))?;

            let mut persisted = None;
            if caching {
                call.stage.set(Stage::Persist);
                let outcome = self
                    .persist(&route, entry.clone(), key.tokens.clone(), batch.clone(), &call)
                    .await
                    .map_err(|failure| fail(Stage::Persist, failure, summary.clone()))?;
                persisted = Some(outcome.committed);
            }

            call.stage.set(Stage::Slice);
            let total_rows = batch.num_rows();
            let rows = slice(&batch, window);
            call_sequence.push(call.record(&route.id, caching, false, total_rows, started));
            Ok(RouteOutput {
                schema,
                rows,
                total_rows,
                used_cache: caching,
                cache_hit: false,
                hit_source: None,
                persisted,
                cache_entry: caching.then(|| (entry, key.tokens)),
                call_sequence,
            })
        }
        .instrument(span)
        .boxed()
    }

    /// Probes the cache; any failure or doubt is a miss.
    async fn lookup(
        &self,
        route: &RouteDefinition,
        entry: &EntryKey,
        tokens: &InvariantTokens,
        settings: &CacheSettings,
        window: Option<RowWindow>,
    ) -> Option<route_store::CachedRows> {
        let request = LookupRequest {
            key: entry.clone(),
            tokens: tokens.clone(),
            invariant_columns: settings.invariant_columns.clone(),
            order_by: settings.order_by.clone(),
            window,
        };
        let store = self.store.clone();
        let read = tokio::task::spawn_blocking(move || store.lookup(&request)).await;
        match read {
            Ok(Ok(CacheRead::Hit(hit))) => {
                self.metrics.record_hit();
                info!(
                    route_id = %route.id,
                    base_key = %entry.base_key,
                    tokens = %tokens,
                    source = ?hit.source,
                    rows = hit.rows.num_rows(),
                    total_rows = hit.total_rows,
                    "route cache hit"
                );
                Some(hit)
            }
            Ok(Ok(CacheRead::Miss(reason))) => {
                self.metrics.record_miss(reason.as_str());
                info!(
                    route_id = %route.id,
                    base_key = %entry.base_key,
                    tokens = %tokens,
                    reason = reason.as_str(),
                    "route cache miss"
                );
                None
            }
            Ok(Err(err)) => {
                self.metrics.record_miss("error");
                warn!(route_id = %route.id, error = %err, "cache lookup failed; treating as miss");
                None
            }
            Err(err) => {
                self.metrics.record_miss("error");
                warn!(
                    route_id = %route.id,
                    error = %err,
                    "cache lookup task failed; treating as miss"
                );
                None
            }
        }
    }

    /// Persists `batch` as the page set for `tokens`.
    pub(crate) async fn persist(
        &self,
        route: &RouteDefinition,
        entry: EntryKey,
        tokens: InvariantTokens,
        batch: RecordBatch,
        call: &Invocation,
    ) -> Result<MaterializeOutcome, StageFailure> {
        let settings = self.cache_settings(route);
        let request = MaterializeRequest {
            key: entry,
            tokens,
            invariant_columns: settings.invariant_columns,
            order_by: settings.order_by,
            rows_per_page: settings.rows_per_page,
            ttl: settings.ttl,
            schema: batch.schema(),
            batches: vec![batch],
        };
        let store = self.store.clone();
        let cancel = call.cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || store.materialize(request, &cancel))
            .await
            .map_err(|err| {
                StageFailure::new(ErrorKind::Resource, "cache materialization did not complete")
                    .with_detail(err.to_string())
            })?
            .map_err(|err| StageFailure::store("persist cache pages", &err))?;
        self.metrics.record_materialization(outcome.committed);
        if !outcome.committed {
            info!(
                route_id = %route.id,
                set_id = %outcome.set_id,
                "materialization not committed; existing pages kept"
            );
        }
        Ok(outcome)
    }
}

impl Invocation {
    fn record(
        &self,
        route_id: &str,
        used_cache: bool,
        cache_hit: bool,
        rows: usize,
        started: Instant,
    ) -> CallRecord {
        CallRecord {
            route_id: route_id.to_string(),
            alias: self.alias.clone(),
            mode: self.mode,
            depth: self.stack.depth(),
            cache_hit,
            used_cache,
            rows,
            elapsed: started.elapsed(),
        }
    }
}

fn ordering_failure(err: StoreError) -> StageFailure {
    match err {
        StoreError::MissingColumn(column) => StageFailure::new(
            ErrorKind::Configuration,
            format!("order_by column `{column}` is not in the query result"),
        ),
        other => StageFailure::store("query returned rows out of declared order", &other),
    }
}
