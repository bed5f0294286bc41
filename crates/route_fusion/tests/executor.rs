//! Integration tests for the route executor.
//!
//! Test flow:
//! 1) Register routes over an in-memory `sales` table served by DataFusion.
//! 2) Execute requests against a fresh cache directory per test.
//! 3) Repeat, widen, or page requests to drive hits, misses and shard combination.
//! 4) Swap in misbehaving engines to drive failures.
//!
//! Verification:
//! - Hits return the same ordered rows a fresh execution would.
//! - Dependencies resolve in order and show up in the call sequence.
//! - Failures carry kind, route id and stage, and leave no cache entry behind.

mod common;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::arrow::array::{Float64Array, Int64Array};
use datafusion::arrow::datatypes::{DataType, Field, Schema};
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::TableProvider;
use datafusion::scalar::ScalarValue;
use route_fusion::{
    CachePolicy, DataFusionEngine, Dependency, DependencyMode, ErrorKind, ExecutorConfig,
    InvariantFilter, ParamSpec, ParamType, QueryEngine, QueryOutput, QuerySession, RawParams,
    RouteDefinition, Stage,
};
use route_store::SortKey;
use serde_json::json;
use tempfile::TempDir;

use common::{harness, i64_column, params, sales_batch, string_column, SALES};

fn daily_sales(cache: CachePolicy) -> RouteDefinition {
    RouteDefinition::new("daily_sales", "1", "SELECT * FROM sales")
        .param(ParamSpec::new("category", ParamType::list(ParamType::String)))
        .cache(cache)
}

fn sharded_policy() -> CachePolicy {
    CachePolicy::enabled(vec![SortKey::asc("day"), SortKey::asc("id")])
        .rows_per_page(2)
        .invariant(InvariantFilter::new("category", "category").case_insensitive())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invariant_shards_combine_into_sorted_hit() -> Result<()> {
    let h = harness(vec![daily_sales(sharded_policy())])?;

    let first = h
        .executor
        .execute_route("daily_sales", params(json!({"category": ["a"]})), None, None)
        .await?;
    assert!(!first.cache_hit);
    assert!(first.used_cache);
    assert_eq!(i64_column(&first.rows, "id")?, vec![1, 3, 6]);

    let second = h
        .executor
        .execute_route("daily_sales", params(json!({"category": ["b"]})), None, None)
        .await?;
    assert!(!second.cache_hit);
    assert_eq!(i64_column(&second.rows, "id")?, vec![2, 5, 7]);

    let combined = h
        .executor
        .execute_route(
            "daily_sales",
            params(json!({"category": ["a", "b"]})),
            None,
            None,
        )
        .await?;
    assert!(combined.cache_hit);
    assert!(combined.used_cache);
    assert_eq!(combined.total_rows, 6);
    assert_eq!(i64_column(&combined.rows, "id")?, vec![1, 2, 3, 5, 6, 7]);
    assert_eq!(i64_column(&combined.rows, "day")?, vec![1, 1, 2, 3, 3, 4]);
    assert_eq!(h.engine.executions(), 2);

    // Same request spelled differently: delimited string, reordered, mixed case.
    let respelled = h
        .executor
        .execute_route("daily_sales", params(json!({"category": "B , A"})), None, None)
        .await?;
    assert!(respelled.cache_hit);
    assert_eq!(i64_column(&respelled.rows, "id")?, vec![1, 2, 3, 5, 6, 7]);
    assert_eq!(h.engine.executions(), 2);

    let metrics = h.executor.metrics().snapshot();
    assert_eq!(metrics.requests, 4);
    assert_eq!(metrics.cache_hits, 2);
    assert_eq!(metrics.cache_misses, 2);
    assert_eq!(metrics.materializations, 2);
    assert_eq!(metrics.misses_by_reason.get("absent"), Some(&1));
    assert_eq!(metrics.misses_by_reason.get("uncovered"), Some(&1));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cached_rows_match_fresh_execution() -> Result<()> {
    let mut uncached = sharded_policy();
    uncached.enabled = false;
    let fresh_route = RouteDefinition {
        id: "daily_sales_live".to_string(),
        ..daily_sales(uncached)
    };
    let h = harness(vec![daily_sales(sharded_policy()), fresh_route])?;

    for category in [json!(["a"]), json!(["c"]), json!(["a", "c"])] {
        h.executor
            .execute_route("daily_sales", params(json!({"category": category})), None, None)
            .await?;
    }
    let cached = h
        .executor
        .execute_route("daily_sales", params(json!({"category": ["c", "a"]})), None, None)
        .await?;
    let fresh = h
        .executor
        .execute_route(
            "daily_sales_live",
            params(json!({"category": ["a", "c"]})),
            None,
            None,
        )
        .await?;

    assert!(cached.cache_hit);
    assert!(!fresh.used_cache);
    assert_eq!(i64_column(&cached.rows, "id")?, i64_column(&fresh.rows, "id")?);
    assert_eq!(
        string_column(&cached.rows, "category")?,
        string_column(&fresh.rows, "category")?
    );
    assert_eq!(h.executor.metrics().snapshot().cache_bypasses, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconstrained_request_serves_later_filtered_requests() -> Result<()> {
    let h = harness(vec![daily_sales(sharded_policy())])?;

    let all = h
        .executor
        .execute_route("daily_sales", RawParams::new(), None, None)
        .await?;
    assert!(!all.cache_hit);
    assert_eq!(all.total_rows, SALES.len());

    let filtered = h
        .executor
        .execute_route("daily_sales", params(json!({"category": ["c", "b"]})), None, None)
        .await?;
    assert!(filtered.cache_hit);
    assert_eq!(i64_column(&filtered.rows, "id")?, vec![2, 4, 5, 7]);
    assert_eq!(h.engine.executions(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn windows_snap_to_pages_and_repeat_identically() -> Result<()> {
    let paged = RouteDefinition::new("paged_sales", "1", "SELECT * FROM sales").cache(
        CachePolicy::enabled(vec![SortKey::asc("day"), SortKey::asc("id")]).rows_per_page(2),
    );
    let exact = RouteDefinition::new("exact_sales", "1", "SELECT * FROM sales").cache(
        CachePolicy::enabled(vec![SortKey::asc("day"), SortKey::asc("id")])
            .rows_per_page(2)
            .enforce_page_size(false),
    );
    let h = harness(vec![paged, exact])?;

    let first = h
        .executor
        .execute_route("paged_sales", RawParams::new(), Some(1), Some(2))
        .await?;
    assert!(!first.cache_hit);
    assert_eq!(first.offset, 0);
    assert_eq!(first.limit, Some(4));
    assert_eq!(first.total_rows, 7);
    assert_eq!(i64_column(&first.rows, "id")?, vec![1, 2, 3, 4]);

    let again = h
        .executor
        .execute_route("paged_sales", RawParams::new(), Some(1), Some(2))
        .await?;
    assert!(again.cache_hit);
    assert_eq!(i64_column(&again.rows, "id")?, i64_column(&first.rows, "id")?);
    assert_eq!(again.total_rows, first.total_rows);
    assert_eq!((again.offset, again.limit), (first.offset, first.limit));

    let tail = h
        .executor
        .execute_route("paged_sales", RawParams::new(), Some(5), Some(2))
        .await?;
    assert!(tail.cache_hit);
    assert_eq!((tail.offset, tail.limit), (4, Some(4)));
    assert_eq!(i64_column(&tail.rows, "id")?, vec![5, 6, 7]);

    let unsnapped = h
        .executor
        .execute_route("exact_sales", RawParams::new(), Some(1), Some(2))
        .await?;
    assert_eq!(unsnapped.offset, 1);
    assert_eq!(i64_column(&unsnapped.rows, "id")?, vec![2, 3]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relation_dependency_feeds_parent_query() -> Result<()> {
    let totals = RouteDefinition::new(
        "daily_totals",
        "1",
        "SELECT \"day\", sum(amount) AS total FROM sales WHERE category = $category GROUP BY \"day\"",
    )
    .param(ParamSpec::new("category", ParamType::String).required())
    .cache(CachePolicy::enabled(vec![SortKey::asc("day")]));
    let busy = RouteDefinition::new(
        "busy_days",
        "1",
        "SELECT \"day\", total FROM totals WHERE total >= $min_total",
    )
    .param(ParamSpec::new("category", ParamType::String).required())
    .param(ParamSpec::new("min_total", ParamType::Int).with_default(json!(0)))
    .cache(CachePolicy::enabled(vec![SortKey::asc("day")]))
    .depends_on(Dependency::relation("totals", "daily_totals").pass("category"));
    let h = harness(vec![totals, busy])?;

    let first = h
        .executor
        .execute_route(
            "busy_days",
            params(json!({"category": "a", "min_total": 30})),
            None,
            None,
        )
        .await?;
    assert_eq!(i64_column(&first.rows, "day")?, vec![2, 3]);
    assert_eq!(i64_column(&first.rows, "total")?, vec![30, 60]);
    assert_eq!(first.call_sequence.len(), 2);
    let dependency = &first.call_sequence[0];
    assert_eq!(dependency.route_id, "daily_totals");
    assert_eq!(dependency.alias.as_deref(), Some("totals"));
    assert_eq!(dependency.mode, Some(DependencyMode::Relation));
    assert_eq!(dependency.depth, 1);
    assert_eq!(dependency.rows, 3);
    assert!(!dependency.cache_hit);
    let root = &first.call_sequence[1];
    assert_eq!(root.route_id, "busy_days");
    assert_eq!(root.depth, 0);
    assert!(root.alias.is_none());

    let second = h
        .executor
        .execute_route(
            "busy_days",
            params(json!({"category": "a", "min_total": 50})),
            None,
            None,
        )
        .await?;
    assert!(!second.cache_hit);
    assert!(second.call_sequence[0].cache_hit);
    assert_eq!(i64_column(&second.rows, "day")?, vec![3]);
    assert_eq!(h.engine.executions(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn materialized_dependency_scans_cached_pages() -> Result<()> {
    let base = RouteDefinition::new("sales_rows", "1", "SELECT * FROM sales").cache(
        CachePolicy::enabled(vec![SortKey::asc("day"), SortKey::asc("id")]).rows_per_page(2),
    );
    let large = RouteDefinition::new(
        "large_sales",
        "1",
        "SELECT id, amount FROM sales_pages WHERE amount >= $min",
    )
    .param(ParamSpec::new("min", ParamType::Int).required())
    .depends_on(Dependency::materialized("sales_pages", "sales_rows"));
    let h = harness(vec![base, large])?;

    let first = h
        .executor
        .execute_route("large_sales", params(json!({"min": 50})), None, None)
        .await?;
    let mut ids = i64_column(&first.rows, "id")?;
    ids.sort_unstable();
    assert_eq!(ids, vec![5, 6, 7]);
    assert!(!first.used_cache);
    let dependency = &first.call_sequence[0];
    assert_eq!(dependency.mode, Some(DependencyMode::MaterializedPath));
    assert!(dependency.used_cache);
    assert!(!dependency.cache_hit);
    assert_eq!(h.engine.executions(), 2);

    let second = h
        .executor
        .execute_route("large_sales", params(json!({"min": 30})), None, None)
        .await?;
    let mut ids = i64_column(&second.rows, "id")?;
    ids.sort_unstable();
    assert_eq!(ids, vec![3, 4, 5, 6, 7]);
    assert!(second.call_sequence[0].cache_hit);
    assert_eq!(h.engine.executions(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dependency_cycles_fail_before_any_query() -> Result<()> {
    let a = RouteDefinition::new("route_a", "1", "SELECT * FROM b_rows")
        .depends_on(Dependency::relation("b_rows", "route_b"));
    let b = RouteDefinition::new("route_b", "1", "SELECT * FROM a_rows")
        .depends_on(Dependency::relation("a_rows", "route_a"));
    let h = harness(vec![a, b])?;

    let err = h
        .executor
        .execute_route("route_a", RawParams::new(), None, None)
        .await
        .expect_err("cycle");
    assert_eq!(err.kind(), ErrorKind::Recursion);
    assert!(!err.is_retryable());
    assert!(
        err.message().contains("route_a -> route_b -> route_a"),
        "{}",
        err.message()
    );
    assert_eq!(h.engine.sessions_opened(), 0);
    assert_eq!(h.engine.executions(), 0);
    assert_eq!(
        h.executor.metrics().snapshot().errors_by_kind.get("recursion"),
        Some(&1)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn materialized_chain_between_sharded_routes_is_rejected() -> Result<()> {
    let base = daily_sales(sharded_policy());
    let top = RouteDefinition::new("top_sales", "1", "SELECT * FROM base_rows")
        .param(ParamSpec::new("category", ParamType::list(ParamType::String)))
        .cache(sharded_policy())
        .depends_on(Dependency::materialized("base_rows", "daily_sales").pass("category"));
    let h = harness(vec![base, top])?;

    let err = h
        .executor
        .execute_route("top_sales", params(json!({"category": ["a"]})), None, None)
        .await
        .expect_err("restricted");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.stage(), Stage::Validate);
    assert_eq!(h.engine.executions(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn binding_failures_are_reported_before_execution() -> Result<()> {
    let route = RouteDefinition::new(
        "sales_column",
        "1",
        "SELECT * FROM sales WHERE \"day\" >= $from_day",
    )
    .param(ParamSpec::new("from_day", ParamType::Int).required())
    .param(ParamSpec::new("column", ParamType::Identifier));
    let h = harness(vec![route])?;

    let err = h
        .executor
        .execute_route("sales_column", RawParams::new(), None, None)
        .await
        .expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(err.stage(), Stage::Bind);
    assert_eq!(err.route_id(), "sales_column");

    let err = h
        .executor
        .execute_route(
            "sales_column",
            params(json!({"from_day": 2, "column": "id; DROP TABLE sales"})),
            None,
            None,
        )
        .await
        .expect_err("guard");
    assert_eq!(err.kind(), ErrorKind::Guard);
    assert!(!err.to_string().contains("DROP TABLE"));

    let err = h
        .executor
        .execute_route("no_such_route", RawParams::new(), None, None)
        .await
        .expect_err("unknown");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(h.engine.sessions_opened(), 0);
    Ok(())
}

/// Engine that ignores the query and returns fixed rows.
#[derive(Debug)]
struct FixedRowsEngine {
    batch: RecordBatch,
}

struct FixedRowsSession {
    batch: RecordBatch,
}

#[async_trait]
impl QueryEngine for FixedRowsEngine {
    async fn open_session(&self, _route_id: &str) -> Result<Box<dyn QuerySession>> {
        Ok(Box::new(FixedRowsSession {
            batch: self.batch.clone(),
        }))
    }
}

#[async_trait]
impl QuerySession for FixedRowsSession {
    fn register_alias(&mut self, _alias: &str, _table: Arc<dyn TableProvider>) -> Result<()> {
        Ok(())
    }

    async fn execute(
        &mut self,
        _sql: &str,
        _bound: Vec<(String, ScalarValue)>,
    ) -> Result<QueryOutput> {
        Ok(QueryOutput {
            schema: self.batch.schema(),
            batches: vec![self.batch.clone()],
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unordered_engine_output_is_a_constraint_error() -> Result<()> {
    common::init_tracing();
    let dir = TempDir::new().context("create temp dir")?;
    let engine = Arc::new(FixedRowsEngine {
        batch: sales_batch(SALES)?,
    });
    let ordered = RouteDefinition::new("daily_sales", "1", "SELECT * FROM sales").cache(
        CachePolicy::enabled(vec![SortKey::asc("day"), SortKey::asc("id")]),
    );
    let ranked = RouteDefinition::new("ranked_sales", "1", "SELECT * FROM sales")
        .cache(CachePolicy::enabled(vec![SortKey::asc("rank")]));
    let executor = common::executor_with(
        &dir,
        ExecutorConfig::for_cache_dir(dir.path()),
        vec![ordered, ranked],
        engine,
    )?;

    for _ in 0..2 {
        let err = executor
            .execute_route(
                "daily_sales",
                params(json!({"note": "private-note"})),
                None,
                None,
            )
            .await
            .expect_err("unsorted");
        assert_eq!(err.kind(), ErrorKind::Constraint);
        assert_eq!(err.stage(), Stage::Sort);
        assert_eq!(err.route_id(), "daily_sales");
        assert!(err.to_string().contains("note=string"));
        assert!(!err.to_string().contains("private-note"));
    }

    let err = executor
        .execute_route("ranked_sales", RawParams::new(), None, None)
        .await
        .expect_err("missing order column");
    assert_eq!(err.kind(), ErrorKind::Configuration);

    let metrics = executor.metrics().snapshot();
    assert_eq!(metrics.materializations, 0);
    assert_eq!(metrics.cache_hits, 0);
    assert_eq!(metrics.errors_by_kind.get("constraint"), Some(&2));
    Ok(())
}

/// Engine that stalls every query before delegating.
#[derive(Debug)]
struct StallingEngine {
    inner: Arc<dyn QueryEngine>,
    stall: Duration,
}

struct StallingSession {
    inner: Box<dyn QuerySession>,
    stall: Duration,
}

#[async_trait]
impl QueryEngine for StallingEngine {
    async fn open_session(&self, route_id: &str) -> Result<Box<dyn QuerySession>> {
        Ok(Box::new(StallingSession {
            inner: self.inner.open_session(route_id).await?,
            stall: self.stall,
        }))
    }
}

#[async_trait]
impl QuerySession for StallingSession {
    fn register_alias(&mut self, alias: &str, table: Arc<dyn TableProvider>) -> Result<()> {
        self.inner.register_alias(alias, table)
    }

    async fn execute(
        &mut self,
        sql: &str,
        bound: Vec<(String, ScalarValue)>,
    ) -> Result<QueryOutput> {
        tokio::time::sleep(self.stall).await;
        self.inner.execute(sql, bound).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_timeout_is_a_retryable_resource_error() -> Result<()> {
    common::init_tracing();
    let dir = TempDir::new().context("create temp dir")?;
    let route = || daily_sales(sharded_policy());
    let slow = common::executor_with(
        &dir,
        ExecutorConfig::for_cache_dir(dir.path()).with_request_timeout(Duration::from_millis(100)),
        vec![route()],
        Arc::new(StallingEngine {
            inner: Arc::new(common::sales_engine()?),
            stall: Duration::from_secs(5),
        }),
    )?;

    let err = slow
        .execute_route("daily_sales", params(json!({"category": ["a"]})), None, None)
        .await
        .expect_err("timeout");
    assert_eq!(err.kind(), ErrorKind::Resource);
    assert!(err.is_retryable());
    assert_eq!(err.stage(), Stage::Execute);
    assert_eq!(slow.metrics().snapshot().timeouts, 1);

    // Nothing was persisted: a healthy executor on the same cache still misses.
    let healthy = common::executor_with(
        &dir,
        ExecutorConfig::for_cache_dir(dir.path()),
        vec![route()],
        Arc::new(common::sales_engine()?),
    )?;
    let result = healthy
        .execute_route("daily_sales", params(json!({"category": ["a"]})), None, None)
        .await?;
    assert!(!result.cache_hit);
    assert_eq!(i64_column(&result.rows, "id")?, vec![1, 3, 6]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_share_one_entry() -> Result<()> {
    let h = harness(vec![daily_sales(sharded_policy())])?;
    let executor = Arc::new(h.executor);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let executor = Arc::clone(&executor);
        tasks.push(tokio::spawn(async move {
            executor
                .execute_route("daily_sales", params(json!({"category": ["b"]})), None, None)
                .await
        }));
    }
    for task in tasks {
        let result = task.await.context("join request")??;
        assert_eq!(i64_column(&result.rows, "id")?, vec![2, 5, 7]);
    }

    let after = executor
        .execute_route("daily_sales", params(json!({"category": ["b"]})), None, None)
        .await?;
    assert!(after.cache_hit);
    let text = executor.metrics().render_text();
    assert!(text.contains("route_requests=5\n"), "{text}");
    Ok(())
}

/// Float invariant values are matched against the column as DataFusion renders it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn float_invariant_filters_match_integral_prices() -> Result<()> {
    common::init_tracing();
    let dir = TempDir::new().context("create temp dir")?;
    let schema = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("price", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        Arc::clone(&schema),
        vec![
            Arc::new(Int64Array::from(vec![1, 2, 3])),
            Arc::new(Float64Array::from(vec![2.0, 2.5, 2.0])),
        ],
    )?;
    let engine = Arc::new(DataFusionEngine::new(2).with_batches("prices", schema, vec![batch])?);
    let prices = RouteDefinition::new("prices", "1", "SELECT * FROM prices")
        .param(ParamSpec::new("price", ParamType::list(ParamType::Float)))
        .cache(
            CachePolicy::enabled(vec![SortKey::asc("id")])
                .rows_per_page(2)
                .invariant(InvariantFilter::new("price", "price")),
        );
    let executor = common::executor_with(
        &dir,
        ExecutorConfig::for_cache_dir(dir.path()),
        vec![prices],
        engine,
    )?;

    let integral = executor
        .execute_route("prices", params(json!({"price": [2.0]})), None, None)
        .await?;
    assert_eq!(i64_column(&integral.rows, "id")?, vec![1, 3]);
    let fractional = executor
        .execute_route("prices", params(json!({"price": [2.5]})), None, None)
        .await?;
    assert_eq!(i64_column(&fractional.rows, "id")?, vec![2]);

    let repeated = executor
        .execute_route("prices", params(json!({"price": [2.0]})), None, None)
        .await?;
    assert!(repeated.cache_hit);
    assert_eq!(i64_column(&repeated.rows, "id")?, vec![1, 3]);
    let combined = executor
        .execute_route("prices", params(json!({"price": [2.5, 2.0]})), None, None)
        .await?;
    assert!(combined.cache_hit);
    assert_eq!(i64_column(&combined.rows, "id")?, vec![1, 2, 3]);
    Ok(())
}
