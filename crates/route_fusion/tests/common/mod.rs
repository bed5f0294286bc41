#![allow(dead_code)]

use std::sync::{Arc, Once};

use anyhow::{Context, Result};
use datafusion::arrow::array::{Array, Int64Array, StringArray};
use datafusion::arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatch;
use route_fusion::{
    DataFusionEngine, ExecutorConfig, QueryEngine, RawParams, RouteDefinition, RouteExecutor,
    RouteRegistry,
};
use serde_json::Value as JsonValue;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn sales_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("day", DataType::Int64, false),
        Field::new("id", DataType::Int64, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("amount", DataType::Int64, false),
    ]))
}

/// `(day, id, category, amount)` rows, deliberately stored out of order.
pub const SALES: &[(i64, i64, &str, i64)] = &[
    (3, 6, "a", 60),
    (1, 2, "b", 20),
    (2, 4, "c", 40),
    (1, 1, "a", 10),
    (4, 7, "b", 70),
    (2, 3, "a", 30),
    (3, 5, "b", 50),
];

pub fn sales_batch(rows: &[(i64, i64, &str, i64)]) -> Result<RecordBatch> {
    RecordBatch::try_new(
        sales_schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|row| row.0))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|row| row.1))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|row| row.2))),
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|row| row.3))),
        ],
    )
    .context("build sales batch")
}

/// DataFusion engine with the `sales` table registered.
pub fn sales_engine() -> Result<DataFusionEngine> {
    DataFusionEngine::new(2).with_batches("sales", sales_schema(), vec![sales_batch(SALES)?])
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<DataFusionEngine>,
    pub executor: RouteExecutor,
}

/// Executor over the sales engine with a fresh cache directory.
pub fn harness(routes: Vec<RouteDefinition>) -> Result<Harness> {
    init_tracing();
    let dir = TempDir::new().context("create temp dir")?;
    let engine = Arc::new(sales_engine()?);
    let executor = executor_with(
        &dir,
        ExecutorConfig::for_cache_dir(dir.path()),
        routes,
        engine.clone(),
    )?;
    Ok(Harness {
        dir,
        engine,
        executor,
    })
}

pub fn executor_with(
    dir: &TempDir,
    mut config: ExecutorConfig,
    routes: Vec<RouteDefinition>,
    engine: Arc<dyn QueryEngine>,
) -> Result<RouteExecutor> {
    config.cache_dir = dir.path().to_path_buf();
    let mut registry = RouteRegistry::new();
    for route in routes {
        registry.register(route)?;
    }
    Ok(RouteExecutor::new(config, Arc::new(registry), engine))
}

pub fn params(value: JsonValue) -> RawParams {
    match value {
        JsonValue::Object(map) => map,
        _ => RawParams::new(),
    }
}

pub fn i64_column(batch: &RecordBatch, name: &str) -> Result<Vec<i64>> {
    let column = batch
        .column_by_name(name)
        .with_context(|| format!("missing column {name}"))?;
    let values = column
        .as_any()
        .downcast_ref::<Int64Array>()
        .with_context(|| format!("column {name} is not Int64"))?;
    Ok((0..values.len()).map(|idx| values.value(idx)).collect())
}

pub fn string_column(batch: &RecordBatch, name: &str) -> Result<Vec<String>> {
    let column = batch
        .column_by_name(name)
        .with_context(|| format!("missing column {name}"))?;
    let values = column
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("column {name} is not Utf8"))?;
    Ok((0..values.len())
        .map(|idx| values.value(idx).to_string())
        .collect())
}
