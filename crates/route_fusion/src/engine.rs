//! Query engine seam and its DataFusion implementation.
//!
//! Every route execution opens its own session. Sessions hold the
//! dependency aliases of exactly one request and are dropped with it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::memory::MemTable;
use datafusion::catalog::TableProvider;
use datafusion::common::ScalarValue;
use datafusion::prelude::{SessionConfig, SessionContext};
use tracing::debug;

/// Columnar result of one query.
#[derive(Debug, Clone)]
pub struct QueryOutput {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
}

/// Opens request-scoped query sessions.
#[async_trait]
pub trait QueryEngine: Send + Sync + fmt::Debug {
    /// Opens a fresh session; sessions are never pooled or shared.
    async fn open_session(&self, route_id: &str) -> Result<Box<dyn QuerySession>>;
}

/// One isolated engine session.
#[async_trait]
pub trait QuerySession: Send {
    /// Exposes `table` to subsequent queries under `alias`.
    fn register_alias(&mut self, alias: &str, table: Arc<dyn TableProvider>) -> Result<()>;

    /// Runs `sql` with named `$placeholders` bound to `bound`.
    async fn execute(&mut self, sql: &str, bound: Vec<(String, ScalarValue)>)
        -> Result<QueryOutput>;
}

/// DataFusion-backed engine with a fixed set of base tables.
#[derive(Debug)]
pub struct DataFusionEngine {
    tables: BTreeMap<String, Arc<dyn TableProvider>>,
    target_partitions: usize,
    sessions: AtomicU64,
    executions: Arc<AtomicU64>,
}

impl DataFusionEngine {
    pub fn new(target_partitions: usize) -> Self {
        Self {
            tables: BTreeMap::new(),
            target_partitions: target_partitions.max(1),
            sessions: AtomicU64::new(0),
            executions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a base table visible to every session.
    pub fn with_table(mut self, name: impl Into<String>, table: Arc<dyn TableProvider>) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Registers in-memory batches as a base table.
    pub fn with_batches(
        self,
        name: impl Into<String>,
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    ) -> Result<Self> {
        let name = name.into();
        let table = MemTable::try_new(schema, vec![batches])
            .with_context(|| format!("build in-memory table {name}"))?;
        Ok(self.with_table(name, Arc::new(table)))
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Queries executed so far across all sessions.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueryEngine for DataFusionEngine {
    async fn open_session(&self, route_id: &str) -> Result<Box<dyn QuerySession>> {
        let config = SessionConfig::new().with_target_partitions(self.target_partitions);
        let ctx = SessionContext::new_with_config(config);
        for (name, table) in &self.tables {
            ctx.register_table(name.as_str(), Arc::clone(table))
                .with_context(|| format!("register base table {name}"))?;
        }
        let session = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(route_id, session, "opened query session");
        Ok(Box::new(DataFusionSession {
            ctx,
            executions: Arc::clone(&self.executions),
        }))
    }
}

struct DataFusionSession {
    ctx: SessionContext,
    executions: Arc<AtomicU64>,
}

#[async_trait]
impl QuerySession for DataFusionSession {
    fn register_alias(&mut self, alias: &str, table: Arc<dyn TableProvider>) -> Result<()> {
        // Aliases shadow base tables of the same name for this session only.
        let _ = self.ctx.deregister_table(alias);
        self.ctx
            .register_table(alias, table)
            .with_context(|| format!("register alias {alias}"))?;
        Ok(())
    }

    async fn execute(
        &mut self,
        sql: &str,
        bound: Vec<(String, ScalarValue)>,
    ) -> Result<QueryOutput> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let frame = self.ctx.sql(sql).await.context("plan route query")?;
        let frame = if bound.is_empty() {
            frame
        } else {
            frame
                .with_param_values(bound)
                .context("bind route parameters")?
        };
        let schema: SchemaRef = Arc::new(frame.schema().as_arrow().clone());
        let batches = frame.collect().await.context("execute route query")?;
        Ok(QueryOutput { schema, batches })
    }
}
