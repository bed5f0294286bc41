//! Table provider scanning a materialized page set of a dependency route.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::catalog::memory::MemTable;
use datafusion::catalog::{Session, TableProvider};
use datafusion::common::{DataFusionError, Result as DFResult};
use datafusion::logical_expr::{Expr, TableType};
use datafusion::physical_plan::ExecutionPlan;
use route_store::{read_page, PageReadError, PageSetHandle};
use tracing::{debug, warn};

/// Scans the pages of one cached page set in sequence order.
///
/// Pages are read when the parent query scans the alias, projected to the
/// requested columns, and stop early once `limit` rows are available. If a
/// concurrent commit replaced the pages in between, the scan serves the
/// fallback rows given with [`CachedPageTable::with_fallback`] instead.
#[derive(Debug)]
pub struct CachedPageTable {
    route_id: String,
    schema: SchemaRef,
    pages: Vec<(PathBuf, u32)>,
    total_rows: usize,
    fallback: Option<RecordBatch>,
}

impl CachedPageTable {
    pub fn new(route_id: impl Into<String>, handle: PageSetHandle) -> Self {
        Self {
            route_id: route_id.into(),
            schema: handle.schema,
            pages: handle.pages,
            total_rows: handle.total_rows,
            fallback: None,
        }
    }

    /// Rows equal to the page set's contents, served if its pages disappear.
    ///
    /// Ignored unless the schema and row count match the page set.
    pub fn with_fallback(mut self, rows: RecordBatch) -> Self {
        if rows.schema().fields() == self.schema.fields() && rows.num_rows() == self.total_rows {
            self.fallback = Some(rows);
        }
        self
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Outcome of reading a page set for one scan.
enum PageScan {
    Read(Vec<RecordBatch>),
    /// A page was removed by a newer commit.
    Superseded(PathBuf),
}

fn read_pages(
    pages: &[(PathBuf, u32)],
    projection: Option<&[usize]>,
    limit: Option<usize>,
) -> anyhow::Result<PageScan> {
    let mut batches = Vec::new();
    let mut rows = 0usize;
    for (path, crc32) in pages {
        if limit.is_some_and(|limit| rows >= limit) {
            break;
        }
        // Arrow IPC needs at least one column to recover row counts.
        let ipc_projection = projection.filter(|columns| !columns.is_empty()).map(<[usize]>::to_vec);
        let batch = match read_page(path, *crc32, ipc_projection) {
            Ok(batch) => batch,
            Err(PageReadError::Missing) => return Ok(PageScan::Superseded(path.clone())),
            Err(PageReadError::Corrupt(reason)) => {
                return Err(anyhow!("cached page is corrupt: {reason}"));
            }
            Err(PageReadError::Store(err)) => return Err(anyhow::Error::new(err)),
        };
        let batch = match projection {
            Some(columns) if columns.is_empty() => batch.project(&[])?,
            _ => batch,
        };
        rows += batch.num_rows();
        batches.push(batch);
    }
    Ok(PageScan::Read(batches))
}

#[async_trait]
impl TableProvider for CachedPageTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    fn table_type(&self) -> TableType {
        TableType::Base
    }

    async fn scan(
        &self,
        state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> DFResult<Arc<dyn ExecutionPlan>> {
        let projected_schema = match projection {
            Some(columns) => Arc::new(self.schema.project(columns)?),
            None => self.schema(),
        };
        if matches!(limit, Some(0)) {
            let mem = MemTable::try_new(
                Arc::clone(&projected_schema),
                vec![vec![RecordBatch::new_empty(projected_schema)]],
            )?;
            return mem.scan(state, None, &[], limit).await;
        }

        debug!(
            route_id = %self.route_id,
            pages = self.pages.len(),
            projection = ?projection,
            limit = ?limit,
            "scanning cached page set"
        );
        let pages = self.pages.clone();
        let owned_projection = projection.cloned();
        let scan = tokio::task::spawn_blocking(move || {
            read_pages(&pages, owned_projection.as_deref(), limit)
        })
        .await
        .map_err(|err| df_external(anyhow!("page scan task failed: {err}")))?
        .map_err(df_external)?;
        let batches = match scan {
            PageScan::Read(batches) => batches,
            PageScan::Superseded(path) => {
                let Some(fallback) = &self.fallback else {
                    return Err(df_external(anyhow!(
                        "cached page {} was superseded",
                        path.display()
                    )));
                };
                warn!(
                    route_id = %self.route_id,
                    page = %path.display(),
                    "cached page superseded during scan; serving dependency rows"
                );
                let rows = match projection {
                    Some(columns) => fallback.project(columns)?,
                    None => fallback.clone(),
                };
                vec![rows]
            }
        };

        let mem = MemTable::try_new(projected_schema, vec![batches])?;
        mem.scan(state, None, &[], limit).await
    }
}

fn df_external(err: anyhow::Error) -> DataFusionError {
    DataFusionError::Execution(format!("{err:#}"))
}
