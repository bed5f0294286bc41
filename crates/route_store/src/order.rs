//! Ordering, validation and slicing kernels over Arrow record batches.

use std::fmt;
use std::sync::Arc;

use datafusion::arrow::array::{ArrayRef, UInt32Array};
use datafusion::arrow::compute::{concat_batches, lexsort_to_indices, take_record_batch};
use datafusion::arrow::compute::{SortColumn, SortOptions};
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::arrow::record_batch::RecordBatch;
use datafusion::arrow::row::{RowConverter, SortField};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// One declared ordering column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub nulls_first: bool,
}

impl SortKey {
    /// Ascending key with nulls last, the default SQL ordering.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
            nulls_first: false,
        }
    }

    /// Descending key with nulls last.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
            nulls_first: false,
        }
    }

    fn options(&self) -> SortOptions {
        SortOptions {
            descending: self.descending,
            nulls_first: self.nulls_first,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} NULLS {}",
            self.column,
            if self.descending { "DESC" } else { "ASC" },
            if self.nulls_first { "FIRST" } else { "LAST" }
        )
    }
}

/// Renders an ordering as a comma separated column list for messages.
pub fn describe_order(keys: &[SortKey]) -> String {
    keys.iter()
        .map(|key| key.column.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row range requested by a caller. `limit == None` reads to the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RowWindow {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RowWindow {
    pub const fn new(offset: usize, limit: Option<usize>) -> Self {
        Self { offset, limit }
    }

    /// Snaps the window outward to whole pages of `page_rows` rows.
    pub fn snap_to_pages(self, page_rows: usize) -> Self {
        if page_rows == 0 {
            return self;
        }
        let start = (self.offset / page_rows) * page_rows;
        let limit = self.limit.map(|limit| {
            let end = self.offset.saturating_add(limit);
            let end = end.div_ceil(page_rows).saturating_mul(page_rows);
            end - start
        });
        Self {
            offset: start,
            limit,
        }
    }

    /// Clamps the window against `total` rows, returning `(offset, length)`.
    pub fn bounds(self, total: usize) -> (usize, usize) {
        let offset = self.offset.min(total);
        let available = total - offset;
        let length = self.limit.map_or(available, |limit| limit.min(available));
        (offset, length)
    }
}

/// Concatenates batches under `schema`, producing one (possibly empty) batch.
pub fn concat(schema: &SchemaRef, batches: &[RecordBatch]) -> StoreResult<RecordBatch> {
    match batches {
        [] => Ok(RecordBatch::new_empty(Arc::clone(schema))),
        [single] => Ok(single.clone()),
        many => concat_batches(schema, many).map_err(|err| StoreError::arrow("concat pages", err)),
    }
}

fn key_columns(batch: &RecordBatch, keys: &[SortKey]) -> StoreResult<Vec<ArrayRef>> {
    keys.iter()
        .map(|key| {
            batch
                .column_by_name(&key.column)
                .cloned()
                .ok_or_else(|| StoreError::MissingColumn(key.column.clone()))
        })
        .collect()
}

/// Sorts a batch by `keys`. Ties keep their input order.
pub fn sort_batch(batch: &RecordBatch, keys: &[SortKey]) -> StoreResult<RecordBatch> {
    if keys.is_empty() || batch.num_rows() < 2 {
        return Ok(batch.clone());
    }
    let mut columns = key_columns(batch, keys)?
        .into_iter()
        .zip(keys)
        .map(|(values, key)| SortColumn {
            values,
            options: Some(key.options()),
        })
        .collect::<Vec<_>>();
    let positions: ArrayRef = Arc::new(UInt32Array::from_iter_values(
        0..batch.num_rows() as u32,
    ));
    columns.push(SortColumn {
        values: positions,
        options: Some(SortOptions::default()),
    });
    let indices = lexsort_to_indices(&columns, None)
        .map_err(|err| StoreError::arrow("sort rows", err))?;
    take_record_batch(batch, &indices).map_err(|err| StoreError::arrow("reorder rows", err))
}

/// Verifies that rows are non-decreasing under `keys`.
pub fn check_sorted(batch: &RecordBatch, keys: &[SortKey]) -> StoreResult<()> {
    if keys.is_empty() || batch.num_rows() < 2 {
        return Ok(());
    }
    let columns = key_columns(batch, keys)?;
    let fields = columns
        .iter()
        .zip(keys)
        .map(|(column, key)| SortField::new_with_options(column.data_type().clone(), key.options()))
        .collect::<Vec<_>>();
    let converter =
        RowConverter::new(fields).map_err(|err| StoreError::arrow("build row converter", err))?;
    let rows = converter
        .convert_columns(&columns)
        .map_err(|err| StoreError::arrow("encode sort keys", err))?;
    for row in 1..rows.num_rows() {
        if rows.row(row) < rows.row(row - 1) {
            return Err(StoreError::Unsorted {
                order_by: describe_order(keys),
                row,
            });
        }
    }
    Ok(())
}

/// Applies a window to a fully materialized batch.
pub fn slice(batch: &RecordBatch, window: Option<RowWindow>) -> RecordBatch {
    match window {
        None => batch.clone(),
        Some(window) => {
            let (offset, length) = window.bounds(batch.num_rows());
            batch.slice(offset, length)
        }
    }
}
