//! Row-level invariant cell extraction and filtering.

use std::collections::BTreeSet;
use std::sync::Arc;

use datafusion::arrow::array::{Array, BooleanArray, StringArray};
use datafusion::arrow::compute::{cast, filter_record_batch};
use datafusion::arrow::datatypes::DataType;
use datafusion::arrow::record_batch::RecordBatch;

use crate::error::{StoreError, StoreResult};
use crate::tokens::{normalize_token, InvariantColumn, InvariantTokens};

/// Normalized string view of one invariant column.
struct CellColumn {
    values: Arc<StringArray>,
    case_insensitive: bool,
}

impl CellColumn {
    fn value(&self, row: usize) -> Option<String> {
        if self.values.is_null(row) {
            return None;
        }
        normalize_token(self.values.value(row), self.case_insensitive)
    }
}

fn cell_columns(
    batch: &RecordBatch,
    request: &InvariantTokens,
    columns: &[InvariantColumn],
) -> StoreResult<Vec<(String, CellColumn)>> {
    request
        .iter()
        .map(|(param, _)| {
            let mapping = columns
                .iter()
                .find(|candidate| &candidate.param == param)
                .ok_or_else(|| StoreError::MissingColumn(format!("<invariant {param}>")))?;
            let raw = batch
                .column_by_name(&mapping.column)
                .ok_or_else(|| StoreError::MissingColumn(mapping.column.clone()))?;
            let as_text = cast(raw.as_ref(), &DataType::Utf8)
                .map_err(|err| StoreError::arrow(format!("cast {}", mapping.column), err))?;
            let values = as_text
                .as_any()
                .downcast_ref::<StringArray>()
                .cloned()
                .ok_or_else(|| StoreError::MissingColumn(mapping.column.clone()))?;
            Ok((
                mapping.column.clone(),
                CellColumn {
                    values: Arc::new(values),
                    case_insensitive: mapping.case_insensitive,
                },
            ))
        })
        .collect()
}

/// Keeps only rows whose invariant cell is in `cells`.
///
/// Cells are laid out in `request` parameter order, matching
/// [`InvariantTokens::cells`]. Rows with a null invariant value never match.
pub fn filter_to_cells(
    batch: &RecordBatch,
    request: &InvariantTokens,
    columns: &[InvariantColumn],
    cells: &BTreeSet<Vec<String>>,
) -> StoreResult<RecordBatch> {
    if request.is_unconstrained() {
        return Ok(batch.clone());
    }
    let cell_columns = cell_columns(batch, request, columns)?;
    let mask = (0..batch.num_rows())
        .map(|row| {
            let cell = cell_columns
                .iter()
                .map(|(_, column)| column.value(row))
                .collect::<Option<Vec<_>>>();
            Some(cell.is_some_and(|cell| cells.contains(&cell)))
        })
        .collect::<BooleanArray>();
    filter_record_batch(batch, &mask).map_err(|err| StoreError::arrow("filter shard rows", err))
}

/// Keeps only rows whose invariant values all lie inside `request`.
///
/// Used when a superset answers the whole request, so no cells are enumerated.
pub fn filter_to_box(
    batch: &RecordBatch,
    request: &InvariantTokens,
    columns: &[InvariantColumn],
) -> StoreResult<RecordBatch> {
    if request.is_unconstrained() {
        return Ok(batch.clone());
    }
    let cell_columns = cell_columns(batch, request, columns)?;
    let mask = (0..batch.num_rows())
        .map(|row| {
            Some(
                request
                    .iter()
                    .zip(&cell_columns)
                    .all(|((_, allowed), (_, values))| {
                        values.value(row).is_some_and(|value| allowed.contains(&value))
                    }),
            )
        })
        .collect::<BooleanArray>();
    filter_record_batch(batch, &mask).map_err(|err| StoreError::arrow("filter superset rows", err))
}

/// Rejects rows that fall outside the box being materialized.
pub fn check_within_box(
    batch: &RecordBatch,
    tokens: &InvariantTokens,
    columns: &[InvariantColumn],
) -> StoreResult<()> {
    if tokens.is_unconstrained() {
        return Ok(());
    }
    let cell_columns = cell_columns(batch, tokens, columns)?;
    for row in 0..batch.num_rows() {
        for ((param, allowed), (column, values)) in tokens.iter().zip(&cell_columns) {
            let value = values.value(row);
            if !value.as_ref().is_some_and(|value| allowed.contains(value)) {
                return Err(StoreError::ShardViolation {
                    row,
                    column: format!("{column} ({param})"),
                    value,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{Field, Schema};

    fn rows() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("category", DataType::Utf8, true),
            Field::new("id", DataType::Int64, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(vec![Some("A"), Some("b"), None, Some("a")])),
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
            ],
        )
        .expect("batch")
    }

    fn category(case_insensitive: bool) -> Vec<InvariantColumn> {
        vec![InvariantColumn {
            param: "cat".to_string(),
            column: "category".to_string(),
            case_insensitive,
        }]
    }

    #[test]
    fn filter_matches_case_folded_values_and_drops_nulls() {
        let request = InvariantTokens::new().with("cat", ["a"]);
        let cells = BTreeSet::from([vec!["a".to_string()]]);
        let filtered = filter_to_cells(&rows(), &request, &category(true), &cells).expect("filter");
        assert_eq!(filtered.num_rows(), 2);

        let exact = filter_to_cells(&rows(), &request, &category(false), &cells).expect("filter");
        assert_eq!(exact.num_rows(), 1);
    }

    #[test]
    fn box_filter_needs_every_parameter_to_match() {
        let request = InvariantTokens::new().with("cat", ["a", "b"]);
        let filtered = filter_to_box(&rows(), &request, &category(true)).expect("filter");
        let ids = filtered
            .column(1)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("id column")
            .values()
            .to_vec();
        assert_eq!(ids, vec![1, 2, 4]);

        let everything = filter_to_box(&rows(), &InvariantTokens::new(), &category(true)).expect("filter");
        assert_eq!(everything.num_rows(), 4);
    }

    #[test]
    fn out_of_box_rows_are_rejected() {
        let tokens = InvariantTokens::new().with("cat", ["a"]);
        let err = check_within_box(&rows(), &tokens, &category(true)).expect_err("violation");
        assert!(matches!(err, StoreError::ShardViolation { row: 1, .. }));
        check_within_box(&rows(), &InvariantTokens::new(), &category(true)).expect("superset");
    }
}
