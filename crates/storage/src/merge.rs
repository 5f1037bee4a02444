//! Merge-insert (upsert) keyed by Arrow row encoding.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, UInt64Array};
use arrow::compute::interleave;
use arrow::datatypes::UInt64Type;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, SortField};
use vq_common::{Result, VqError};
use vq_execution::{MergeInsertRequest, MergeStats};

use crate::catalog::{StoredTable, check_compatible};
use crate::filter::Predicate;

/// Apply `request` with `source` rows to `table`.
///
/// Matched target rows keep their row id when updated. Inserted rows get
/// fresh ids. When several source rows share a key, the first one wins.
pub fn merge_insert(
    table: &mut StoredTable,
    request: &MergeInsertRequest,
    source: &RecordBatch,
) -> Result<MergeStats> {
    if request.on.is_empty() {
        return Err(VqError::InvalidInput(
            "merge_insert requires at least one key column".to_string(),
        ));
    }
    check_compatible(&table.schema, &source.schema())?;
    let target = table.user_batch()?;

    let key_indices = request
        .on
        .iter()
        .map(|name| {
            table.schema.index_of(name).map_err(|_| {
                VqError::MissingColumn(format!("merge key '{name}' does not exist"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let converter = RowConverter::new(
        key_indices
            .iter()
            .map(|&i| SortField::new(table.schema.field(i).data_type().clone()))
            .collect(),
    )?;
    let key_columns = |batch: &RecordBatch| -> Vec<ArrayRef> {
        key_indices.iter().map(|&i| batch.column(i).clone()).collect()
    };
    let target_keys = converter.convert_columns(&key_columns(&target))?;
    let source_keys = converter.convert_columns(&key_columns(source))?;

    let mut source_by_key = HashMap::with_capacity(source.num_rows());
    for row in 0..source.num_rows() {
        source_by_key.entry(source_keys.row(row)).or_insert(row);
    }

    let update_mask = match (&request.matched_update_filter, request.when_matched_update_all) {
        (Some(filter), true) => Some(Predicate::parse(filter)?.evaluate(&target)?),
        _ => None,
    };
    let delete_mask = match (&request.source_delete_filter, request.when_not_matched_by_source_delete) {
        (Some(filter), true) => Some(Predicate::parse(filter)?.evaluate(&target)?),
        _ => None,
    };

    let mut stats = MergeStats::default();
    let mut matched_sources = vec![false; source.num_rows()];
    // (batch, row): batch 0 is the target, batch 1 the source
    let mut picks: Vec<(usize, usize)> = Vec::with_capacity(target.num_rows() + source.num_rows());
    let mut row_ids: Vec<u64> = Vec::with_capacity(picks.capacity());
    let target_ids = table
        .data
        .column(table.data.num_columns() - 1)
        .as_primitive::<UInt64Type>()
        .clone();

    for row in 0..target.num_rows() {
        match source_by_key.get(&target_keys.row(row)) {
            Some(&src) => {
                matched_sources[src] = true;
                let update = request.when_matched_update_all
                    && update_mask.as_ref().is_none_or(|m| m.value(row));
                if update {
                    stats.updated += 1;
                    picks.push((1, src));
                } else {
                    picks.push((0, row));
                }
                row_ids.push(target_ids.value(row));
            }
            None => {
                let delete = request.when_not_matched_by_source_delete
                    && delete_mask.as_ref().is_none_or(|m| m.value(row));
                if delete {
                    stats.deleted += 1;
                } else {
                    picks.push((0, row));
                    row_ids.push(target_ids.value(row));
                }
            }
        }
    }

    if request.when_not_matched_insert_all {
        for row in 0..source.num_rows() {
            if matched_sources[row] || source_by_key.get(&source_keys.row(row)) != Some(&row) {
                continue;
            }
            picks.push((1, row));
            row_ids.push(table.next_row_id);
            table.next_row_id += 1;
            stats.inserted += 1;
        }
    }

    let mut columns = Vec::with_capacity(table.schema.fields().len() + 1);
    for i in 0..table.schema.fields().len() {
        let sources: [&dyn Array; 2] = [target.column(i).as_ref(), source.column(i).as_ref()];
        columns.push(interleave(&sources, &picks)?);
    }
    columns.push(Arc::new(UInt64Array::from(row_ids)) as ArrayRef);
    table.data = RecordBatch::try_new(table.data.schema(), columns)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{AsArray, Int32Array, StringArray};
    use arrow::datatypes::{Int32Type, UInt64Type};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use vq_execution::MergeInsertRequest;

    use super::merge_insert;
    use crate::catalog::StoredTable;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    fn rows(ids: Vec<i32>, names: Vec<&str>) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int32Array::from(ids)),
                Arc::new(StringArray::from(names)),
            ],
        )
        .expect("batch")
    }

    fn upsert() -> MergeInsertRequest {
        MergeInsertRequest {
            on: vec!["id".to_string()],
            when_matched_update_all: true,
            when_not_matched_insert_all: true,
            ..MergeInsertRequest::default()
        }
    }

    #[test]
    fn upsert_updates_matches_and_inserts_new_keys() {
        let mut table = StoredTable::new(schema()).expect("table");
        table.append(&rows(vec![1, 2, 3], vec!["a", "b", "c"])).expect("append");

        let stats = merge_insert(&mut table, &upsert(), &rows(vec![2, 3], vec!["B", "C"]))
            .expect("merge");
        assert_eq!((stats.updated, stats.inserted, stats.deleted), (2, 0, 0));
        assert_eq!(table.num_rows(), 3);

        let stats = merge_insert(&mut table, &upsert(), &rows(vec![3, 4, 5], vec!["x", "y", "z"]))
            .expect("merge");
        assert_eq!((stats.updated, stats.inserted), (1, 2));
        assert_eq!(table.num_rows(), 5);

        let names = table.data.column(1).as_string::<i32>();
        assert_eq!(names.value(1), "B");
        assert_eq!(names.value(2), "x");
        let ids = table.data.column(2).as_primitive::<UInt64Type>().values().to_vec();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unmatched_target_rows_can_be_deleted() {
        let mut table = StoredTable::new(schema()).expect("table");
        table.append(&rows(vec![1, 2, 3], vec!["a", "b", "c"])).expect("append");
        let request = MergeInsertRequest {
            when_not_matched_by_source_delete: true,
            ..upsert()
        };
        let stats = merge_insert(&mut table, &request, &rows(vec![2], vec!["B"])).expect("merge");
        assert_eq!(stats.deleted, 2);
        let ids = table.data.column(0).as_primitive::<Int32Type>().values().to_vec();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut table = StoredTable::new(schema()).expect("table");
        let request = MergeInsertRequest {
            on: vec!["nope".to_string()],
            ..upsert()
        };
        assert!(merge_insert(&mut table, &request, &rows(vec![1], vec!["a"])).is_err());
    }
}
