//! Batch -> row materialization for callers that want dictionaries.

use arrow::array::Array;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use vq_common::Result;

use crate::decode::decode_value;
use crate::value::Row;

/// Converts one batch into rows.
///
/// Columns without backing buffers (Arrow `Null` type) are left out of the
/// rows instead of being materialized as null placeholders.
pub fn to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    let schema = batch.schema();
    let columns = schema
        .fields()
        .iter()
        .zip(batch.columns())
        .filter(|(_, array)| !has_no_backing(array.as_ref()))
        .collect::<Vec<_>>();

    let mut rows = Vec::with_capacity(batch.num_rows());
    for idx in 0..batch.num_rows() {
        let mut row = Row::with_capacity(columns.len());
        for (field, array) in &columns {
            row.insert(field.name().clone(), decode_value(array.as_ref(), idx)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Converts batches of one logical table into rows, in batch order.
pub fn batches_to_rows(batches: &[RecordBatch]) -> Result<Vec<Row>> {
    let mut rows = Vec::with_capacity(batches.iter().map(RecordBatch::num_rows).sum());
    for batch in batches {
        rows.extend(to_rows(batch)?);
    }
    Ok(rows)
}

fn has_no_backing(array: &dyn Array) -> bool {
    matches!(array.data_type(), DataType::Null)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{BinaryArray, Int32Array, NullArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};

    use super::to_rows;
    use crate::Value;

    #[test]
    fn rows_keep_column_order_and_skip_null_typed_columns() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("nothing", DataType::Null, true),
            Field::new("blob", DataType::Binary, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(vec![1, 2])),
                Arc::new(NullArray::new(2)),
                Arc::new(BinaryArray::from(vec![Some(&b"x"[..]), None])),
            ],
        )
        .expect("batch");

        let rows = to_rows(&batch).expect("rows");
        assert_eq!(rows.len(), 2);
        let keys = rows[0].keys().cloned().collect::<Vec<_>>();
        assert_eq!(keys, vec!["id".to_string(), "blob".to_string()]);
        assert_eq!(rows[0]["blob"], Value::Binary(b"x".to_vec()));
        assert_eq!(rows[1]["blob"], Value::Null);
    }
}
