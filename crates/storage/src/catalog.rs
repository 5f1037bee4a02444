//! Per-URI databases and their tables.
//!
//! Rows are kept as one Arrow batch per table whose last column is the
//! internal `_rowid`. Row ids are assigned in insertion order and never
//! reused within a table.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, UInt64Array};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use vq_common::{ROW_ID_COLUMN, Result, VqError};
use vq_execution::IndexConfig;
use vq_execution::schema::row_id_field;

/// One stored table.
#[derive(Debug, Clone)]
pub struct StoredTable {
    /// User-visible schema.
    pub schema: SchemaRef,
    /// Rows plus a trailing `_rowid` column.
    pub data: RecordBatch,
    /// Next row id handed out.
    pub next_row_id: u64,
    /// Indices built on this table.
    pub indices: Vec<IndexConfig>,
}

impl StoredTable {
    /// Empty table with `schema`.
    pub fn new(schema: SchemaRef) -> Result<Self> {
        if schema.field_with_name(ROW_ID_COLUMN).is_ok() {
            return Err(VqError::InvalidInput(format!(
                "column name '{ROW_ID_COLUMN}' is reserved"
            )));
        }
        let storage = storage_schema(&schema);
        Ok(Self {
            schema,
            data: RecordBatch::new_empty(storage),
            next_row_id: 0,
            indices: Vec::new(),
        })
    }

    /// Number of stored rows.
    pub fn num_rows(&self) -> usize {
        self.data.num_rows()
    }

    /// Append `batch` (table schema, no `_rowid`); returns rows appended.
    pub fn append(&mut self, batch: &RecordBatch) -> Result<u64> {
        let stored = self.with_new_row_ids(batch)?;
        self.data = concat_batches(&self.data.schema(), [&self.data, &stored])?;
        Ok(stored.num_rows() as u64)
    }

    /// Replace all rows with `batch`.
    pub fn overwrite(&mut self, batch: &RecordBatch) -> Result<u64> {
        let stored = self.with_new_row_ids(batch)?;
        let rows = stored.num_rows() as u64;
        self.data = stored;
        Ok(rows)
    }

    /// Attach fresh row ids to a user batch, checking it against the table schema.
    pub fn with_new_row_ids(&mut self, batch: &RecordBatch) -> Result<RecordBatch> {
        check_compatible(&self.schema, &batch.schema())?;
        let rows = batch.num_rows() as u64;
        let ids: ArrayRef = Arc::new(UInt64Array::from_iter_values(
            self.next_row_id..self.next_row_id + rows,
        ));
        self.next_row_id += rows;
        let mut columns = batch.columns().to_vec();
        columns.push(ids);
        Ok(RecordBatch::try_new(self.data.schema(), columns)?)
    }

    /// Stored rows without the internal `_rowid` column.
    pub fn user_batch(&self) -> Result<RecordBatch> {
        let keep = (0..self.schema.fields().len()).collect::<Vec<_>>();
        Ok(self.data.project(&keep)?)
    }

    /// Index covering `column`, if any.
    pub fn index_on(&self, column: &str) -> Option<&IndexConfig> {
        self.indices
            .iter()
            .find(|idx| idx.columns.iter().any(|c| c == column))
    }
}

/// Table schema plus the internal `_rowid` column.
pub fn storage_schema(schema: &Schema) -> SchemaRef {
    let mut fields = schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect::<Vec<_>>();
    fields.push(row_id_field());
    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

/// Incoming rows must carry the table's column names and types, in order.
pub fn check_compatible(table: &Schema, incoming: &Schema) -> Result<()> {
    let same = table.fields().len() == incoming.fields().len()
        && table
            .fields()
            .iter()
            .zip(incoming.fields().iter())
            .all(|(a, b)| a.name() == b.name() && a.data_type() == b.data_type());
    if same {
        Ok(())
    } else {
        Err(VqError::SchemaMismatch(format!(
            "expected columns [{}], got [{}]",
            describe(table),
            describe(incoming)
        )))
    }
}

fn describe(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| format!("{}: {}", f.name(), f.data_type()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Tables of one database URI.
#[derive(Debug, Default)]
pub struct Database {
    tables: BTreeMap<String, StoredTable>,
}

impl Database {
    /// Sorted table names.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Whether `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Insert or replace a table.
    pub fn put(&mut self, name: &str, table: StoredTable) {
        self.tables.insert(name.to_string(), table);
    }

    /// Look up a table.
    pub fn get(&self, name: &str) -> Result<&StoredTable> {
        self.tables
            .get(name)
            .ok_or_else(|| VqError::InvalidInput(format!("table '{name}' does not exist")))
    }

    /// Look up a table for writing.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut StoredTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| VqError::InvalidInput(format!("table '{name}' does not exist")))
    }

    /// Remove a table.
    pub fn remove(&mut self, name: &str) -> Result<StoredTable> {
        self.tables
            .remove(name)
            .ok_or_else(|| VqError::InvalidInput(format!("table '{name}' does not exist")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{AsArray, Int32Array};
    use arrow::datatypes::UInt64Type;
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use vq_common::VqError;

    use super::StoredTable;

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field::new("id", DataType::Int32, false)]))
    }

    fn rows(values: Vec<i32>) -> RecordBatch {
        RecordBatch::try_new(schema(), vec![Arc::new(Int32Array::from(values))]).expect("batch")
    }

    #[test]
    fn row_ids_keep_increasing_across_appends_and_overwrites() {
        let mut table = StoredTable::new(schema()).expect("table");
        assert_eq!(table.append(&rows(vec![1, 2])).expect("append"), 2);
        assert_eq!(table.append(&rows(vec![3])).expect("append"), 1);
        assert_eq!(table.num_rows(), 3);
        table.overwrite(&rows(vec![9])).expect("overwrite");
        let ids = table.data.column(1).as_primitive::<UInt64Type>().values().to_vec();
        assert_eq!(ids, vec![3]);
        assert_eq!(table.user_batch().expect("user").num_columns(), 1);
    }

    #[test]
    fn incompatible_batches_are_rejected() {
        let mut table = StoredTable::new(schema()).expect("table");
        let other = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(other, vec![Arc::new(arrow::array::Int64Array::from(vec![1]))])
            .expect("batch");
        assert!(matches!(table.append(&batch), Err(VqError::SchemaMismatch(_))));

        let reserved = Arc::new(Schema::new(vec![Field::new("_rowid", DataType::UInt64, false)]));
        assert!(StoredTable::new(reserved).is_err());
    }
}
