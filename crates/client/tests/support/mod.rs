#![allow(dead_code)]

use std::sync::Arc;

use arrow::array::{
    Array, AsArray, FixedSizeListBuilder, Float32Builder, Int64Array, StringArray,
};
use arrow::datatypes::{Float32Type, Int64Type, UInt32Type};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use vq_client::{Connection, CreateTableMode, Table};

/// `(id, text, lang, vector)` rows of the `docs` fixture; row ids follow
/// insertion order starting at 0.
pub const DOCS: [(i64, &str, &str, [f32; 3]); 5] = [
    (1, "rust vector database", "en", [1.0, 0.0, 0.0]),
    (2, "rust async runtime", "en", [0.8, 0.2, 0.0]),
    (3, "python data frames", "de", [0.0, 1.0, 0.0]),
    (4, "vector search engine", "en", [0.0, 0.0, 1.0]),
    (5, "columnar storage format", "fr", [0.5, 0.5, 0.0]),
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("vq_client=debug,vq_storage=debug")
        .try_init();
}

pub fn docs_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("text", DataType::Utf8, true),
        Field::new("lang", DataType::Utf8, true),
        Field::new(
            "vector",
            DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), 3),
            true,
        ),
    ]))
}

/// Fixture rows whose id is in `ids`, in fixture order.
pub fn docs_batch(ids: &[i64]) -> RecordBatch {
    let rows = DOCS
        .iter()
        .filter(|(id, ..)| ids.contains(id))
        .collect::<Vec<_>>();
    let mut vectors = FixedSizeListBuilder::new(Float32Builder::new(), 3);
    for (.., vector) in &rows {
        for x in vector {
            vectors.values().append_value(*x);
        }
        vectors.append(true);
    }
    RecordBatch::try_new(
        docs_schema(),
        vec![
            Arc::new(Int64Array::from(
                rows.iter().map(|(id, ..)| *id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, text, ..)| *text).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, _, lang, _)| *lang).collect::<Vec<_>>(),
            )),
            Arc::new(vectors.finish()),
        ],
    )
    .expect("docs batch")
}

pub fn all_docs() -> RecordBatch {
    docs_batch(&[1, 2, 3, 4, 5])
}

/// A fresh in-process connection with the full `docs` table.
pub fn docs_table(uri: &str) -> (Connection, Table) {
    let conn = Connection::memory_blocking(uri).expect("connect");
    let table = conn
        .create_table_blocking("docs", vec![all_docs()], CreateTableMode::Create)
        .expect("create docs");
    (conn, table)
}

pub fn ids(batch: &RecordBatch) -> Vec<i64> {
    batch
        .column_by_name("id")
        .expect("id column")
        .as_primitive::<Int64Type>()
        .values()
        .to_vec()
}

pub fn f32_column(batch: &RecordBatch, name: &str) -> Vec<f32> {
    batch
        .column_by_name(name)
        .unwrap_or_else(|| panic!("missing column {name}"))
        .as_primitive::<Float32Type>()
        .values()
        .to_vec()
}

pub fn u32_column(batch: &RecordBatch, name: &str) -> Vec<u32> {
    let column = batch
        .column_by_name(name)
        .unwrap_or_else(|| panic!("missing column {name}"));
    assert_eq!(column.null_count(), 0);
    column.as_primitive::<UInt32Type>().values().to_vec()
}

pub fn field_names(batch: &RecordBatch) -> Vec<String> {
    batch
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect()
}
