//! Row <-> columnar marshalling for the `vq` client.
//!
//! Architecture role:
//! - [`value`]: the dynamic row model handed to and returned from callers
//! - [`encode`]: schema-driven row -> batch encoding
//! - [`decode`]: array -> value decoding (one level of list nesting)
//! - [`ipc`]: schema-only streams and schema-prefixed batch frames
//! - [`materialize`]: batch -> row conversion for query results

pub mod decode;
pub mod encode;
pub mod ipc;
pub mod materialize;
pub mod value;

pub use decode::{decode_array, decode_value};
pub use encode::{encode, encode_column, validate_schema};
pub use ipc::{
    decode_batches, decode_frame, decode_schema, encode_batches, encode_frame,
    encode_schema_only, frame_schema,
};
pub use materialize::{batches_to_rows, to_rows};
pub use value::{Row, Value};

/// Decodes a batch into rows; alias of [`to_rows`].
pub fn decode(batch: &arrow::record_batch::RecordBatch) -> vq_common::Result<Vec<Row>> {
    to_rows(batch)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema, TimeUnit};

    use crate::{Value, decode, encode, row};

    #[test]
    fn encode_then_decode_reproduces_rows() {
        let item = Field::new("item", DataType::Float32, true);
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::UInt64, false),
            Field::new("title", DataType::Utf8, true),
            Field::new("payload", DataType::Binary, true),
            Field::new("score", DataType::Float64, true),
            Field::new("flag", DataType::Boolean, true),
            Field::new("day", DataType::Date32, true),
            Field::new(
                "seen",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                true,
            ),
            Field::new("price", DataType::Decimal128(10, 2), true),
            Field::new("tags", DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))), true),
            Field::new("vector", DataType::FixedSizeList(Arc::new(item), 3), true),
        ]));
        let rows = vec![
            row!(
                "id" => 1_u64,
                "title" => "first",
                "payload" => vec![0_u8, 1, 2],
                "score" => 0.5_f64,
                "flag" => true,
                "day" => Value::Date32(19_000),
                "seen" => Value::Timestamp(1_700_000_000_000_000),
                "price" => Value::Decimal128(12_345),
                "tags" => Value::List(vec![Value::from("a"), Value::from("b")]),
                "vector" => vec![0.1_f32, 0.2, 0.3],
            ),
            row!(
                "id" => 2_u64,
                "title" => "second",
                "payload" => vec![9_u8],
                "score" => -1.25_f64,
                "flag" => false,
                "day" => Value::Date32(19_001),
                "seen" => Value::Timestamp(1_700_000_000_000_001),
                "price" => Value::Decimal128(-5),
                "tags" => Value::List(vec![]),
                "vector" => vec![1.0_f32, 2.0, 3.0],
            ),
        ];

        let batch = encode(&rows, schema).expect("encode");
        let decoded = decode(&batch).expect("decode");
        assert_eq!(decoded, rows);
    }
}
