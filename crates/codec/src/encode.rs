//! Row -> columnar encoding.
//!
//! Builder selection is driven by the field's declared type, never by the
//! runtime shape of the values: every value is checked against the field and
//! a disagreement is a [`VqError::TypeMismatch`].

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Date64Array, Decimal128Array,
    FixedSizeListArray, Float16Array, Float32Array, Float64Array, Int8Array, Int16Array,
    Int32Array, Int64Array, LargeBinaryArray, LargeStringArray, ListArray, StringArray,
    Time64MicrosecondArray, Time64NanosecondArray, TimestampMicrosecondArray,
    TimestampMillisecondArray, TimestampNanosecondArray, TimestampSecondArray, UInt8Array,
    UInt16Array, UInt32Array, UInt64Array,
};
use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, Field, Schema, SchemaRef, TimeUnit};
use vq_common::{Result, VqError};

use crate::value::{Row, Value};

/// Encodes `rows` into one batch with `schema`.
///
/// Fields absent from a row are null; a row naming a field the schema does not
/// declare is rejected.
pub fn encode(rows: &[Row], schema: SchemaRef) -> Result<RecordBatch> {
    for (idx, row) in rows.iter().enumerate() {
        for name in row.keys() {
            if schema.field_with_name(name).is_err() {
                return Err(VqError::TypeMismatch(format!(
                    "row {idx} references field '{name}' which is not in the schema"
                )));
            }
        }
    }

    let columns = schema
        .fields()
        .iter()
        .map(|field| {
            let cells = rows
                .iter()
                .map(|row| row.get(field.name()).filter(|v| !v.is_null()))
                .collect::<Vec<_>>();
            build_array(field, &cells, field.is_nullable(), 0)
        })
        .collect::<Result<Vec<_>>>()?;

    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    Ok(RecordBatch::try_new_with_options(schema, columns, &options)?)
}

/// Builds a single column from one value per row.
pub fn encode_column(field: &Field, values: &[Value]) -> Result<ArrayRef> {
    let cells = values
        .iter()
        .map(|v| (!v.is_null()).then_some(v))
        .collect::<Vec<_>>();
    build_array(field, &cells, field.is_nullable(), 0)
}

/// Checks that `schema` only uses types the encoder has builders for.
pub fn validate_schema(schema: &Schema) -> Result<()> {
    for field in schema.fields() {
        check_encodable(field.name(), field.data_type(), 0)?;
    }
    Ok(())
}

fn check_encodable(name: &str, data_type: &DataType, depth: usize) -> Result<()> {
    match data_type {
        DataType::FixedSizeList(child, _) | DataType::List(child) => {
            if depth > 0 {
                return Err(nested_list_error(name));
            }
            check_encodable(name, child.data_type(), depth + 1)
        }
        other if is_scalar_type(other) => Ok(()),
        other => Err(VqError::UnsupportedType(format!(
            "no array builder for field '{name}' of type {other}"
        ))),
    }
}

fn is_scalar_type(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float16
            | DataType::Float32
            | DataType::Float64
            | DataType::Utf8
            | DataType::LargeUtf8
            | DataType::Binary
            | DataType::LargeBinary
            | DataType::Date32
            | DataType::Date64
            | DataType::Time64(_)
            | DataType::Timestamp(_, _)
            | DataType::Decimal128(_, _)
    )
}

fn nested_list_error(name: &str) -> VqError {
    VqError::NotSupported(format!(
        "field '{name}' nests lists more than one level deep"
    ))
}

fn mismatch(field: &Field, row: usize, value: &Value) -> VqError {
    VqError::TypeMismatch(format!(
        "field '{}' expects {} but row {row} holds {}",
        field.name(),
        field.data_type(),
        value.type_name()
    ))
}

fn collect_values<'a, T>(
    field: &Field,
    cells: &[Option<&'a Value>],
    pick: impl Fn(&'a Value) -> Option<T>,
) -> Result<Vec<Option<T>>> {
    cells
        .iter()
        .enumerate()
        .map(|(row, cell)| match cell {
            None => Ok(None),
            Some(v) => pick(v).map(Some).ok_or_else(|| mismatch(field, row, v)),
        })
        .collect()
}

macro_rules! primitive {
    ($field:expr, $cells:expr, $array:ty, $variant:ident) => {{
        let values = collect_values($field, $cells, |v| match v {
            Value::$variant(x) => Some(*x),
            _ => None,
        })?;
        Arc::new(<$array>::from(values)) as ArrayRef
    }};
}

fn build_array(
    field: &Field,
    cells: &[Option<&Value>],
    nullable: bool,
    depth: usize,
) -> Result<ArrayRef> {
    if !nullable {
        if let Some(row) = cells.iter().position(Option::is_none) {
            return Err(VqError::TypeMismatch(format!(
                "field '{}' is not nullable but row {row} has no value",
                field.name()
            )));
        }
    }

    let array: ArrayRef = match field.data_type() {
        DataType::Boolean => primitive!(field, cells, BooleanArray, Boolean),
        DataType::Int8 => primitive!(field, cells, Int8Array, Int8),
        DataType::Int16 => primitive!(field, cells, Int16Array, Int16),
        DataType::Int32 => primitive!(field, cells, Int32Array, Int32),
        DataType::Int64 => primitive!(field, cells, Int64Array, Int64),
        DataType::UInt8 => primitive!(field, cells, UInt8Array, UInt8),
        DataType::UInt16 => primitive!(field, cells, UInt16Array, UInt16),
        DataType::UInt32 => primitive!(field, cells, UInt32Array, UInt32),
        DataType::UInt64 => primitive!(field, cells, UInt64Array, UInt64),
        DataType::Float16 => primitive!(field, cells, Float16Array, Float16),
        DataType::Float32 => primitive!(field, cells, Float32Array, Float32),
        DataType::Float64 => primitive!(field, cells, Float64Array, Float64),
        DataType::Date32 => primitive!(field, cells, Date32Array, Date32),
        DataType::Date64 => primitive!(field, cells, Date64Array, Date64),
        DataType::Time64(TimeUnit::Microsecond) => {
            primitive!(field, cells, Time64MicrosecondArray, Time64)
        }
        DataType::Time64(TimeUnit::Nanosecond) => {
            primitive!(field, cells, Time64NanosecondArray, Time64)
        }
        DataType::Timestamp(unit, tz) => {
            let values = collect_values(field, cells, |v| match v {
                Value::Timestamp(x) => Some(*x),
                _ => None,
            })?;
            match unit {
                TimeUnit::Second => Arc::new(
                    TimestampSecondArray::from(values).with_timezone_opt(tz.clone()),
                ) as ArrayRef,
                TimeUnit::Millisecond => Arc::new(
                    TimestampMillisecondArray::from(values).with_timezone_opt(tz.clone()),
                ) as ArrayRef,
                TimeUnit::Microsecond => Arc::new(
                    TimestampMicrosecondArray::from(values).with_timezone_opt(tz.clone()),
                ) as ArrayRef,
                TimeUnit::Nanosecond => Arc::new(
                    TimestampNanosecondArray::from(values).with_timezone_opt(tz.clone()),
                ) as ArrayRef,
            }
        }
        DataType::Decimal128(precision, scale) => {
            let values = collect_values(field, cells, |v| match v {
                Value::Decimal128(x) => Some(*x),
                _ => None,
            })?;
            Arc::new(Decimal128Array::from(values).with_precision_and_scale(*precision, *scale)?)
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let values = collect_values(field, cells, |v| match v {
                Value::Utf8(s) => Some(s.as_str()),
                _ => None,
            })?;
            if matches!(field.data_type(), DataType::Utf8) {
                Arc::new(values.into_iter().collect::<StringArray>())
            } else {
                Arc::new(values.into_iter().collect::<LargeStringArray>())
            }
        }
        DataType::Binary | DataType::LargeBinary => {
            let values = collect_values(field, cells, |v| match v {
                Value::Binary(b) => Some(b.as_slice()),
                _ => None,
            })?;
            if matches!(field.data_type(), DataType::Binary) {
                Arc::new(values.into_iter().collect::<BinaryArray>())
            } else {
                Arc::new(values.into_iter().collect::<LargeBinaryArray>())
            }
        }
        DataType::FixedSizeList(child, size) => {
            if depth > 0 {
                return Err(nested_list_error(field.name()));
            }
            let width = usize::try_from(*size).map_err(|_| {
                VqError::TypeMismatch(format!(
                    "field '{}' declares a negative list size",
                    field.name()
                ))
            })?;
            let items = list_items(field, cells, Some(width))?;
            // Every row owns exactly `width` child slots, null rows included.
            let mut flat = Vec::with_capacity(cells.len() * width);
            for row in &items {
                match row {
                    Some(values) => flat.extend(values.iter().map(|v| (!v.is_null()).then_some(v))),
                    None => flat.extend(std::iter::repeat_n(None, width)),
                }
            }
            let values = build_array(child, &flat, true, depth + 1)?;
            Arc::new(FixedSizeListArray::try_new(
                child.clone(),
                *size,
                values,
                row_validity(&items),
            )?)
        }
        DataType::List(child) => {
            if depth > 0 {
                return Err(nested_list_error(field.name()));
            }
            let items = list_items(field, cells, None)?;
            let lengths = items.iter().map(|row| row.map_or(0, <[Value]>::len));
            let offsets = OffsetBuffer::<i32>::from_lengths(lengths);
            let flat = items
                .iter()
                .flatten()
                .flat_map(|values| values.iter().map(|v| (!v.is_null()).then_some(v)))
                .collect::<Vec<_>>();
            let values = build_array(child, &flat, true, depth + 1)?;
            Arc::new(ListArray::try_new(
                child.clone(),
                offsets,
                values,
                row_validity(&items),
            )?)
        }
        other => {
            return Err(VqError::UnsupportedType(format!(
                "no array builder for field '{}' of type {other}",
                field.name()
            )));
        }
    };
    Ok(array)
}

/// Unwraps list cells, checking width and child nullability.
fn list_items<'a>(
    field: &Field,
    cells: &[Option<&'a Value>],
    width: Option<usize>,
) -> Result<Vec<Option<&'a [Value]>>> {
    let child_nullable = match field.data_type() {
        DataType::FixedSizeList(child, _) | DataType::List(child) => child.is_nullable(),
        _ => true,
    };
    cells
        .iter()
        .enumerate()
        .map(|(row, cell)| {
            let Some(value) = cell else {
                return Ok(None);
            };
            let Value::List(values) = value else {
                return Err(mismatch(field, row, value));
            };
            if let Some(width) = width {
                if values.len() != width {
                    return Err(VqError::TypeMismatch(format!(
                        "field '{}' expects {width} elements per row but row {row} holds {}",
                        field.name(),
                        values.len()
                    )));
                }
            }
            if !child_nullable && values.iter().any(Value::is_null) {
                return Err(VqError::TypeMismatch(format!(
                    "field '{}' does not allow null elements (row {row})",
                    field.name()
                )));
            }
            Ok(Some(values.as_slice()))
        })
        .collect()
}

fn row_validity(items: &[Option<&[Value]>]) -> Option<NullBuffer> {
    items
        .iter()
        .any(Option::is_none)
        .then(|| NullBuffer::from(items.iter().map(Option::is_some).collect::<Vec<_>>()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{Array, AsArray};
    use arrow::datatypes::Float32Type;
    use arrow_schema::{DataType, Field, Schema};
    use vq_common::VqError;

    use super::{encode, validate_schema};
    use crate::{Row, Value, row};

    fn vector_schema(dim: i32) -> Arc<Schema> {
        let item = Field::new("item", DataType::Float32, true);
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("vector", DataType::FixedSizeList(Arc::new(item), dim), true),
        ]))
    }

    #[test]
    fn fixed_size_list_is_built_from_inner_values() {
        let rows = vec![
            row!("id" => 1_i64, "vector" => vec![1.0_f32, 2.0]),
            row!("id" => 2_i64, "vector" => vec![3.0_f32, 4.0]),
        ];
        let batch = encode(&rows, vector_schema(2)).expect("encode");
        assert_eq!(batch.num_rows(), 2);

        let vectors = batch.column(1).as_fixed_size_list();
        assert_eq!(vectors.value_length(), 2);
        let flat = vectors.values().as_primitive::<Float32Type>();
        assert_eq!(flat.len(), 4);
        assert_eq!(flat.values().to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn null_vector_rows_keep_their_child_slots() {
        let mut missing = Row::new();
        missing.insert("id".to_string(), Value::Int64(2));
        let rows = vec![row!("id" => 1_i64, "vector" => vec![1.0_f32, 2.0]), missing];
        let batch = encode(&rows, vector_schema(2)).expect("encode");
        let vectors = batch.column(1).as_fixed_size_list();
        assert!(vectors.is_null(1));
        assert_eq!(vectors.values().len(), 4);
    }

    #[test]
    fn value_type_disagreement_is_type_mismatch() {
        let rows = vec![row!("id" => "one", "vector" => vec![1.0_f32, 2.0])];
        let err = encode(&rows, vector_schema(2)).expect_err("mismatch");
        assert!(matches!(err, VqError::TypeMismatch(_)));
        assert!(err.to_string().contains("field 'id' expects Int64"));
    }

    #[test]
    fn wrong_vector_width_is_type_mismatch() {
        let rows = vec![row!("id" => 1_i64, "vector" => vec![1.0_f32, 2.0, 3.0])];
        let err = encode(&rows, vector_schema(2)).expect_err("width");
        assert!(err.to_string().contains("expects 2 elements per row"));
    }

    #[test]
    fn unknown_field_is_type_mismatch() {
        let rows = vec![row!("id" => 1_i64, "color" => "red")];
        let err = encode(&rows, vector_schema(2)).expect_err("unknown field");
        assert!(matches!(err, VqError::TypeMismatch(_)));
        assert!(err.to_string().contains("'color'"));
    }

    #[test]
    fn missing_non_nullable_value_is_rejected() {
        let rows = vec![row!("vector" => vec![1.0_f32, 2.0])];
        let err = encode(&rows, vector_schema(2)).expect_err("non-nullable");
        assert!(err.to_string().contains("is not nullable"));
    }

    #[test]
    fn list_of_lists_is_not_supported() {
        let inner = Field::new("item", DataType::Int32, true);
        let outer = Field::new("item", DataType::List(Arc::new(inner)), true);
        let schema = Schema::new(vec![Field::new("nested", DataType::List(Arc::new(outer)), true)]);
        let err = validate_schema(&schema).expect_err("nested");
        assert!(matches!(err, VqError::NotSupported(_)));
    }

    #[test]
    fn unsupported_logical_type_is_reported() {
        let schema = Schema::new(vec![Field::new(
            "span",
            DataType::Interval(arrow_schema::IntervalUnit::DayTime),
            true,
        )]);
        let err = validate_schema(&schema).expect_err("interval");
        assert!(matches!(err, VqError::UnsupportedType(_)));
    }
}
