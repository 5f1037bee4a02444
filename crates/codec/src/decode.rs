//! Columnar -> row decoding.
//!
//! Nested decoding stops at one level: a list (or fixed-size list) of scalars
//! decodes to [`Value::List`], a list of lists is [`VqError::NotSupported`].

use arrow::array::{Array, AsArray};
use arrow::datatypes::{
    Date32Type, Date64Type, Decimal128Type, Float16Type, Float32Type, Float64Type, Int8Type,
    Int16Type, Int32Type, Int64Type, Time64MicrosecondType, Time64NanosecondType,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt8Type, UInt16Type, UInt32Type, UInt64Type,
};
use arrow_schema::{DataType, TimeUnit};
use vq_common::{Result, VqError};

use crate::value::Value;

/// Decodes every entry of `array`.
///
/// Nulls decode to [`Value::Null`], except binary columns, which yield one
/// byte array per non-null row and skip null entries.
pub fn decode_array(array: &dyn Array) -> Result<Vec<Value>> {
    check_nesting(array.data_type())?;
    match array.data_type() {
        DataType::Binary | DataType::LargeBinary => (0..array.len())
            .filter(|idx| array.is_valid(*idx))
            .map(|idx| decode_value(array, idx))
            .collect(),
        _ => (0..array.len())
            .map(|idx| decode_value(array, idx))
            .collect(),
    }
}

/// Decodes the entry at `idx`; nulls decode to [`Value::Null`].
pub fn decode_value(array: &dyn Array, idx: usize) -> Result<Value> {
    if array.is_null(idx) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => Value::Boolean(array.as_boolean().value(idx)),
        DataType::Int8 => Value::Int8(array.as_primitive::<Int8Type>().value(idx)),
        DataType::Int16 => Value::Int16(array.as_primitive::<Int16Type>().value(idx)),
        DataType::Int32 => Value::Int32(array.as_primitive::<Int32Type>().value(idx)),
        DataType::Int64 => Value::Int64(array.as_primitive::<Int64Type>().value(idx)),
        DataType::UInt8 => Value::UInt8(array.as_primitive::<UInt8Type>().value(idx)),
        DataType::UInt16 => Value::UInt16(array.as_primitive::<UInt16Type>().value(idx)),
        DataType::UInt32 => Value::UInt32(array.as_primitive::<UInt32Type>().value(idx)),
        DataType::UInt64 => Value::UInt64(array.as_primitive::<UInt64Type>().value(idx)),
        DataType::Float16 => Value::Float16(array.as_primitive::<Float16Type>().value(idx)),
        DataType::Float32 => Value::Float32(array.as_primitive::<Float32Type>().value(idx)),
        DataType::Float64 => Value::Float64(array.as_primitive::<Float64Type>().value(idx)),
        DataType::Date32 => Value::Date32(array.as_primitive::<Date32Type>().value(idx)),
        DataType::Date64 => Value::Date64(array.as_primitive::<Date64Type>().value(idx)),
        DataType::Time64(TimeUnit::Microsecond) => {
            Value::Time64(array.as_primitive::<Time64MicrosecondType>().value(idx))
        }
        DataType::Time64(TimeUnit::Nanosecond) => {
            Value::Time64(array.as_primitive::<Time64NanosecondType>().value(idx))
        }
        DataType::Timestamp(unit, _) => Value::Timestamp(match unit {
            TimeUnit::Second => array.as_primitive::<TimestampSecondType>().value(idx),
            TimeUnit::Millisecond => array.as_primitive::<TimestampMillisecondType>().value(idx),
            TimeUnit::Microsecond => array.as_primitive::<TimestampMicrosecondType>().value(idx),
            TimeUnit::Nanosecond => array.as_primitive::<TimestampNanosecondType>().value(idx),
        }),
        DataType::Decimal128(_, _) => {
            Value::Decimal128(array.as_primitive::<Decimal128Type>().value(idx))
        }
        DataType::Utf8 => Value::Utf8(array.as_string::<i32>().value(idx).to_string()),
        DataType::LargeUtf8 => Value::Utf8(array.as_string::<i64>().value(idx).to_string()),
        DataType::Binary => Value::Binary(array.as_binary::<i32>().value(idx).to_vec()),
        DataType::LargeBinary => Value::Binary(array.as_binary::<i64>().value(idx).to_vec()),
        DataType::FixedSizeList(_, _) => {
            check_nesting(array.data_type())?;
            let child = array.as_fixed_size_list().value(idx);
            Value::List(decode_array(child.as_ref())?)
        }
        DataType::List(_) => {
            check_nesting(array.data_type())?;
            let child = array.as_list::<i32>().value(idx);
            Value::List(decode_array(child.as_ref())?)
        }
        other => {
            return Err(VqError::UnsupportedType(format!(
                "no decoder for arrays of type {other}"
            )));
        }
    };
    Ok(value)
}

fn check_nesting(data_type: &DataType) -> Result<()> {
    if let DataType::FixedSizeList(child, _) | DataType::List(child) = data_type {
        if matches!(
            child.data_type(),
            DataType::FixedSizeList(_, _)
                | DataType::List(_)
                | DataType::LargeList(_)
                | DataType::Struct(_)
        ) {
            return Err(VqError::NotSupported(format!(
                "decoding {data_type} requires more than one level of nesting"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{
        ArrayRef, BinaryArray, FixedSizeListBuilder, Float32Builder, Int32Builder, ListBuilder,
        StringArray,
    };
    use vq_common::VqError;

    use super::{decode_array, decode_value};
    use crate::Value;

    #[test]
    fn string_columns_decode_every_row() {
        let array = StringArray::from(vec![Some("a"), None, Some("c")]);
        let values = decode_array(&array).expect("decode");
        assert_eq!(
            values,
            vec![
                Value::Utf8("a".to_string()),
                Value::Null,
                Value::Utf8("c".to_string())
            ]
        );
    }

    #[test]
    fn binary_columns_skip_null_entries() {
        let array = BinaryArray::from(vec![Some(&b"ab"[..]), None, Some(&b"c"[..])]);
        let values = decode_array(&array).expect("decode");
        assert_eq!(
            values,
            vec![Value::Binary(b"ab".to_vec()), Value::Binary(b"c".to_vec())]
        );
    }

    #[test]
    fn fixed_size_list_decodes_one_level() {
        let mut builder = FixedSizeListBuilder::new(Float32Builder::new(), 2);
        for v in [[1.0_f32, 2.0], [3.0, 4.0]] {
            for x in v {
                builder.values().append_value(x);
            }
            builder.append(true);
        }
        let array = builder.finish();
        let value = decode_value(&array, 1).expect("decode");
        assert_eq!(value, Value::from(vec![3.0_f32, 4.0]));
    }

    #[test]
    fn list_of_lists_is_not_supported() {
        let mut builder = ListBuilder::new(ListBuilder::new(Int32Builder::new()));
        builder.values().values().append_value(1);
        builder.values().append(true);
        builder.append(true);
        let array: ArrayRef = Arc::new(builder.finish());
        let err = decode_array(array.as_ref()).expect_err("nested");
        assert!(matches!(err, VqError::NotSupported(_)));
    }
}
