//! Query vector payloads.
//!
//! A payload is the little-endian byte image of the query vector plus an
//! element type tag and the logical element count. The byte buffer is
//! zero-padded to a multiple of four bytes.

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{Float16Type, Float32Type, Float64Type};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema};
use half::f16;
use serde::{Deserialize, Serialize};
use vq_codec::{Value, decode_batches, encode_batches};
use vq_common::{Result, VqError};

const PAYLOAD_ALIGN: usize = 4;
const ARROW_PAYLOAD_COLUMN: &str = "vector";

/// Element type tag carried next to the payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorElementType {
    /// IEEE half precision.
    Float16,
    /// IEEE single precision.
    Float32,
    /// IEEE double precision.
    Float64,
    /// An Arrow IPC stream holding one float column.
    Arrow,
}

impl VectorElementType {
    /// Numeric tag used on the wire.
    pub fn tag(self) -> u8 {
        match self {
            VectorElementType::Float16 => 1,
            VectorElementType::Float32 => 2,
            VectorElementType::Float64 => 3,
            VectorElementType::Arrow => 4,
        }
    }
}

/// Immutable encoded query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPayload {
    bytes: Arc<[u8]>,
    len: usize,
    element_type: VectorElementType,
}

/// Anything a caller may hand to `vector(...)`.
#[derive(Debug, Clone)]
pub enum VectorInput {
    /// Half-precision values.
    Float16(Vec<f16>),
    /// Single-precision values.
    Float32(Vec<f32>),
    /// Double-precision values.
    Float64(Vec<f64>),
    /// Dynamic values; must all share one float precision.
    Values(Vec<Value>),
    /// A pre-built Arrow float array.
    Array(ArrayRef),
}

impl From<Vec<f16>> for VectorInput {
    fn from(v: Vec<f16>) -> Self {
        VectorInput::Float16(v)
    }
}

impl From<Vec<f32>> for VectorInput {
    fn from(v: Vec<f32>) -> Self {
        VectorInput::Float32(v)
    }
}

impl From<&[f32]> for VectorInput {
    fn from(v: &[f32]) -> Self {
        VectorInput::Float32(v.to_vec())
    }
}

impl<const N: usize> From<[f32; N]> for VectorInput {
    fn from(v: [f32; N]) -> Self {
        VectorInput::Float32(v.to_vec())
    }
}

impl From<Vec<f64>> for VectorInput {
    fn from(v: Vec<f64>) -> Self {
        VectorInput::Float64(v)
    }
}

impl From<Vec<Value>> for VectorInput {
    fn from(v: Vec<Value>) -> Self {
        VectorInput::Values(v)
    }
}

impl From<ArrayRef> for VectorInput {
    fn from(v: ArrayRef) -> Self {
        VectorInput::Array(v)
    }
}

impl TryFrom<VectorInput> for VectorPayload {
    type Error = VqError;

    fn try_from(input: VectorInput) -> Result<Self> {
        let payload = match input {
            VectorInput::Float16(v) => VectorPayload::from_f16(&v),
            VectorInput::Float32(v) => VectorPayload::from_f32(&v),
            VectorInput::Float64(v) => VectorPayload::from_f64(&v),
            VectorInput::Values(v) => VectorPayload::from_values(&v)?,
            VectorInput::Array(a) => VectorPayload::from_array(a)?,
        };
        if payload.is_empty() {
            return Err(VqError::InvalidInput("query vector is empty".to_string()));
        }
        Ok(payload)
    }
}

impl VectorPayload {
    /// Encodes half-precision values.
    pub fn from_f16(values: &[f16]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes());
        Self::packed(bytes, values.len(), VectorElementType::Float16)
    }

    /// Encodes single-precision values.
    pub fn from_f32(values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes());
        Self::packed(bytes, values.len(), VectorElementType::Float32)
    }

    /// Encodes double-precision values.
    pub fn from_f64(values: &[f64]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes());
        Self::packed(bytes, values.len(), VectorElementType::Float64)
    }

    /// Encodes dynamic values; all elements must share one float precision.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let Some(first) = values.first() else {
            return Err(VqError::InvalidInput("query vector is empty".to_string()));
        };
        let unsupported = |v: &Value| {
            VqError::UnsupportedType(format!(
                "query vector elements must be float16, float32 or float64, got {}",
                v.type_name()
            ))
        };
        match first {
            Value::Float16(_) => values
                .iter()
                .map(|v| match v {
                    Value::Float16(x) => Ok(*x),
                    other => Err(unsupported(other)),
                })
                .collect::<Result<Vec<_>>>()
                .map(|v| Self::from_f16(&v)),
            Value::Float32(_) => values
                .iter()
                .map(|v| match v {
                    Value::Float32(x) => Ok(*x),
                    other => Err(unsupported(other)),
                })
                .collect::<Result<Vec<_>>>()
                .map(|v| Self::from_f32(&v)),
            Value::Float64(_) => values
                .iter()
                .map(|v| match v {
                    Value::Float64(x) => Ok(*x),
                    other => Err(unsupported(other)),
                })
                .collect::<Result<Vec<_>>>()
                .map(|v| Self::from_f64(&v)),
            other => Err(unsupported(other)),
        }
    }

    /// Wraps a float array (or a one-row fixed-size list of floats) as a
    /// pre-encoded Arrow payload.
    pub fn from_array(array: ArrayRef) -> Result<Self> {
        let values = match array.data_type() {
            DataType::FixedSizeList(_, _) if array.len() == 1 => {
                array.as_fixed_size_list().value(0)
            }
            _ => array,
        };
        if !matches!(
            values.data_type(),
            DataType::Float16 | DataType::Float32 | DataType::Float64
        ) {
            return Err(VqError::UnsupportedType(format!(
                "query vector arrays must hold float16, float32 or float64, got {}",
                values.data_type()
            )));
        }
        let schema = Arc::new(Schema::new(vec![Field::new(
            ARROW_PAYLOAD_COLUMN,
            values.data_type().clone(),
            false,
        )]));
        let len = values.len();
        let batch = RecordBatch::try_new(schema.clone(), vec![values])?;
        let bytes = encode_batches(&schema, &[batch])?;
        Ok(Self::packed(bytes, len, VectorElementType::Arrow))
    }

    fn packed(bytes: impl IntoIterator<Item = u8>, len: usize, element_type: VectorElementType) -> Self {
        let mut bytes = bytes.into_iter().collect::<Vec<u8>>();
        let padded = bytes.len().div_ceil(PAYLOAD_ALIGN) * PAYLOAD_ALIGN;
        bytes.resize(padded, 0);
        Self {
            bytes: bytes.into(),
            len,
            element_type,
        }
    }

    /// Encoded bytes, including alignment padding.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Logical element count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the vector has no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Element type tag.
    pub fn element_type(&self) -> VectorElementType {
        self.element_type
    }

    /// Decodes the payload into `f64` values (engine side).
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let width = match self.element_type {
            VectorElementType::Float16 => 2,
            VectorElementType::Float32 => 4,
            VectorElementType::Float64 => 8,
            VectorElementType::Arrow => return self.arrow_values(),
        };
        if self.bytes.len() < self.len * width {
            return Err(VqError::InvalidInput(format!(
                "vector payload holds {} bytes, expected at least {}",
                self.bytes.len(),
                self.len * width
            )));
        }
        let values = self.bytes[..self.len * width]
            .chunks_exact(width)
            .map(|chunk| match self.element_type {
                VectorElementType::Float16 => f16::from_le_bytes([chunk[0], chunk[1]]).to_f64(),
                VectorElementType::Float32 => {
                    f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                }
                _ => f64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6],
                    chunk[7],
                ]),
            })
            .collect();
        Ok(values)
    }

    fn arrow_values(&self) -> Result<Vec<f64>> {
        let batches = decode_batches(&self.bytes)?;
        let mut out = Vec::with_capacity(self.len);
        for batch in &batches {
            let column = batch.column(0);
            match column.data_type() {
                DataType::Float16 => out.extend(
                    column.as_primitive::<Float16Type>().values().iter().map(|v| v.to_f64()),
                ),
                DataType::Float32 => out.extend(
                    column.as_primitive::<Float32Type>().values().iter().map(|v| f64::from(*v)),
                ),
                DataType::Float64 => {
                    out.extend(column.as_primitive::<Float64Type>().values().iter().copied())
                }
                other => {
                    return Err(VqError::UnsupportedType(format!(
                        "arrow vector payload holds {other}"
                    )));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{ArrayRef, Float32Array, Int32Array};
    use half::f16;
    use vq_codec::Value;
    use vq_common::VqError;

    use super::{VectorElementType, VectorPayload};

    #[test]
    fn half_precision_payload_is_padded_to_four_bytes() {
        let payload = VectorPayload::from_f16(&[f16::from_f32(1.0); 3]);
        assert_eq!(payload.len(), 3);
        assert_eq!(payload.bytes().len(), 8);
        assert_eq!(&payload.bytes()[6..], &[0, 0]);
        assert_eq!(payload.to_f64_vec().expect("decode"), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn single_precision_payload_is_little_endian() {
        let payload = VectorPayload::from_f32(&[1.5, -2.0]);
        assert_eq!(payload.element_type(), VectorElementType::Float32);
        assert_eq!(&payload.bytes()[..4], &1.5_f32.to_le_bytes());
        assert_eq!(payload.to_f64_vec().expect("decode"), vec![1.5, -2.0]);
    }

    #[test]
    fn integer_values_are_unsupported() {
        let err = VectorPayload::from_values(&[Value::Int32(1), Value::Int32(2)])
            .expect_err("ints");
        assert!(matches!(err, VqError::UnsupportedType(_)));

        let err = VectorPayload::from_values(&[Value::Float32(1.0), Value::Float64(2.0)])
            .expect_err("mixed");
        assert!(matches!(err, VqError::UnsupportedType(_)));
    }

    #[test]
    fn arrow_arrays_are_carried_pre_encoded() {
        let array: ArrayRef = Arc::new(Float32Array::from(vec![0.25_f32, 0.5]));
        let payload = VectorPayload::from_array(array).expect("arrow");
        assert_eq!(payload.element_type(), VectorElementType::Arrow);
        assert_eq!(payload.bytes().len() % 4, 0);
        assert_eq!(payload.to_f64_vec().expect("decode"), vec![0.25, 0.5]);

        let ints: ArrayRef = Arc::new(Int32Array::from(vec![1, 2]));
        let err = VectorPayload::from_array(ints).expect_err("ints");
        assert!(matches!(err, VqError::UnsupportedType(_)));
    }
}
