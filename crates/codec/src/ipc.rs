//! Arrow IPC encodings exchanged with the engine.
//!
//! Two shapes cross the boundary:
//! - schema-only streams, used by table create/open handshakes;
//! - batch frames: a `u32` little-endian schema length, the schema-only
//!   stream, then an IPC stream carrying exactly one batch.

use std::io::Cursor;

use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use vq_common::{Result, VqError};

const FRAME_HEADER_LEN: usize = 4;

/// Serializes `schema` as an IPC stream with no batches.
pub fn encode_schema_only(schema: &Schema) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = StreamWriter::try_new(&mut out, schema)?;
    writer.finish()?;
    drop(writer);
    Ok(out)
}

/// Reads the schema from an IPC stream (batches, if any, are ignored).
pub fn decode_schema(bytes: &[u8]) -> Result<SchemaRef> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.schema())
}

/// Serializes `batches` as one IPC stream.
pub fn encode_batches(schema: &Schema, batches: &[RecordBatch]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut writer = StreamWriter::try_new(&mut out, schema)?;
    for batch in batches {
        writer.write(batch)?;
    }
    writer.finish()?;
    drop(writer);
    Ok(out)
}

/// Reads every batch from an IPC stream.
pub fn decode_batches(bytes: &[u8]) -> Result<Vec<RecordBatch>> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    Ok(reader.collect::<std::result::Result<Vec<_>, _>>()?)
}

/// Wraps one batch in a schema-length-prefixed frame.
pub fn encode_frame(batch: &RecordBatch) -> Result<Vec<u8>> {
    let schema = batch.schema();
    let schema_bytes = encode_schema_only(&schema)?;
    let body = encode_batches(&schema, std::slice::from_ref(batch))?;
    let schema_len = u32::try_from(schema_bytes.len()).map_err(|_| {
        VqError::InvalidInput(format!(
            "schema of {} bytes does not fit a frame header",
            schema_bytes.len()
        ))
    })?;

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + schema_bytes.len() + body.len());
    out.extend_from_slice(&schema_len.to_le_bytes());
    out.extend_from_slice(&schema_bytes);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Reads only the schema prefix of a frame.
pub fn frame_schema(bytes: &[u8]) -> Result<SchemaRef> {
    let (schema_bytes, _) = split_frame(bytes)?;
    decode_schema(schema_bytes)
}

/// Decodes a frame back into its batch.
pub fn decode_frame(bytes: &[u8]) -> Result<RecordBatch> {
    let (schema_bytes, body) = split_frame(bytes)?;
    let schema = decode_schema(schema_bytes)?;
    let mut batches = decode_batches(body)?;
    if batches.len() != 1 {
        return Err(VqError::InvalidInput(format!(
            "frame must carry exactly one batch, found {}",
            batches.len()
        )));
    }
    let batch = batches.remove(0);
    if batch.schema().fields() != schema.fields() {
        return Err(VqError::SchemaMismatch(
            "frame batch does not match its schema prefix".to_string(),
        ));
    }
    Ok(batch)
}

fn split_frame(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    if bytes.len() < FRAME_HEADER_LEN {
        return Err(VqError::InvalidInput(
            "frame is too small to contain header".to_string(),
        ));
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let rest = &bytes[FRAME_HEADER_LEN..];
    if rest.len() < len {
        return Err(VqError::InvalidInput(
            "frame schema length is invalid".to_string(),
        ));
    }
    Ok(rest.split_at(len))
}
