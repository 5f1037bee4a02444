#![deny(missing_docs)]

//! Execution boundary for the `vq` client.
//!
//! Architecture role:
//! - defines the [`transport::Transport`] trait an engine implements
//! - carries request types, the [`status::Status`] convention and vector payloads
//! - turns frame channels into record-batch streams with advisory cancellation
//!
//! Key modules:
//! - [`payload`]
//! - [`schema`]
//! - [`status`]
//! - [`stream`]
//! - [`transport`]

/// Encoded query vectors.
pub mod payload;
/// Output schema derivation.
pub mod schema;
/// Signed status convention.
pub mod status;
/// Record-batch streams and the frame channel.
pub mod stream;
/// Engine boundary trait and request types.
pub mod transport;

pub use payload::{VectorElementType, VectorInput, VectorPayload};
pub use schema::{ScoreColumn, output_schema};
pub use status::{Reply, Status, check_query_reply, check_reply};
pub use stream::{
    CancellationToken, FrameReceiver, FrameSender, RecordBatchStream, SendableRecordBatchStream,
    StreamAdapter, StreamEvent, empty_stream, frame_channel, frame_stream, memory_stream,
};
pub use transport::{
    AddMode, CreateTableMode, DistanceMetric, IndexConfig, IndexKind, IndexRequest,
    MergeInsertRequest, MergeStats, PlanRequest, QueryRequest, Transport, VectorQueryRequest,
};
