//! Typed, fluent client for a columnar vector database.
//!
//! Architecture role:
//! - [`Connection`] and [`Table`] manage engine handles and writes
//! - [`Query`], [`VectorQuery`] and [`HybridQuery`] build and run searches
//! - [`rerank`] fuses result sets from several searches
//!
//! Rows go in as [`Row`]s or Arrow batches and come back as Arrow batches,
//! a batch stream, or materialized rows.
//!
//! ```no_run
//! use vq_client::{Connection, ExecutableQuery, QueryBase};
//!
//! # fn main() -> vq_client::Result<()> {
//! let conn = Connection::memory_blocking("memory://docs")?;
//! let table = conn.open_table_blocking("docs")?;
//! let hits = table
//!     .vector_search(vec![0.1_f32, 0.2, 0.3])?
//!     .only_if("lang = 'en'")
//!     .limit(5)
//!     .to_list_blocking()?;
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```

mod connection;
mod exec;
mod merge;
mod query;
pub mod rerank;
mod table;

pub use connection::Connection;
pub use merge::MergeInsertBuilder;
pub use query::{
    ExecutableQuery, ExecuteOptions, HybridQuery, Query, QueryBase, QueryKind, QuerySpec,
    VectorQuery,
};
pub use rerank::{Reranker, ReturnScore, RrfReranker};
pub use table::Table;

pub use vq_codec::{Row, Value, row};
pub use vq_common::{ClientConfig, Result, VqError};
pub use vq_execution::{
    AddMode, CancellationToken, CreateTableMode, DistanceMetric, IndexConfig, IndexKind,
    IndexRequest, MergeStats, SendableRecordBatchStream, Transport, VectorElementType,
    VectorInput, VectorPayload,
};
pub use vq_storage::MemoryEngine;
