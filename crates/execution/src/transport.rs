//! The request/response boundary between the client and an engine.
//!
//! Every call follows the [`Status`] convention: a failure carries a negative
//! code and a message, a success carries its value. Query calls stream their
//! results through a [`FrameSender`] and report the terminal status there.

use std::fmt::Debug;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use vq_common::{ConnectionHandle, TableHandle};

use crate::payload::VectorPayload;
use crate::status::Reply;
use crate::stream::FrameSender;

/// Distance function used by vector search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Squared euclidean distance.
    L2,
    /// `1 - cosine similarity`.
    Cosine,
    /// Negated inner product.
    Dot,
    /// Count of differing elements.
    Hamming,
}

impl DistanceMetric {
    /// Lowercase name used in plans and index options.
    pub fn name(self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Hamming => "hamming",
        }
    }
}

/// Behaviour of table creation when the name already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateTableMode {
    /// Fail if the table exists.
    #[default]
    Create,
    /// Replace an existing table.
    Overwrite,
    /// Open the existing table instead.
    ExistOk,
}

/// Behaviour of `add` with respect to existing rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddMode {
    /// Keep existing rows.
    #[default]
    Append,
    /// Replace all existing rows.
    Overwrite,
}

/// Index families understood by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Let the engine choose from the column type.
    #[default]
    Auto,
    /// Vector index (inverted file + product quantization).
    IvfPq,
    /// Scalar B-tree index.
    BTree,
    /// Full-text inverted index.
    Fts,
}

/// Index creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRequest {
    /// Indexed column.
    pub column: String,
    /// Requested index family.
    pub kind: IndexKind,
    /// Metric for vector indices.
    pub metric: Option<DistanceMetric>,
    /// Replace an existing index on the same column.
    pub replace: bool,
}

/// Index description returned by `list_indices`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Engine-assigned index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Resolved index family (never `Auto`).
    pub kind: IndexKind,
}

/// Merge-insert (upsert) request; source rows travel as frames next to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeInsertRequest {
    /// Key columns joining source and target rows.
    pub on: Vec<String>,
    /// Overwrite matched target rows with source values.
    pub when_matched_update_all: bool,
    /// Optional predicate restricting which matched rows are updated.
    pub matched_update_filter: Option<String>,
    /// Insert source rows without a match.
    pub when_not_matched_insert_all: bool,
    /// Delete target rows without a source match.
    pub when_not_matched_by_source_delete: bool,
    /// Optional predicate restricting which unmatched target rows are deleted.
    pub source_delete_filter: Option<String>,
}

/// Row counts affected by a merge-insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Source rows inserted.
    pub inserted: u64,
    /// Target rows updated.
    pub updated: u64,
    /// Target rows deleted.
    pub deleted: u64,
}

/// Parameters shared by every query request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    /// Row cap; 0 is unbounded.
    pub limit: usize,
    /// Opaque filter predicate.
    pub filter: Option<String>,
    /// Append `_rowid` to the output.
    pub with_row_id: bool,
    /// Projected columns; empty selects every column.
    pub columns: Vec<String>,
    /// Full-text query string.
    pub full_text: Option<String>,
    /// Max rows per streamed batch.
    pub batch_size: usize,
}

/// A nearest-neighbour request.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQueryRequest {
    /// Shared query parameters.
    pub base: QueryRequest,
    /// Encoded query vector.
    pub vector: VectorPayload,
    /// Vector column; the engine infers it when the table has exactly one.
    pub column: Option<String>,
    /// Metric; `None` uses the engine default.
    pub metric: Option<DistanceMetric>,
    /// Partitions probed by an approximate index.
    pub nprobes: u32,
    /// Re-ranking factor for an approximate index.
    pub refine_factor: Option<u32>,
}

/// A request whose plan `explain_plan` describes.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanRequest {
    /// A filtered or full-text query.
    Query(QueryRequest),
    /// A vector query.
    Vector(VectorQueryRequest),
}

/// Engine boundary.
///
/// Request/response calls return a boxed future resolving to a [`Reply`].
/// Streaming calls return immediately; the engine pushes frames into the
/// sender and finishes it with exactly one terminal status, checking the
/// sender's cancellation before every frame.
pub trait Transport: Send + Sync + Debug {
    /// Open (or create) the database at `uri`.
    fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Reply<ConnectionHandle>>;

    /// Release a connection handle.
    fn disconnect<'a>(&'a self, conn: ConnectionHandle) -> BoxFuture<'a, Reply<()>>;

    /// Names of every table, sorted.
    fn table_names<'a>(&'a self, conn: ConnectionHandle) -> BoxFuture<'a, Reply<Vec<String>>>;

    /// Create a table from an IPC schema-only stream and open it.
    fn create_table<'a>(
        &'a self,
        conn: ConnectionHandle,
        name: &'a str,
        schema_ipc: Vec<u8>,
        mode: CreateTableMode,
    ) -> BoxFuture<'a, Reply<TableHandle>>;

    /// Open an existing table.
    fn open_table<'a>(
        &'a self,
        conn: ConnectionHandle,
        name: &'a str,
    ) -> BoxFuture<'a, Reply<TableHandle>>;

    /// IPC schema-only stream of an open table.
    fn table_schema<'a>(&'a self, table: TableHandle) -> BoxFuture<'a, Reply<Vec<u8>>>;

    /// Drop a table by name.
    fn drop_table<'a>(&'a self, conn: ConnectionHandle, name: &'a str) -> BoxFuture<'a, Reply<()>>;

    /// Release a table handle.
    fn close_table<'a>(&'a self, table: TableHandle) -> BoxFuture<'a, Reply<()>>;

    /// Append (or overwrite with) the rows carried by `frames`; returns rows written.
    fn add<'a>(
        &'a self,
        table: TableHandle,
        frames: Vec<Vec<u8>>,
        mode: AddMode,
    ) -> BoxFuture<'a, Reply<u64>>;

    /// Count rows, optionally matching `filter`.
    fn count_rows<'a>(
        &'a self,
        table: TableHandle,
        filter: Option<String>,
    ) -> BoxFuture<'a, Reply<u64>>;

    /// Delete rows matching `predicate`; returns rows deleted.
    fn delete<'a>(&'a self, table: TableHandle, predicate: String) -> BoxFuture<'a, Reply<u64>>;

    /// Upsert the rows carried by `frames`.
    fn merge_insert<'a>(
        &'a self,
        table: TableHandle,
        request: MergeInsertRequest,
        frames: Vec<Vec<u8>>,
    ) -> BoxFuture<'a, Reply<MergeStats>>;

    /// Build an index.
    fn create_index<'a>(
        &'a self,
        table: TableHandle,
        request: IndexRequest,
    ) -> BoxFuture<'a, Reply<()>>;

    /// Describe existing indices.
    fn list_indices<'a>(&'a self, table: TableHandle) -> BoxFuture<'a, Reply<Vec<IndexConfig>>>;

    /// Stream a filtered or full-text query.
    fn query(&self, table: TableHandle, request: QueryRequest, sink: FrameSender);

    /// Stream a vector query.
    fn vector_query(&self, table: TableHandle, request: VectorQueryRequest, sink: FrameSender);

    /// Describe the plan of a request without returning rows.
    fn explain_plan<'a>(
        &'a self,
        table: TableHandle,
        request: PlanRequest,
        verbose: bool,
    ) -> BoxFuture<'a, Reply<String>>;
}
