use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::executor::block_on;
use tracing::{debug, warn};
use vq_codec::{Row, encode, encode_frame};
use vq_common::{ClientConfig, MetricsRegistry, Result, TableHandle, VqError};
use vq_execution::{
    AddMode, IndexConfig, IndexKind, IndexRequest, Transport, VectorInput, check_reply,
};

use crate::connection::{ConnectionInner, release_detached};
use crate::merge::MergeInsertBuilder;
use crate::query::{Query, VectorQuery};

/// An open table.
///
/// Clones share one engine handle, released by [`Table::close`] or when the
/// last clone is dropped. Dropping inside a tokio runtime schedules the
/// release on it, as for [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct Table {
    inner: Arc<TableInner>,
}

#[derive(Debug)]
struct TableInner {
    name: String,
    handle: TableHandle,
    schema: SchemaRef,
    conn: Arc<ConnectionInner>,
    closed: AtomicBool,
}

impl Drop for TableInner {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) || self.conn.is_closed() {
            return;
        }
        // the connection stays open until the table handle is released
        let conn = self.conn.clone();
        let (name, handle) = (self.name.clone(), self.handle);
        release_detached(async move {
            if let Err(status) = conn.transport().close_table(handle).await {
                warn!(table = %name, %status, "failed to release table handle");
            }
        });
    }
}

impl Table {
    pub(crate) fn new(
        name: &str,
        handle: TableHandle,
        schema: SchemaRef,
        conn: Arc<ConnectionInner>,
    ) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name: name.to_string(),
                handle,
                schema,
                conn,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Table schema as reported by the engine when the table was opened.
    pub fn schema(&self) -> SchemaRef {
        self.inner.schema.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.conn.is_closed()
    }

    /// Engine handle, or `ConnectionClosed` if this table or its connection
    /// was closed.
    pub(crate) fn handle(&self) -> Result<TableHandle> {
        self.inner.conn.handle()?;
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(VqError::ConnectionClosed(format!(
                "table '{}' is closed",
                self.inner.name
            )));
        }
        Ok(self.inner.handle)
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.inner.conn.transport()
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        self.inner.conn.config()
    }

    pub(crate) fn metrics(&self) -> &MetricsRegistry {
        self.inner.conn.metrics()
    }

    /// Count rows, optionally only those matching `filter`.
    pub async fn count_rows(&self, filter: Option<&str>) -> Result<u64> {
        let handle = self.handle()?;
        check_reply(
            self.transport()
                .count_rows(handle, filter.map(str::to_string))
                .await,
            "Failed to count rows",
        )
    }

    /// Write `batches`; returns rows written.
    pub async fn add(&self, batches: Vec<RecordBatch>, mode: AddMode) -> Result<u64> {
        let handle = self.handle()?;
        let frames = batches
            .iter()
            .map(encode_frame)
            .collect::<Result<Vec<_>>>()?;
        let rows = check_reply(
            self.transport().add(handle, frames, mode).await,
            "Failed to add record batch",
        )?;
        self.metrics().record_write(self.name(), "add", rows);
        debug!(table = %self.name(), rows, ?mode, "rows added");
        Ok(rows)
    }

    /// Encode `rows` against the table schema and write them.
    pub async fn add_rows(&self, rows: &[Row], mode: AddMode) -> Result<u64> {
        let batch = encode(rows, self.schema())?;
        self.add(vec![batch], mode).await
    }

    /// Delete rows matching `predicate`; returns rows deleted.
    pub async fn delete(&self, predicate: &str) -> Result<u64> {
        let handle = self.handle()?;
        let rows = check_reply(
            self.transport()
                .delete(handle, predicate.to_string())
                .await,
            "Failed to delete rows",
        )?;
        self.metrics().record_write(self.name(), "delete", rows);
        debug!(table = %self.name(), rows, predicate, "rows deleted");
        Ok(rows)
    }

    /// Start a merge-insert keyed on `on`.
    pub fn merge_insert<S: AsRef<str>>(&self, on: &[S]) -> MergeInsertBuilder {
        MergeInsertBuilder::new(self.clone(), on.iter().map(|s| s.as_ref().to_string()).collect())
    }

    /// Build (or rebuild) an index over `column`.
    pub async fn create_index(&self, column: &str, kind: IndexKind) -> Result<()> {
        self.create_index_with(IndexRequest {
            column: column.to_string(),
            kind,
            metric: None,
            replace: true,
        })
        .await
    }

    pub async fn create_index_with(&self, request: IndexRequest) -> Result<()> {
        let handle = self.handle()?;
        debug!(table = %self.name(), column = %request.column, kind = ?request.kind, "creating index");
        check_reply(
            self.transport().create_index(handle, request).await,
            "Failed to create index",
        )
    }

    pub async fn list_indices(&self) -> Result<Vec<IndexConfig>> {
        let handle = self.handle()?;
        check_reply(
            self.transport().list_indices(handle).await,
            "Failed to list indices",
        )
    }

    /// A plain query over every row.
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    /// Alias of [`Table::query`].
    pub fn search(&self) -> Query {
        self.query()
    }

    /// A nearest-neighbour query for `vector`.
    pub fn vector_search(&self, vector: impl Into<VectorInput>) -> Result<VectorQuery> {
        self.query().vector(vector)
    }

    /// Release the engine handle. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handle = self.inner.conn.handle()?;
        debug!(table = %self.name(), conn = %handle, "closing table");
        check_reply(
            self.transport().close_table(self.inner.handle).await,
            "Failed to close table",
        )
    }

    pub fn count_rows_blocking(&self, filter: Option<&str>) -> Result<u64> {
        block_on(self.count_rows(filter))
    }

    pub fn add_blocking(&self, batches: Vec<RecordBatch>, mode: AddMode) -> Result<u64> {
        block_on(self.add(batches, mode))
    }

    pub fn add_rows_blocking(&self, rows: &[Row], mode: AddMode) -> Result<u64> {
        block_on(self.add_rows(rows, mode))
    }

    pub fn delete_blocking(&self, predicate: &str) -> Result<u64> {
        block_on(self.delete(predicate))
    }

    pub fn create_index_blocking(&self, column: &str, kind: IndexKind) -> Result<()> {
        block_on(self.create_index(column, kind))
    }

    pub fn list_indices_blocking(&self) -> Result<Vec<IndexConfig>> {
        block_on(self.list_indices())
    }

    pub fn close_blocking(&self) -> Result<()> {
        block_on(self.close())
    }
}
