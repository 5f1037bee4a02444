//! Merge-insert builder.

use arrow::record_batch::RecordBatch;
use futures::executor::block_on;
use tracing::debug;
use vq_codec::{Row, encode, encode_frame};
use vq_common::Result;
use vq_execution::{MergeInsertRequest, MergeStats, check_reply};

use crate::table::Table;

/// Configures an upsert keyed on one or more columns.
///
/// With no clause enabled the operation changes nothing; the usual upsert is
/// `when_matched_update_all(None).when_not_matched_insert_all()`.
#[derive(Debug, Clone)]
pub struct MergeInsertBuilder {
    table: Table,
    request: MergeInsertRequest,
}

impl MergeInsertBuilder {
    pub(crate) fn new(table: Table, on: Vec<String>) -> Self {
        Self {
            table,
            request: MergeInsertRequest {
                on,
                ..MergeInsertRequest::default()
            },
        }
    }

    /// Overwrite matched rows, optionally only those matching `filter`.
    pub fn when_matched_update_all(mut self, filter: Option<&str>) -> Self {
        self.request.when_matched_update_all = true;
        self.request.matched_update_filter = filter.map(str::to_string);
        self
    }

    /// Insert source rows that have no match.
    pub fn when_not_matched_insert_all(mut self) -> Self {
        self.request.when_not_matched_insert_all = true;
        self
    }

    /// Delete target rows that no source row matches, optionally only those
    /// matching `filter`.
    pub fn when_not_matched_by_source_delete(mut self, filter: Option<&str>) -> Self {
        self.request.when_not_matched_by_source_delete = true;
        self.request.source_delete_filter = filter.map(str::to_string);
        self
    }

    pub fn request(&self) -> &MergeInsertRequest {
        &self.request
    }

    pub async fn execute(self, batches: Vec<RecordBatch>) -> Result<MergeStats> {
        let handle = self.table.handle()?;
        let frames = batches
            .iter()
            .map(encode_frame)
            .collect::<Result<Vec<_>>>()?;
        let stats = check_reply(
            self.table
                .transport()
                .merge_insert(handle, self.request, frames)
                .await,
            "Failed to merge insert",
        )?;
        let rows = stats.inserted + stats.updated + stats.deleted;
        self.table
            .metrics()
            .record_write(self.table.name(), "merge_insert", rows);
        debug!(
            table = %self.table.name(),
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            "merge insert done"
        );
        Ok(stats)
    }

    /// Encode `rows` against the table schema and merge them.
    pub async fn execute_rows(self, rows: &[Row]) -> Result<MergeStats> {
        let batch = encode(rows, self.table.schema())?;
        self.execute(vec![batch]).await
    }

    pub fn execute_blocking(self, batches: Vec<RecordBatch>) -> Result<MergeStats> {
        block_on(self.execute(batches))
    }

    pub fn execute_rows_blocking(self, rows: &[Row]) -> Result<MergeStats> {
        block_on(self.execute_rows(rows))
    }
}
