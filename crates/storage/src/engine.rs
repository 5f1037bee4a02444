//! In-process engine implementing the transport boundary.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use arrow::array::{ArrayRef, Float32Array, UInt32Array};
use arrow::compute::kernels::boolean::not;
use arrow::compute::{filter_record_batch, take_record_batch};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::{DataType, SchemaRef};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, info, warn};
use vq_codec::{decode_frame, decode_schema, encode_frame, encode_schema_only, validate_schema};
use vq_common::{
    ConnectionHandle, DISTANCE_COLUMN, Result, SCORE_COLUMN, TableHandle, VqError,
};
use vq_execution::{
    AddMode, CreateTableMode, DistanceMetric, FrameSender, IndexConfig, IndexKind, IndexRequest,
    MergeInsertRequest, MergeStats, PlanRequest, QueryRequest, Reply, ScoreColumn, Status,
    Transport, VectorQueryRequest, output_schema,
};

use crate::catalog::{Database, StoredTable, check_compatible};
use crate::explain::{explain_request, fts_columns};
use crate::filter::Predicate;
use crate::merge::merge_insert;
use crate::search::{bm25_scores, resolve_vector_column, vector_distances};

/// Upper bound on blocking threads producing query frames in the shared pool.
const QUERY_POOL_THREADS: usize = 8;

static QUERY_POOL: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

/// Handle to the process-wide query pool, built on first use and never torn
/// down.
fn shared_pool() -> Result<Handle> {
    QUERY_POOL
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(QUERY_POOL_THREADS)
                .thread_name("vq-memory-query")
                .build()
                .map_err(|e| e.to_string())
        })
        .as_ref()
        .map(|runtime| runtime.handle().clone())
        .map_err(|e| VqError::Remote(format!("memory engine query pool unavailable: {e}")))
}

/// Thread-safe in-memory engine. Clones share state, so two connections
/// opened on the same URI through clones of one engine see the same tables.
///
/// Query producers run as blocking tasks on a tokio runtime: the one given to
/// [`MemoryEngine::with_runtime`], or a small process-wide pool otherwise.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
    runtime: Option<Handle>,
}

#[derive(Debug, Default)]
struct EngineState {
    databases: HashMap<String, Database>,
    connections: HashMap<i64, String>,
    tables: HashMap<i64, OpenTable>,
    next_handle: i64,
}

#[derive(Debug, Clone)]
struct OpenTable {
    conn: i64,
    uri: String,
    name: String,
}

impl EngineState {
    fn allocate(&mut self) -> i64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn database(&mut self, conn: ConnectionHandle) -> Result<(&str, &mut Database)> {
        let uri = self
            .connections
            .get(&conn.0)
            .ok_or_else(|| VqError::InvalidInput(format!("{conn} is not open")))?;
        let db = self
            .databases
            .get_mut(uri)
            .ok_or_else(|| VqError::InvalidInput(format!("database '{uri}' does not exist")))?;
        Ok((uri.as_str(), db))
    }

    fn open_table(&self, table: TableHandle) -> Result<&OpenTable> {
        self.tables
            .get(&table.0)
            .ok_or_else(|| VqError::InvalidInput(format!("{table} is not open")))
    }

    fn table(&self, table: TableHandle) -> Result<(&str, &StoredTable)> {
        let open = self.open_table(table)?;
        let db = self
            .databases
            .get(&open.uri)
            .ok_or_else(|| VqError::InvalidInput(format!("database '{}' does not exist", open.uri)))?;
        Ok((open.name.as_str(), db.get(&open.name)?))
    }

    fn table_mut(&mut self, table: TableHandle) -> Result<(String, &mut StoredTable)> {
        let open = self.open_table(table)?.clone();
        let db = self
            .databases
            .get_mut(&open.uri)
            .ok_or_else(|| VqError::InvalidInput(format!("database '{}' does not exist", open.uri)))?;
        let stored = db.get_mut(&open.name)?;
        Ok((open.name, stored))
    }

    fn register_table(&mut self, conn: ConnectionHandle, uri: &str, name: &str) -> TableHandle {
        let handle = self.allocate();
        self.tables.insert(
            handle,
            OpenTable {
                conn: conn.0,
                uri: uri.to_string(),
                name: name.to_string(),
            },
        );
        TableHandle(handle)
    }
}

enum Search {
    Plain,
    FullText(String),
    Vector {
        column: Option<String>,
        query: Vec<f64>,
        metric: DistanceMetric,
    },
}

fn reply<T>(result: Result<T>) -> Reply<T> {
    result.map_err(|e| Status::error(e.to_string()))
}

fn decode_frames(frames: &[Vec<u8>]) -> Result<Vec<RecordBatch>> {
    frames.iter().map(|f| decode_frame(f)).collect()
}

impl MemoryEngine {
    /// New engine with no databases.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection and table handles currently open.
    pub fn open_handles(&self) -> usize {
        let state = self.state.lock();
        state.connections.len() + state.tables.len()
    }

    /// New engine whose queries run on `runtime`'s blocking pool.
    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            runtime: Some(runtime),
            ..Self::default()
        }
    }

    fn connect_sync(&self, uri: &str) -> Result<ConnectionHandle> {
        let mut state = self.state.lock();
        state.databases.entry(uri.to_string()).or_default();
        let handle = state.allocate();
        state.connections.insert(handle, uri.to_string());
        info!(uri, handle, "memory engine connection opened");
        Ok(ConnectionHandle(handle))
    }

    fn disconnect_sync(&self, conn: ConnectionHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.connections.remove(&conn.0).is_none() {
            return Err(VqError::InvalidInput(format!("{conn} is not open")));
        }
        state.tables.retain(|_, t| t.conn != conn.0);
        info!(handle = conn.0, "memory engine connection closed");
        Ok(())
    }

    fn create_table_sync(
        &self,
        conn: ConnectionHandle,
        name: &str,
        schema_ipc: &[u8],
        mode: CreateTableMode,
    ) -> Result<TableHandle> {
        let schema = decode_schema(schema_ipc)?;
        validate_schema(&schema)?;
        let mut state = self.state.lock();
        let (uri, db) = state.database(conn)?;
        let uri = uri.to_string();
        match mode {
            CreateTableMode::Create if db.contains(name) => {
                return Err(VqError::InvalidInput(format!("table '{name}' already exists")));
            }
            CreateTableMode::ExistOk if db.contains(name) => {}
            _ => db.put(name, StoredTable::new(schema)?),
        }
        debug!(table = name, ?mode, "memory engine table created");
        Ok(state.register_table(conn, &uri, name))
    }

    fn open_table_sync(&self, conn: ConnectionHandle, name: &str) -> Result<TableHandle> {
        let mut state = self.state.lock();
        let (uri, db) = state.database(conn)?;
        db.get(name)?;
        let uri = uri.to_string();
        Ok(state.register_table(conn, &uri, name))
    }

    fn drop_table_sync(&self, conn: ConnectionHandle, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let (_, db) = state.database(conn)?;
        db.remove(name)?;
        debug!(table = name, "memory engine table dropped");
        Ok(())
    }

    fn close_table_sync(&self, table: TableHandle) -> Result<()> {
        let mut state = self.state.lock();
        state
            .tables
            .remove(&table.0)
            .map(|_| ())
            .ok_or_else(|| VqError::InvalidInput(format!("{table} is not open")))
    }

    fn add_sync(&self, table: TableHandle, frames: &[Vec<u8>], mode: AddMode) -> Result<u64> {
        let batches = decode_frames(frames)?;
        let mut state = self.state.lock();
        let (name, stored) = state.table_mut(table)?;
        let mut next = stored.clone();
        let mut rows = 0;
        let mut batches = batches.iter();
        if mode == AddMode::Overwrite {
            let empty = RecordBatch::new_empty(next.schema.clone());
            rows += next.overwrite(batches.next().unwrap_or(&empty))?;
        }
        for batch in batches {
            rows += next.append(batch)?;
        }
        *stored = next;
        debug!(table = %name, rows, ?mode, "memory engine rows added");
        Ok(rows)
    }

    fn count_rows_sync(&self, table: TableHandle, filter: Option<&str>) -> Result<u64> {
        let state = self.state.lock();
        let (_, stored) = state.table(table)?;
        match filter {
            None => Ok(stored.num_rows() as u64),
            Some(filter) => {
                let mask = Predicate::parse(filter)?.evaluate(&stored.data)?;
                Ok(mask.true_count() as u64)
            }
        }
    }

    fn delete_sync(&self, table: TableHandle, predicate: &str) -> Result<u64> {
        let predicate = Predicate::parse(predicate)?;
        let mut state = self.state.lock();
        let (name, stored) = state.table_mut(table)?;
        let mask = predicate.evaluate(&stored.data)?;
        let deleted = mask.true_count() as u64;
        stored.data = filter_record_batch(&stored.data, &not(&mask)?)?;
        debug!(table = %name, deleted, "memory engine rows deleted");
        Ok(deleted)
    }

    fn merge_insert_sync(
        &self,
        table: TableHandle,
        request: &MergeInsertRequest,
        frames: &[Vec<u8>],
    ) -> Result<MergeStats> {
        let batches = decode_frames(frames)?;
        let mut state = self.state.lock();
        let (name, stored) = state.table_mut(table)?;
        for batch in &batches {
            check_compatible(&stored.schema, &batch.schema())?;
        }
        let source = if batches.is_empty() {
            RecordBatch::new_empty(stored.schema.clone())
        } else {
            arrow::compute::concat_batches(&batches[0].schema(), &batches)?
        };
        let mut next = stored.clone();
        let stats = merge_insert(&mut next, request, &source)?;
        *stored = next;
        debug!(
            table = %name,
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            "memory engine merge insert"
        );
        Ok(stats)
    }

    fn create_index_sync(&self, table: TableHandle, request: &IndexRequest) -> Result<()> {
        let mut state = self.state.lock();
        let (name, stored) = state.table_mut(table)?;
        let field = stored.schema.field_with_name(&request.column).map_err(|_| {
            VqError::MissingColumn(format!("index column '{}' does not exist", request.column))
        })?;
        let data_type = field.data_type().clone();
        let is_text = matches!(data_type, DataType::Utf8 | DataType::LargeUtf8);
        let is_vector = matches!(data_type, DataType::FixedSizeList(_, _));
        let kind = match request.kind {
            IndexKind::Auto if is_vector => IndexKind::IvfPq,
            IndexKind::Auto => IndexKind::BTree,
            IndexKind::IvfPq if !is_vector => {
                return Err(VqError::InvalidInput(format!(
                    "vector index requires a fixed-size-list column, '{}' is {data_type}",
                    request.column
                )));
            }
            IndexKind::Fts if !is_text => {
                return Err(VqError::InvalidInput(format!(
                    "full-text index requires a string column, '{}' is {data_type}",
                    request.column
                )));
            }
            IndexKind::BTree if is_vector => {
                return Err(VqError::InvalidInput(format!(
                    "scalar index cannot cover vector column '{}'",
                    request.column
                )));
            }
            other => other,
        };
        if stored.index_on(&request.column).is_some() {
            if !request.replace {
                return Err(VqError::InvalidInput(format!(
                    "column '{}' is already indexed",
                    request.column
                )));
            }
            stored
                .indices
                .retain(|idx| !idx.columns.iter().any(|c| c == &request.column));
        }
        stored.indices.push(IndexConfig {
            name: format!("{}_idx", request.column),
            columns: vec![request.column.clone()],
            kind,
        });
        debug!(table = %name, column = %request.column, ?kind, "memory engine index created");
        Ok(())
    }

    fn snapshot(&self, table: TableHandle) -> Result<(String, StoredTable)> {
        let state = self.state.lock();
        let (name, stored) = state.table(table)?;
        Ok((name.to_string(), stored.clone()))
    }

    fn spawn_query(&self, table: TableHandle, base: QueryRequest, search: Search, sink: FrameSender) {
        let (name, snapshot) = match self.snapshot(table) {
            Ok(found) => found,
            Err(e) => {
                sink.finish(Status::error(e.to_string()));
                return;
            }
        };
        let pool = match self.runtime.clone().map_or_else(shared_pool, Ok) {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "memory engine cannot schedule query");
                sink.finish(Status::error(e.to_string()));
                return;
            }
        };
        // a task dropped by a shutting-down runtime drops the sink, which
        // reports an error status
        drop(pool.spawn_blocking(move || produce(&name, &snapshot, &base, search, sink)));
    }
}

/// Execute one request and stream the result as `batch_size` frames.
fn produce(name: &str, snapshot: &StoredTable, base: &QueryRequest, search: Search, mut sink: FrameSender) {
    let batch = match execute(snapshot, base, search) {
        Ok(batch) => batch,
        Err(e) => {
            sink.finish(Status::error(e.to_string()));
            return;
        }
    };
    let step = base.batch_size.max(1);
    let mut offset = 0;
    let mut frames = 0usize;
    while offset < batch.num_rows() {
        if sink.is_cancelled() {
            debug!(table = %name, frames, "memory engine query cancelled");
            sink.finish(Status::error("query cancelled"));
            return;
        }
        let len = step.min(batch.num_rows() - offset);
        let frame = match encode_frame(&batch.slice(offset, len)) {
            Ok(frame) => frame,
            Err(e) => {
                sink.finish(Status::error(e.to_string()));
                return;
            }
        };
        if !sink.send_frame(frame) {
            debug!(table = %name, frames, "memory engine consumer went away");
            sink.finish(Status::error("query cancelled"));
            return;
        }
        frames += 1;
        offset += len;
    }
    debug!(table = %name, rows = batch.num_rows(), frames, "memory engine query done");
    sink.finish(Status::ok(0));
}

/// Run one request against a snapshot and return all matching rows in order.
fn execute(table: &StoredTable, base: &QueryRequest, search: Search) -> Result<RecordBatch> {
    let score = match &search {
        Search::Vector { .. } => ScoreColumn::Distance,
        Search::FullText(_) => ScoreColumn::Score,
        Search::Plain => ScoreColumn::None,
    };
    let schema = output_schema(&table.schema, base, score)?;
    let mut data = table.data.clone();
    if let Some(filter) = &base.filter {
        let mask = Predicate::parse(filter)?.evaluate(&data)?;
        data = filter_record_batch(&data, &mask)?;
    }

    let (mut order, scores): (Vec<u32>, Option<Vec<f64>>) = match search {
        Search::Plain => ((0..data.num_rows() as u32).collect(), None),
        Search::FullText(query) => {
            let columns = fts_columns(table);
            if columns.is_empty() {
                return Err(VqError::InvalidInput(
                    "full-text search requires an FTS index; call create_index with IndexKind::Fts"
                        .to_string(),
                ));
            }
            let scores = bm25_scores(&data, &columns, &query)?;
            let mut order = (0..data.num_rows() as u32)
                .filter(|&i| scores[i as usize] > 0.0)
                .collect::<Vec<_>>();
            order.sort_by(|&a, &b| scores[b as usize].total_cmp(&scores[a as usize]));
            (order, Some(scores))
        }
        Search::Vector {
            column,
            query,
            metric,
        } => {
            let column = resolve_vector_column(&data.schema(), column.as_deref())?;
            let distances = vector_distances(&data, &column, &query, metric)?;
            let mut order = (0..data.num_rows() as u32)
                .filter(|&i| distances[i as usize].is_some())
                .collect::<Vec<_>>();
            let key = |i: u32| distances[i as usize].unwrap_or(f64::INFINITY);
            order.sort_by(|&a, &b| key(a).total_cmp(&key(b)));
            let scores = distances
                .iter()
                .map(|d| d.unwrap_or(f64::INFINITY))
                .collect();
            (order, Some(scores))
        }
    };
    if base.limit > 0 {
        order.truncate(base.limit);
    }

    let indices = UInt32Array::from(order.clone());
    let taken = take_record_batch(&data, &indices)?;
    project(&schema, &taken, scores.as_deref(), &order)
}

fn project(
    schema: &SchemaRef,
    taken: &RecordBatch,
    scores: Option<&[f64]>,
    order: &[u32],
) -> Result<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| -> Result<ArrayRef> {
            let name = field.name().as_str();
            if name == DISTANCE_COLUMN || name == SCORE_COLUMN {
                let scores = scores.unwrap_or_default();
                let values = order
                    .iter()
                    .map(|&i| scores.get(i as usize).map(|s| *s as f32))
                    .collect::<Float32Array>();
                return Ok(Arc::new(values));
            }
            taken
                .column_by_name(name)
                .cloned()
                .ok_or_else(|| VqError::MissingColumn(format!("column '{name}' does not exist")))
        })
        .collect::<Result<Vec<_>>>()?;
    let options = RecordBatchOptions::new().with_row_count(Some(taken.num_rows()));
    Ok(RecordBatch::try_new_with_options(schema.clone(), columns, &options)?)
}

impl Transport for MemoryEngine {
    fn connect<'a>(&'a self, uri: &'a str) -> BoxFuture<'a, Reply<ConnectionHandle>> {
        async move { reply(self.connect_sync(uri)) }.boxed()
    }

    fn disconnect<'a>(&'a self, conn: ConnectionHandle) -> BoxFuture<'a, Reply<()>> {
        async move { reply(self.disconnect_sync(conn)) }.boxed()
    }

    fn table_names<'a>(&'a self, conn: ConnectionHandle) -> BoxFuture<'a, Reply<Vec<String>>> {
        async move {
            let mut state = self.state.lock();
            reply(state.database(conn).map(|(_, db)| db.table_names()))
        }
        .boxed()
    }

    fn create_table<'a>(
        &'a self,
        conn: ConnectionHandle,
        name: &'a str,
        schema_ipc: Vec<u8>,
        mode: CreateTableMode,
    ) -> BoxFuture<'a, Reply<TableHandle>> {
        async move { reply(self.create_table_sync(conn, name, &schema_ipc, mode)) }.boxed()
    }

    fn open_table<'a>(
        &'a self,
        conn: ConnectionHandle,
        name: &'a str,
    ) -> BoxFuture<'a, Reply<TableHandle>> {
        async move { reply(self.open_table_sync(conn, name)) }.boxed()
    }

    fn table_schema<'a>(&'a self, table: TableHandle) -> BoxFuture<'a, Reply<Vec<u8>>> {
        async move {
            let state = self.state.lock();
            reply(
                state
                    .table(table)
                    .and_then(|(_, stored)| encode_schema_only(&stored.schema)),
            )
        }
        .boxed()
    }

    fn drop_table<'a>(&'a self, conn: ConnectionHandle, name: &'a str) -> BoxFuture<'a, Reply<()>> {
        async move { reply(self.drop_table_sync(conn, name)) }.boxed()
    }

    fn close_table<'a>(&'a self, table: TableHandle) -> BoxFuture<'a, Reply<()>> {
        async move { reply(self.close_table_sync(table)) }.boxed()
    }

    fn add<'a>(
        &'a self,
        table: TableHandle,
        frames: Vec<Vec<u8>>,
        mode: AddMode,
    ) -> BoxFuture<'a, Reply<u64>> {
        async move { reply(self.add_sync(table, &frames, mode)) }.boxed()
    }

    fn count_rows<'a>(
        &'a self,
        table: TableHandle,
        filter: Option<String>,
    ) -> BoxFuture<'a, Reply<u64>> {
        async move { reply(self.count_rows_sync(table, filter.as_deref())) }.boxed()
    }

    fn delete<'a>(&'a self, table: TableHandle, predicate: String) -> BoxFuture<'a, Reply<u64>> {
        async move { reply(self.delete_sync(table, &predicate)) }.boxed()
    }

    fn merge_insert<'a>(
        &'a self,
        table: TableHandle,
        request: MergeInsertRequest,
        frames: Vec<Vec<u8>>,
    ) -> BoxFuture<'a, Reply<MergeStats>> {
        async move { reply(self.merge_insert_sync(table, &request, &frames)) }.boxed()
    }

    fn create_index<'a>(
        &'a self,
        table: TableHandle,
        request: IndexRequest,
    ) -> BoxFuture<'a, Reply<()>> {
        async move { reply(self.create_index_sync(table, &request)) }.boxed()
    }

    fn list_indices<'a>(&'a self, table: TableHandle) -> BoxFuture<'a, Reply<Vec<IndexConfig>>> {
        async move {
            let state = self.state.lock();
            reply(state.table(table).map(|(_, stored)| stored.indices.clone()))
        }
        .boxed()
    }

    fn query(&self, table: TableHandle, request: QueryRequest, sink: FrameSender) {
        let search = match &request.full_text {
            Some(text) => Search::FullText(text.clone()),
            None => Search::Plain,
        };
        self.spawn_query(table, request, search, sink);
    }

    fn vector_query(&self, table: TableHandle, request: VectorQueryRequest, sink: FrameSender) {
        let query = match request.vector.to_f64_vec() {
            Ok(query) => query,
            Err(e) => {
                sink.finish(Status::error(e.to_string()));
                return;
            }
        };
        let search = Search::Vector {
            column: request.column,
            query,
            metric: request.metric.unwrap_or(DistanceMetric::L2),
        };
        self.spawn_query(table, request.base, search, sink);
    }

    fn explain_plan<'a>(
        &'a self,
        table: TableHandle,
        request: PlanRequest,
        verbose: bool,
    ) -> BoxFuture<'a, Reply<String>> {
        async move {
            reply(
                self.snapshot(table)
                    .and_then(|(name, stored)| explain_request(&name, &stored, &request, verbose)),
            )
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{AsArray, Int64Array, StringArray};
    use arrow::datatypes::{Float32Type, Int64Type, UInt64Type};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use futures::TryStreamExt;
    use futures::executor::block_on;
    use vq_codec::{encode_frame, encode_schema_only};
    use vq_common::TableHandle;
    use vq_execution::{
        AddMode, CancellationToken, CreateTableMode, IndexKind, IndexRequest, QueryRequest,
        Transport, frame_channel, frame_stream,
    };

    use super::MemoryEngine;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("text", DataType::Utf8, true),
        ]))
    }

    fn rows(ids: Vec<i64>, text: Vec<&str>) -> Vec<u8> {
        let batch = RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(text)),
            ],
        )
        .expect("batch");
        encode_frame(&batch).expect("frame")
    }

    fn setup() -> (MemoryEngine, TableHandle) {
        setup_on(MemoryEngine::new())
    }

    fn setup_on(engine: MemoryEngine) -> (MemoryEngine, TableHandle) {
        let conn = block_on(engine.connect("memory://test")).expect("connect");
        let schema_ipc = encode_schema_only(&schema()).expect("schema");
        let table = block_on(engine.create_table(conn, "docs", schema_ipc, CreateTableMode::Create))
            .expect("create");
        (engine, table)
    }

    fn run(engine: &MemoryEngine, table: TableHandle, request: QueryRequest) -> Vec<RecordBatch> {
        let (tx, rx) = frame_channel(CancellationToken::new());
        engine.query(table, request, tx);
        block_on(frame_stream(schema(), rx, "Query").try_collect::<Vec<_>>()).expect("query")
    }

    #[test]
    fn add_count_and_delete() {
        let (engine, table) = setup();
        assert_eq!(block_on(engine.count_rows(table, None)).expect("count"), 0);
        block_on(engine.add(table, vec![rows(vec![1, 2, 3], vec!["a", "b", "c"])], AddMode::Append))
            .expect("add");
        block_on(engine.add(table, vec![rows(vec![4], vec!["d"])], AddMode::Append)).expect("add");
        assert_eq!(block_on(engine.count_rows(table, None)).expect("count"), 4);
        assert_eq!(
            block_on(engine.count_rows(table, Some("id > 2".to_string()))).expect("count"),
            2
        );
        assert_eq!(block_on(engine.delete(table, "id = 1".to_string())).expect("delete"), 1);
        assert_eq!(block_on(engine.count_rows(table, None)).expect("count"), 3);
    }

    #[test]
    fn overwrite_replaces_rows_with_fresh_row_ids() {
        let (engine, table) = setup();
        block_on(engine.add(table, vec![rows(vec![1, 2, 3], vec!["a", "b", "c"])], AddMode::Append))
            .expect("add");
        let added = block_on(engine.add(
            table,
            vec![rows(vec![9], vec!["x"]), rows(vec![8], vec!["y"])],
            AddMode::Overwrite,
        ))
        .expect("overwrite");
        assert_eq!(added, 2);

        let batches = run(
            &engine,
            table,
            QueryRequest {
                with_row_id: true,
                batch_size: 10,
                ..QueryRequest::default()
            },
        );
        let ids = batches[0].column(0).as_primitive::<Int64Type>().values().to_vec();
        assert_eq!(ids, vec![9, 8]);
        let row_ids = batches[0].column(2).as_primitive::<UInt64Type>().values().to_vec();
        assert_eq!(row_ids, vec![3, 4]);

        assert_eq!(block_on(engine.add(table, vec![], AddMode::Overwrite)).expect("clear"), 0);
        assert_eq!(block_on(engine.count_rows(table, None)).expect("count"), 0);
    }

    #[test]
    fn many_queries_in_flight_all_complete() {
        let (engine, table) = setup();
        block_on(engine.add(table, vec![rows(vec![1, 2, 3, 4, 5], vec!["a"; 5])], AddMode::Append))
            .expect("add");
        let receivers = (0..64)
            .map(|_| {
                let (tx, rx) = frame_channel(CancellationToken::new());
                engine.query(
                    table,
                    QueryRequest {
                        batch_size: 2,
                        ..QueryRequest::default()
                    },
                    tx,
                );
                rx
            })
            .collect::<Vec<_>>();
        for rx in receivers {
            let batches =
                block_on(frame_stream(schema(), rx, "Query").try_collect::<Vec<_>>()).expect("query");
            assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 5);
        }
    }

    #[test]
    fn queries_run_on_a_supplied_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("engine-test")
            .build()
            .expect("runtime");
        let (engine, table) = setup_on(MemoryEngine::with_runtime(runtime.handle().clone()));
        block_on(engine.add(table, vec![rows(vec![1, 2], vec!["a", "b"])], AddMode::Append))
            .expect("add");
        let batches = run(&engine, table, QueryRequest::default());
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
    }

    #[test]
    fn queries_stream_in_batch_size_chunks() {
        let (engine, table) = setup();
        block_on(engine.add(table, vec![rows(vec![1, 2, 3, 4, 5], vec!["a"; 5])], AddMode::Append))
            .expect("add");
        let batches = run(
            &engine,
            table,
            QueryRequest {
                limit: 4,
                with_row_id: true,
                batch_size: 3,
                ..QueryRequest::default()
            },
        );
        assert_eq!(batches.iter().map(|b| b.num_rows()).collect::<Vec<_>>(), vec![3, 1]);
        assert_eq!(batches[0].schema().field(2).name(), "_rowid");
        let ids = batches[1].column(0).as_primitive::<Int64Type>().value(0);
        assert_eq!(ids, 4);
    }

    #[test]
    fn full_text_requires_an_index_and_scores_matches() {
        let (engine, table) = setup();
        block_on(engine.add(
            table,
            vec![rows(vec![1, 2, 3], vec!["red fox", "blue sky", "fox fox"])],
            AddMode::Append,
        ))
        .expect("add");
        let request = QueryRequest {
            full_text: Some("fox".to_string()),
            batch_size: 16,
            ..QueryRequest::default()
        };
        let (tx, rx) = frame_channel(CancellationToken::new());
        engine.query(table, request.clone(), tx);
        assert!(block_on(frame_stream(schema(), rx, "Query").try_collect::<Vec<_>>()).is_err());

        block_on(engine.create_index(
            table,
            IndexRequest {
                column: "text".to_string(),
                kind: IndexKind::Fts,
                metric: None,
                replace: false,
            },
        ))
        .expect("index");
        let batches = run(&engine, table, request);
        let ids = batches[0].column(0).as_primitive::<Int64Type>().values().to_vec();
        assert_eq!(ids, vec![3, 1]);
        let scores = batches[0].column(2).as_primitive::<Float32Type>();
        assert!(scores.value(0) > scores.value(1));
    }

    #[test]
    fn closed_handles_are_rejected() {
        let (engine, table) = setup();
        block_on(engine.close_table(table)).expect("close");
        let err = block_on(engine.count_rows(table, None)).expect_err("closed");
        assert!(err.code < 0);
        assert!(err.message().contains("is not open"));
    }
}
