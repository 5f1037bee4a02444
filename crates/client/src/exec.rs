//! Query execution: dispatch to the transport, multi-vector and hybrid
//! fan-out, schema alignment and metrics instrumentation.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use arrow::array::{ArrayRef, UInt32Array, new_null_array};
use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use futures::{Stream, StreamExt, TryStreamExt};
use tracing::debug;
use vq_common::{MetricsRegistry, ROW_ID_COLUMN, Result, VqError};
use vq_execution::schema::{
    distance_field, query_index_field, relevance_score_field, row_id_field, score_field,
};
use vq_execution::{
    CancellationToken, PlanRequest, QueryRequest, RecordBatchStream, ScoreColumn,
    SendableRecordBatchStream, VectorQueryRequest, check_query_reply, frame_channel, frame_stream,
    memory_stream,
};

use crate::query::{ExecuteOptions, QueryKind, QuerySpec};
use crate::rerank::{Reranker, RrfReranker};
use crate::table::Table;

const QUERY_STAGE: &str = "Failed to execute query";
const EXPLAIN_STAGE: &str = "Failed to explain plan";

/// Schema a query produces; for fused results this is the projection,
/// `_relevance_score`, then `_rowid` when requested.
pub(crate) fn output_schema(table: &Table, spec: &QuerySpec) -> Result<SchemaRef> {
    let request = spec.base_request(0);
    let table_schema = table.schema();
    match spec.kind {
        QueryKind::Plain => vq_execution::output_schema(
            &table_schema,
            &request,
            ScoreColumn::for_request(&request, false),
        ),
        QueryKind::Vector if spec.reranker.is_none() => {
            let schema =
                vq_execution::output_schema(&table_schema, &request, ScoreColumn::Distance)?;
            if spec.vectors.len() > 1 {
                Ok(append_field(&schema, query_index_field()))
            } else {
                Ok(schema)
            }
        }
        QueryKind::Vector | QueryKind::Hybrid => {
            let projection = projection_schema(table, spec)?;
            let mut fields = projection
                .fields()
                .iter()
                .map(|f| f.as_ref().clone())
                .collect::<Vec<_>>();
            fields.push(relevance_score_field());
            if spec.with_row_id {
                fields.push(row_id_field());
            }
            Ok(Arc::new(Schema::new(fields)))
        }
    }
}

pub(crate) async fn execute(
    table: &Table,
    spec: &QuerySpec,
    options: ExecuteOptions,
) -> Result<SendableRecordBatchStream> {
    let batch_size = options
        .batch_size
        .unwrap_or(table.config().batch_size_rows)
        .max(1);
    let cancel = options.cancellation.unwrap_or_default();
    let started = Instant::now();
    debug!(
        table = %table.name(),
        kind = spec.kind.label(),
        limit = spec.limit,
        vectors = spec.vectors.len(),
        batch_size,
        "dispatching query"
    );

    let stream = match spec.kind {
        QueryKind::Plain => {
            if spec.reranker.is_some() {
                return Err(VqError::NotImplemented(
                    "reranking a plain query; promote it with vector() or hybrid() first"
                        .to_string(),
                ));
            }
            plain_stream(table, spec.base_request(batch_size), cancel)?
        }
        QueryKind::Vector => match (spec.vectors.as_slice(), &spec.reranker) {
            ([vector], None) => vector_stream(table, spec.vector_request(vector, batch_size), cancel)?,
            _ => multi_vector(table, spec, batch_size, &cancel).await?,
        },
        QueryKind::Hybrid => hybrid(table, spec, batch_size, &cancel).await?,
    };

    Ok(Box::pin(InstrumentedStream {
        inner: stream,
        metrics: table.metrics().clone(),
        table: table.name().to_string(),
        kind: spec.kind,
        started,
        rows: 0,
        batches: 0,
        recorded: false,
    }))
}

pub(crate) async fn explain(table: &Table, spec: &QuerySpec, verbose: bool) -> Result<String> {
    let handle = table.handle()?;
    let batch_size = table.config().batch_size_rows;
    let (header, plans) = match spec.kind {
        QueryKind::Plain => {
            if spec.reranker.is_some() {
                return Err(VqError::NotImplemented(
                    "reranking a plain query; promote it with vector() or hybrid() first"
                        .to_string(),
                ));
            }
            (None, vec![PlanRequest::Query(spec.base_request(batch_size))])
        }
        QueryKind::Vector => {
            let header = match (spec.vectors.len(), &spec.reranker) {
                (1, None) => None,
                (n, None) => Some(format!("Union inputs={n} tag=query_index")),
                (n, Some(reranker)) => Some(format!("Rerank inputs={n} reranker={reranker:?}")),
            };
            let plans = spec
                .vectors
                .iter()
                .map(|v| PlanRequest::Vector(spec.vector_request(v, batch_size)))
                .collect();
            (header, plans)
        }
        QueryKind::Hybrid => {
            let (vector_request, fts_request) = hybrid_requests(spec, batch_size)?;
            let reranker = match &spec.reranker {
                Some(reranker) => format!("{reranker:?}"),
                None => format!("{:?}", RrfReranker::new(table.config().rrf_k)),
            };
            (
                Some(format!("Rerank inputs=2 reranker={reranker}")),
                vec![
                    PlanRequest::Vector(vector_request),
                    PlanRequest::Query(fts_request),
                ],
            )
        }
    };

    let mut sections = Vec::with_capacity(plans.len());
    for plan in plans {
        let reply = table.transport().explain_plan(handle, plan, verbose).await;
        sections.push(check_query_reply(reply, EXPLAIN_STAGE)?);
    }
    let Some(header) = header else {
        return Ok(sections.concat());
    };
    let mut out = format!("{header}\n");
    for section in sections {
        for line in section.lines() {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    Ok(out)
}

fn plain_stream(
    table: &Table,
    request: QueryRequest,
    cancel: CancellationToken,
) -> Result<SendableRecordBatchStream> {
    let handle = table.handle()?;
    let score = ScoreColumn::for_request(&request, false);
    let schema = vq_execution::output_schema(&table.schema(), &request, score)?;
    let (sink, receiver) = frame_channel(cancel);
    table.transport().query(handle, request, sink);
    Ok(frame_stream(schema, receiver, QUERY_STAGE))
}

fn vector_stream(
    table: &Table,
    request: VectorQueryRequest,
    cancel: CancellationToken,
) -> Result<SendableRecordBatchStream> {
    let handle = table.handle()?;
    let schema =
        vq_execution::output_schema(&table.schema(), &request.base, ScoreColumn::Distance)?;
    let (sink, receiver) = frame_channel(cancel);
    table.transport().vector_query(handle, request, sink);
    Ok(frame_stream(schema, receiver, QUERY_STAGE))
}

async fn collect(stream: SendableRecordBatchStream) -> Result<RecordBatch> {
    let schema = stream.schema();
    let batches = stream.try_collect::<Vec<_>>().await?;
    Ok(concat_batches(&schema, &batches)?)
}

async fn run_vector(
    table: &Table,
    request: VectorQueryRequest,
    cancel: CancellationToken,
) -> Result<RecordBatch> {
    collect(vector_stream(table, request, cancel)?).await
}

async fn run_plain(
    table: &Table,
    request: QueryRequest,
    cancel: CancellationToken,
) -> Result<RecordBatch> {
    collect(plain_stream(table, request, cancel)?).await
}

async fn multi_vector(
    table: &Table,
    spec: &QuerySpec,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<SendableRecordBatchStream> {
    if spec.vectors.is_empty() {
        return Err(VqError::InvalidInput(
            "vector query has no query vector".to_string(),
        ));
    }
    let mut per_vector = spec.clone();
    per_vector.with_row_id |= spec.reranker.is_some();
    let results = futures::future::try_join_all(spec.vectors.iter().map(|vector| {
        run_vector(
            table,
            per_vector.vector_request(vector, batch_size),
            cancel.clone(),
        )
    }))
    .await?;

    let Some(reranker) = &spec.reranker else {
        let tagged = results
            .iter()
            .enumerate()
            .map(|(i, batch)| with_query_index(batch, i as u32))
            .collect::<Result<Vec<_>>>()?;
        let schema = match tagged.first() {
            Some(first) => first.schema(),
            None => output_schema(table, spec)?,
        };
        let combined = concat_batches(&schema, &tagged)?;
        return Ok(memory_stream(schema, vec![combined]));
    };

    let query = spec.full_text.as_deref().unwrap_or_default();
    let mut fused = reranker.rerank_multivector(&results, query, false)?;
    if spec.limit > 0 && fused.num_rows() > spec.limit {
        fused = fused.slice(0, spec.limit);
    }
    let fused = finish_row_ids(fused, spec.with_row_id)?;
    debug!(
        table = %table.name(),
        inputs = results.len(),
        rows = fused.num_rows(),
        "fused multi-vector results"
    );
    Ok(memory_stream(fused.schema(), vec![fused]))
}

fn hybrid_requests(
    spec: &QuerySpec,
    batch_size: usize,
) -> Result<(VectorQueryRequest, QueryRequest)> {
    if spec.full_text.is_none() {
        return Err(VqError::InvalidInput(
            "hybrid query needs a full-text query; call text()".to_string(),
        ));
    }
    let [vector] = spec.vectors.as_slice() else {
        return Err(VqError::InvalidInput(format!(
            "hybrid query takes exactly one query vector, got {}",
            spec.vectors.len()
        )));
    };
    let mut forced = spec.clone();
    forced.with_row_id = true;
    Ok((
        forced.vector_request(vector, batch_size),
        forced.base_request(batch_size),
    ))
}

async fn hybrid(
    table: &Table,
    spec: &QuerySpec,
    batch_size: usize,
    cancel: &CancellationToken,
) -> Result<SendableRecordBatchStream> {
    let (vector_request, fts_request) = hybrid_requests(spec, batch_size)?;
    let (vector_results, fts_results) = futures::try_join!(
        run_vector(table, vector_request, cancel.clone()),
        run_plain(table, fts_request, cancel.clone()),
    )?;

    let aligned = hybrid_schema(table, spec)?;
    let vector_results = align(&vector_results, &aligned)?;
    let fts_results = align(&fts_results, &aligned)?;

    let reranker: Arc<dyn Reranker> = match &spec.reranker {
        Some(reranker) => reranker.clone(),
        None => Arc::new(RrfReranker::new(table.config().rrf_k)),
    };
    let text = spec.full_text.as_deref().unwrap_or_default();
    let fused = reranker.rerank_hybrid(text, &vector_results, &fts_results, spec.limit)?;
    let fused = finish_row_ids(fused, spec.with_row_id)?;
    debug!(
        table = %table.name(),
        vector_rows = vector_results.num_rows(),
        fts_rows = fts_results.num_rows(),
        rows = fused.num_rows(),
        "fused hybrid results"
    );
    Ok(memory_stream(fused.schema(), vec![fused]))
}

fn projection_schema(table: &Table, spec: &QuerySpec) -> Result<SchemaRef> {
    let request = QueryRequest {
        with_row_id: false,
        full_text: None,
        ..spec.base_request(0)
    };
    vq_execution::output_schema(&table.schema(), &request, ScoreColumn::None)
}

/// Projection, `_distance`, `_score`, `_rowid`.
fn hybrid_schema(table: &Table, spec: &QuerySpec) -> Result<SchemaRef> {
    let projection = projection_schema(table, spec)?;
    let mut fields = projection
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect::<Vec<_>>();
    fields.extend([distance_field(), score_field(), row_id_field()]);
    Ok(Arc::new(Schema::new(fields)))
}

/// Reorder `batch` to `schema`, filling absent columns with nulls.
fn align(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(column) => column.clone(),
            None => new_null_array(field.data_type(), batch.num_rows()),
        })
        .collect::<Vec<ArrayRef>>();
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

fn append_field(schema: &Schema, field: arrow_schema::Field) -> SchemaRef {
    let mut fields = schema
        .fields()
        .iter()
        .map(|f| f.as_ref().clone())
        .collect::<Vec<_>>();
    fields.push(field);
    Arc::new(Schema::new(fields))
}

fn with_query_index(batch: &RecordBatch, index: u32) -> Result<RecordBatch> {
    let schema = append_field(&batch.schema(), query_index_field());
    let mut columns = batch.columns().to_vec();
    columns.push(Arc::new(UInt32Array::from(vec![index; batch.num_rows()])));
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn finish_row_ids(batch: RecordBatch, keep: bool) -> Result<RecordBatch> {
    if keep {
        return Ok(batch);
    }
    let schema = batch.schema();
    let keep_indices = (0..schema.fields().len())
        .filter(|&i| schema.field(i).name() != ROW_ID_COLUMN)
        .collect::<Vec<_>>();
    Ok(batch.project(&keep_indices)?)
}

/// Counts rows and batches and records one query observation when the
/// stream ends or is dropped.
struct InstrumentedStream {
    inner: SendableRecordBatchStream,
    metrics: MetricsRegistry,
    table: String,
    kind: QueryKind,
    started: Instant,
    rows: u64,
    batches: u64,
    recorded: bool,
}

impl InstrumentedStream {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        self.recorded = true;
        let secs = self.started.elapsed().as_secs_f64();
        self.metrics
            .record_query(&self.table, self.kind.label(), self.rows, self.batches, secs);
        debug!(
            table = %self.table,
            kind = self.kind.label(),
            rows = self.rows,
            batches = self.batches,
            secs,
            "query finished"
        );
    }
}

impl Stream for InstrumentedStream {
    type Item = Result<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.inner.poll_next_unpin(cx);
        match &polled {
            Poll::Ready(Some(Ok(batch))) => {
                self.rows += batch.num_rows() as u64;
                self.batches += 1;
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => self.record(),
            Poll::Pending => {}
        }
        polled
    }
}

impl RecordBatchStream for InstrumentedStream {
    fn schema(&self) -> SchemaRef {
        self.inner.schema()
    }
}

impl Drop for InstrumentedStream {
    fn drop(&mut self) {
        self.record();
    }
}
