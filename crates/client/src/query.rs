//! Fluent query builders.
//!
//! One [`QuerySpec`] carries every constraint; the builder type records which
//! search mode it is in. Chain methods consume the builder and return the
//! updated one, and builders are `Clone`, so a clone taken earlier never sees
//! later changes. Promotions (`vector`, `text`, `hybrid`) copy the `QuerySpec` into
//! the next builder type.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use futures::TryStreamExt;
use futures::executor::block_on;
use futures::future::{BoxFuture, FutureExt};
use vq_codec::{Row, batches_to_rows};
use vq_common::{Result, VqError};
use vq_execution::{
    CancellationToken, DistanceMetric, QueryRequest, SendableRecordBatchStream, VectorInput,
    VectorPayload, VectorQueryRequest,
};

use crate::exec;
use crate::rerank::Reranker;
use crate::table::Table;

/// Search mode of a spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueryKind {
    /// Filter and projection only, or full-text search when text is set.
    #[default]
    Plain,
    /// Nearest-neighbour search.
    Vector,
    /// Vector and full-text search fused by a reranker.
    Hybrid,
}

impl QueryKind {
    pub fn label(self) -> &'static str {
        match self {
            QueryKind::Plain => "plain",
            QueryKind::Vector => "vector",
            QueryKind::Hybrid => "hybrid",
        }
    }
}

/// Accumulated query state.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub kind: QueryKind,
    /// Row cap; 0 is unbounded.
    pub limit: usize,
    pub filter: Option<String>,
    pub with_row_id: bool,
    /// Projected columns; empty selects every column.
    pub columns: Vec<String>,
    pub full_text: Option<String>,
    /// Query vectors; more than one makes a multi-vector query.
    pub vectors: Vec<VectorPayload>,
    pub vector_column: Option<String>,
    pub metric: Option<DistanceMetric>,
    pub nprobes: u32,
    pub refine_factor: Option<u32>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

impl QuerySpec {
    /// Request shared by every search mode.
    pub fn base_request(&self, batch_size: usize) -> QueryRequest {
        QueryRequest {
            limit: self.limit,
            filter: self.filter.clone(),
            with_row_id: self.with_row_id,
            columns: self.columns.clone(),
            full_text: self.full_text.clone(),
            batch_size,
        }
    }

    /// Vector request for one of the query vectors.
    pub fn vector_request(&self, vector: &VectorPayload, batch_size: usize) -> VectorQueryRequest {
        VectorQueryRequest {
            base: QueryRequest {
                full_text: None,
                ..self.base_request(batch_size)
            },
            vector: vector.clone(),
            column: self.vector_column.clone(),
            metric: self.metric,
            nprobes: self.nprobes,
            refine_factor: self.refine_factor,
        }
    }
}

/// Per-execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Rows per streamed batch; defaults to `batch_size_rows` from the config.
    pub batch_size: Option<usize>,
    /// Token that asks the engine to stop producing batches.
    pub cancellation: Option<CancellationToken>,
}

/// Chain methods shared by every builder.
pub trait QueryBase: Sized {
    fn table(&self) -> &Table;

    fn spec(&self) -> &QuerySpec;

    fn spec_mut(&mut self) -> &mut QuerySpec;

    /// Cap the number of rows returned; 0 removes the cap.
    fn limit(mut self, limit: usize) -> Self {
        self.spec_mut().limit = limit;
        self
    }

    /// Project `columns`, in this order.
    fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec_mut().columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only rows matching `predicate`.
    fn only_if(mut self, predicate: impl Into<String>) -> Self {
        self.spec_mut().filter = Some(predicate.into());
        self
    }

    /// Alias of [`QueryBase::only_if`].
    fn where_clause(self, predicate: impl Into<String>) -> Self {
        self.only_if(predicate)
    }

    /// Append `_rowid` to the results.
    fn with_row_id(mut self, with_row_id: bool) -> Self {
        self.spec_mut().with_row_id = with_row_id;
        self
    }

    /// Fuse results with `reranker`. Plain queries reject it at execution.
    fn rerank(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.spec_mut().reranker = Some(reranker);
        self
    }
}

/// Terminal methods shared by every builder.
pub trait ExecutableQuery: Sync {
    /// Schema of the results, also used when a query returns no batches.
    fn output_schema(&self) -> Result<SchemaRef>;

    fn execute_with_options(
        &self,
        options: ExecuteOptions,
    ) -> BoxFuture<'_, Result<SendableRecordBatchStream>>;

    /// Plan description from the engine; rows are not read.
    fn explain_plan(&self, verbose: bool) -> BoxFuture<'_, Result<String>>;

    fn execute(&self) -> BoxFuture<'_, Result<SendableRecordBatchStream>> {
        self.execute_with_options(ExecuteOptions::default())
    }

    /// Run the query and collect every batch.
    fn to_batches(&self, batch_size: Option<usize>) -> BoxFuture<'_, Result<Vec<RecordBatch>>> {
        async move {
            let options = ExecuteOptions {
                batch_size,
                ..ExecuteOptions::default()
            };
            self.execute_with_options(options)
                .await?
                .try_collect::<Vec<_>>()
                .await
        }
        .boxed()
    }

    /// Run the query and concatenate the results. No batches yields an empty
    /// batch with [`ExecutableQuery::output_schema`].
    fn to_arrow(&self) -> BoxFuture<'_, Result<RecordBatch>> {
        async move {
            let batches = self.to_batches(None).await?;
            match batches.first() {
                None => Ok(RecordBatch::new_empty(self.output_schema()?)),
                Some(first) => Ok(arrow::compute::concat_batches(&first.schema(), &batches)?),
            }
        }
        .boxed()
    }

    /// Run the query and materialize rows.
    fn to_list(&self) -> BoxFuture<'_, Result<Vec<Row>>> {
        async move {
            let batch = self.to_arrow().await?;
            batches_to_rows(std::slice::from_ref(&batch))
        }
        .boxed()
    }

    fn execute_blocking(&self) -> Result<SendableRecordBatchStream> {
        block_on(self.execute())
    }

    fn to_batches_blocking(&self, batch_size: Option<usize>) -> Result<Vec<RecordBatch>> {
        block_on(self.to_batches(batch_size))
    }

    fn to_arrow_blocking(&self) -> Result<RecordBatch> {
        block_on(self.to_arrow())
    }

    fn to_list_blocking(&self) -> Result<Vec<Row>> {
        block_on(self.to_list())
    }

    fn explain_plan_blocking(&self, verbose: bool) -> Result<String> {
        block_on(self.explain_plan(verbose))
    }
}

impl<Q> ExecutableQuery for Q
where
    Q: QueryBase + Sync,
{
    fn output_schema(&self) -> Result<SchemaRef> {
        exec::output_schema(self.table(), self.spec())
    }

    fn execute_with_options(
        &self,
        options: ExecuteOptions,
    ) -> BoxFuture<'_, Result<SendableRecordBatchStream>> {
        exec::execute(self.table(), self.spec(), options).boxed()
    }

    fn explain_plan(&self, verbose: bool) -> BoxFuture<'_, Result<String>> {
        exec::explain(self.table(), self.spec(), verbose).boxed()
    }
}

macro_rules! impl_query_base {
    ($($builder:ty),*) => {
        $(
            impl QueryBase for $builder {
                fn table(&self) -> &Table {
                    &self.table
                }

                fn spec(&self) -> &QuerySpec {
                    &self.spec
                }

                fn spec_mut(&mut self) -> &mut QuerySpec {
                    &mut self.spec
                }
            }
        )*
    };
}

impl_query_base!(Query, VectorQuery, HybridQuery);

/// Filtered scan, or full-text search once [`Query::text`] is set.
#[derive(Debug, Clone)]
pub struct Query {
    table: Table,
    spec: QuerySpec,
}

impl Query {
    pub(crate) fn new(table: Table) -> Self {
        let config = table.config();
        let spec = QuerySpec {
            nprobes: u32::try_from(config.default_nprobes).unwrap_or(u32::MAX),
            refine_factor: config.default_refine_factor,
            ..QuerySpec::default()
        };
        Self { table, spec }
    }

    /// Full-text search for `query`.
    pub fn text(mut self, query: impl Into<String>) -> Self {
        self.spec.full_text = Some(query.into());
        self
    }

    /// Promote to a nearest-neighbour query. Filter, projection and limit
    /// carry over; an unset limit becomes `default_vector_limit`.
    ///
    /// A query with [`Query::text`] set is rejected with
    /// [`VqError::InvalidInput`]; use [`Query::hybrid`] to search both.
    pub fn vector(self, vector: impl Into<VectorInput>) -> Result<VectorQuery> {
        if let Some(text) = &self.spec.full_text {
            return Err(VqError::InvalidInput(format!(
                "query already has full-text search '{text}'; call hybrid() to combine it with a vector"
            )));
        }
        self.promote(vector)
    }

    /// Promote to a hybrid query for `vector` and the text set with
    /// [`Query::text`] (or later with [`HybridQuery::text`]).
    pub fn hybrid(self, vector: impl Into<VectorInput>) -> Result<HybridQuery> {
        Ok(self.promote(vector)?.into_hybrid())
    }

    fn promote(self, vector: impl Into<VectorInput>) -> Result<VectorQuery> {
        let payload = VectorPayload::try_from(vector.into())?;
        let mut spec = self.spec;
        spec.kind = QueryKind::Vector;
        if spec.limit == 0 {
            spec.limit = self.table.config().default_vector_limit;
        }
        spec.vectors = vec![payload];
        Ok(VectorQuery {
            table: self.table,
            spec,
        })
    }
}

/// Nearest-neighbour search.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    table: Table,
    spec: QuerySpec,
}

impl VectorQuery {
    /// Search a second (third, ...) vector; results are concatenated with a
    /// `query_index` column, or fused when a reranker is attached.
    pub fn add_query_vector(mut self, vector: impl Into<VectorInput>) -> Result<Self> {
        self.spec
            .vectors
            .push(VectorPayload::try_from(vector.into())?);
        Ok(self)
    }

    /// Vector column to search when the table has several.
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.spec.vector_column = Some(column.into());
        self
    }

    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.spec.metric = Some(metric);
        self
    }

    /// Alias of [`VectorQuery::metric`].
    pub fn distance_type(self, metric: DistanceMetric) -> Self {
        self.metric(metric)
    }

    pub fn nprobes(mut self, nprobes: u32) -> Self {
        self.spec.nprobes = nprobes;
        self
    }

    pub fn refine_factor(mut self, refine_factor: u32) -> Self {
        self.spec.refine_factor = Some(refine_factor);
        self
    }

    /// Promote to a hybrid query with full-text `query`.
    pub fn text(mut self, query: impl Into<String>) -> HybridQuery {
        self.spec.full_text = Some(query.into());
        self.into_hybrid()
    }

    fn into_hybrid(self) -> HybridQuery {
        let mut spec = self.spec;
        spec.kind = QueryKind::Hybrid;
        HybridQuery {
            table: self.table,
            spec,
        }
    }
}

/// Vector plus full-text search fused by a reranker (reciprocal-rank fusion
/// unless another one is attached).
#[derive(Debug, Clone)]
pub struct HybridQuery {
    table: Table,
    spec: QuerySpec,
}

impl HybridQuery {
    pub fn text(mut self, query: impl Into<String>) -> Self {
        self.spec.full_text = Some(query.into());
        self
    }

    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.spec.vector_column = Some(column.into());
        self
    }

    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.spec.metric = Some(metric);
        self
    }

    pub fn nprobes(mut self, nprobes: u32) -> Self {
        self.spec.nprobes = nprobes;
        self
    }

    pub fn refine_factor(mut self, refine_factor: u32) -> Self {
        self.spec.refine_factor = Some(refine_factor);
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow_schema::{DataType, Field, Schema};
    use vq_common::VqError;
    use vq_execution::{CreateTableMode, DistanceMetric};

    use super::{QueryBase, QueryKind};
    use crate::connection::Connection;
    use crate::rerank::RrfReranker;
    use crate::table::Table;

    fn table() -> Table {
        let conn = Connection::memory_blocking("memory://builders").expect("connect");
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(Arc::new(Field::new("item", DataType::Float32, true)), 2),
                true,
            ),
        ]));
        conn.create_empty_table_blocking("t", schema, CreateTableMode::Create)
            .expect("create")
    }

    #[test]
    fn chain_methods_accumulate_state() {
        let query = table()
            .query()
            .limit(7)
            .select(["id"])
            .where_clause("id > 1")
            .with_row_id(true);
        let spec = query.spec();
        assert_eq!(spec.kind, QueryKind::Plain);
        assert_eq!(spec.limit, 7);
        assert_eq!(spec.columns, vec!["id".to_string()]);
        assert_eq!(spec.filter.as_deref(), Some("id > 1"));
        assert!(spec.with_row_id);
        assert_eq!(spec.nprobes, 20);
    }

    #[test]
    fn promotion_carries_base_state_and_fills_the_default_limit() {
        let table = table();
        let vector = table
            .query()
            .only_if("id = 1")
            .vector([0.5_f32, 0.5])
            .expect("vector")
            .metric(DistanceMetric::Dot)
            .nprobes(4)
            .refine_factor(2);
        let spec = vector.spec();
        assert_eq!(spec.kind, QueryKind::Vector);
        assert_eq!(spec.limit, 10);
        assert_eq!(spec.filter.as_deref(), Some("id = 1"));
        assert_eq!(spec.vectors.len(), 1);
        assert_eq!(spec.metric, Some(DistanceMetric::Dot));
        assert_eq!((spec.nprobes, spec.refine_factor), (4, Some(2)));

        let limited = table.query().limit(3).vector([0.5_f32, 0.5]).expect("vector");
        assert_eq!(limited.spec().limit, 3);

        let hybrid = vector.clone().text("hello");
        assert_eq!(hybrid.spec().kind, QueryKind::Hybrid);
        assert_eq!(hybrid.spec().full_text.as_deref(), Some("hello"));
        assert_eq!(hybrid.spec().metric, Some(DistanceMetric::Dot));
        assert!(vector.spec().full_text.is_none());
    }

    #[test]
    fn text_then_vector_is_rejected_but_hybrid_keeps_both() {
        let table = table();
        let err = table
            .query()
            .text("hello")
            .vector([0.5_f32, 0.5])
            .expect_err("text would be dropped");
        assert!(matches!(err, VqError::InvalidInput(ref m) if m.contains("hybrid()")));

        let hybrid = table
            .query()
            .text("hello")
            .hybrid([0.5_f32, 0.5])
            .expect("hybrid");
        assert_eq!(hybrid.spec().kind, QueryKind::Hybrid);
        assert_eq!(hybrid.spec().full_text.as_deref(), Some("hello"));
        assert_eq!(hybrid.spec().vectors.len(), 1);
    }

    #[test]
    fn clones_do_not_observe_later_changes() {
        let base = table().query().limit(5);
        let reranked = base.clone().rerank(Arc::new(RrfReranker::default())).limit(1);
        assert_eq!(base.spec().limit, 5);
        assert!(base.spec().reranker.is_none());
        assert_eq!(reranked.spec().limit, 1);
        assert!(reranked.spec().reranker.is_some());
    }

    #[test]
    fn empty_vectors_are_rejected() {
        let err = table()
            .vector_search(Vec::<f32>::new())
            .expect_err("empty vector");
        assert!(matches!(err, VqError::InvalidInput(_)));
    }
}
