//! Result merging and reciprocal-rank fusion.
//!
//! Rerankers work on whole batches keyed by `_rowid`. Fusion scores are
//! attached as `_relevance_score` and rows are ordered by it, highest first,
//! with ties kept in merge order.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Float32Array, UInt32Array};
use arrow::compute::{concat_batches, take_record_batch};
use arrow::datatypes::UInt64Type;
use arrow::record_batch::RecordBatch;
use arrow_schema::{Schema, SchemaRef};
use tracing::debug;
use vq_common::{
    DISTANCE_COLUMN, RELEVANCE_SCORE_COLUMN, ROW_ID_COLUMN, Result, SCORE_COLUMN, VqError,
};
use vq_execution::schema::relevance_score_field;

/// Default reciprocal-rank-fusion constant.
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuses independently ranked result batches into one ranking.
pub trait Reranker: Send + Sync + Debug {
    /// Fuse vector and full-text results for `query`, keeping at most `limit`
    /// rows (`0` keeps all).
    fn rerank_hybrid(
        &self,
        query: &str,
        vector_results: &RecordBatch,
        fts_results: &RecordBatch,
        limit: usize,
    ) -> Result<RecordBatch>;

    /// Concatenate `a` then `b`, keeping the first row seen per `_rowid`.
    /// Score columns are carried along untouched.
    fn merge_results(&self, a: &RecordBatch, b: &RecordBatch) -> Result<RecordBatch> {
        if a.schema().fields() != b.schema().fields() {
            return Err(VqError::SchemaMismatch(format!(
                "cannot merge results with columns [{}] and [{}]",
                field_names(&a.schema()),
                field_names(&b.schema())
            )));
        }
        let combined = concat_batches(&a.schema(), [a, b])?;
        let ids = row_ids(&combined)?;
        let mut seen = HashSet::with_capacity(ids.len());
        let keep = ids
            .iter()
            .enumerate()
            .filter(|(_, id)| seen.insert(**id))
            .map(|(i, _)| i as u32)
            .collect::<Vec<_>>();
        if keep.len() == combined.num_rows() {
            return Ok(combined);
        }
        Ok(take_record_batch(&combined, &UInt32Array::from(keep))?)
    }

    /// Fuse N vector result sets, optionally dropping repeated row ids first.
    fn rerank_multivector(
        &self,
        batches: &[RecordBatch],
        query: &str,
        deduplicate: bool,
    ) -> Result<RecordBatch> {
        let Some(first) = batches.first() else {
            return Err(VqError::InvalidInput(
                "rerank_multivector needs at least one result batch".to_string(),
            ));
        };
        for batch in batches {
            if batch.schema().column_with_name(ROW_ID_COLUMN).is_none() {
                return Err(VqError::MissingColumn(format!(
                    "multi-vector reranking requires the '{ROW_ID_COLUMN}' column; \
                     call with_row_id(true) on the query"
                )));
            }
            if batch.schema().fields() != first.schema().fields() {
                return Err(VqError::SchemaMismatch(
                    "multi-vector results do not share one schema".to_string(),
                ));
            }
        }
        let schema = first.schema();
        let mut combined = concat_batches(&schema, batches)?;
        let empty = RecordBatch::new_empty(schema);
        if deduplicate {
            combined = self.merge_results(&combined, &empty)?;
        }
        self.rerank_hybrid(query, &combined, &empty, 0)
    }
}

/// Which score columns survive fusion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnScore {
    /// Keep only `_relevance_score`.
    #[default]
    Relevance,
    /// Also keep `_distance` / `_score` from the inputs.
    All,
}

/// Reciprocal-rank fusion: a row at 0-based rank `i` in a source list gains
/// `1 / (i + k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RrfReranker {
    k: f32,
    return_score: ReturnScore,
}

impl Default for RrfReranker {
    fn default() -> Self {
        Self::new(DEFAULT_RRF_K)
    }
}

impl RrfReranker {
    pub fn new(k: f32) -> Self {
        Self {
            k,
            return_score: ReturnScore::Relevance,
        }
    }

    pub fn with_return_score(mut self, return_score: ReturnScore) -> Self {
        self.return_score = return_score;
        self
    }

    pub fn k(&self) -> f32 {
        self.k
    }

    pub fn return_score(&self) -> ReturnScore {
        self.return_score
    }

    /// Fused score per row id over `lists`, in list order.
    pub fn fuse_scores(&self, lists: &[&[u64]]) -> HashMap<u64, f32> {
        let mut scores = HashMap::with_capacity(lists.iter().map(|l| l.len()).sum());
        for list in lists {
            for (rank, id) in list.iter().enumerate() {
                *scores.entry(*id).or_insert(0.0) += 1.0 / (rank as f32 + self.k);
            }
        }
        scores
    }
}

impl Reranker for RrfReranker {
    fn rerank_hybrid(
        &self,
        query: &str,
        vector_results: &RecordBatch,
        fts_results: &RecordBatch,
        limit: usize,
    ) -> Result<RecordBatch> {
        let vector_ids = row_ids(vector_results)?;
        let fts_ids = row_ids(fts_results)?;
        let scores = self.fuse_scores(&[&vector_ids, &fts_ids]);

        let merged = self.merge_results(vector_results, fts_results)?;
        let merged_ids = row_ids(&merged)?;
        let relevance = merged_ids
            .iter()
            .map(|id| scores.get(id).copied().unwrap_or(0.0))
            .collect::<Vec<f32>>();

        let mut order = (0..merged.num_rows() as u32).collect::<Vec<_>>();
        // stable: equal scores keep merge order
        order.sort_by(|&a, &b| relevance[b as usize].total_cmp(&relevance[a as usize]));
        if limit > 0 {
            order.truncate(limit);
        }

        let scored = with_relevance(&merged, relevance, self.return_score)?;
        let out = take_record_batch(&scored, &UInt32Array::from(order))?;
        debug!(
            operator = "RrfReranker",
            query,
            vector_rows = vector_results.num_rows(),
            fts_rows = fts_results.num_rows(),
            output_rows = out.num_rows(),
            "reranked hybrid results"
        );
        Ok(out)
    }
}

/// Row ids of `batch` as a vector.
pub fn row_ids(batch: &RecordBatch) -> Result<Vec<u64>> {
    let column = batch.column_by_name(ROW_ID_COLUMN).ok_or_else(|| {
        VqError::MissingColumn(format!(
            "reranking requires the '{ROW_ID_COLUMN}' column in every result"
        ))
    })?;
    let ids = column.as_primitive_opt::<UInt64Type>().ok_or_else(|| {
        VqError::TypeMismatch(format!(
            "'{ROW_ID_COLUMN}' must be UInt64, found {}",
            column.data_type()
        ))
    })?;
    if ids.null_count() > 0 {
        return Err(VqError::InvalidInput(format!(
            "'{ROW_ID_COLUMN}' must not contain nulls"
        )));
    }
    Ok(ids.values().to_vec())
}

fn with_relevance(
    batch: &RecordBatch,
    relevance: Vec<f32>,
    return_score: ReturnScore,
) -> Result<RecordBatch> {
    let schema = batch.schema();
    let mut fields = Vec::with_capacity(schema.fields().len() + 1);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.capacity());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        let name = field.name();
        let is_score = name == DISTANCE_COLUMN || name == SCORE_COLUMN;
        if name == RELEVANCE_SCORE_COLUMN || (is_score && return_score == ReturnScore::Relevance) {
            continue;
        }
        fields.push(field.as_ref().clone());
        columns.push(column.clone());
    }
    // `_rowid` stays last
    let at = fields
        .iter()
        .position(|f| f.name() == ROW_ID_COLUMN)
        .unwrap_or(fields.len());
    fields.insert(at, relevance_score_field());
    columns.insert(at, Arc::new(Float32Array::from(relevance)));
    let schema: SchemaRef = Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()));
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn field_names(schema: &Schema) -> String {
    schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{AsArray, Float32Array, StringArray, UInt64Array};
    use arrow::datatypes::{Float32Type, UInt64Type};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema, SchemaRef};
    use vq_common::VqError;

    use super::{ReturnScore, Reranker, RrfReranker};

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("text", DataType::Utf8, true),
            Field::new("_distance", DataType::Float32, true),
            Field::new("_rowid", DataType::UInt64, false),
        ]))
    }

    fn results(ids: &[u64]) -> RecordBatch {
        RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(StringArray::from(
                    ids.iter().map(|id| format!("doc-{id}")).collect::<Vec<_>>(),
                )),
                Arc::new(Float32Array::from(
                    ids.iter().map(|id| *id as f32).collect::<Vec<_>>(),
                )),
                Arc::new(UInt64Array::from(ids.to_vec())),
            ],
        )
        .expect("batch")
    }

    fn ids(batch: &RecordBatch) -> Vec<u64> {
        batch
            .column_by_name("_rowid")
            .expect("rowid")
            .as_primitive::<UInt64Type>()
            .values()
            .to_vec()
    }

    fn relevance(batch: &RecordBatch) -> Vec<f32> {
        batch
            .column_by_name("_relevance_score")
            .expect("relevance")
            .as_primitive::<Float32Type>()
            .values()
            .to_vec()
    }

    #[test]
    fn rank_zero_and_rank_two_sum_reciprocals() {
        let reranker = RrfReranker::default();
        let out = reranker
            .rerank_hybrid("q", &results(&[7, 1, 2]), &results(&[3, 4, 7]), 0)
            .expect("rerank");
        assert_eq!(ids(&out)[0], 7);
        let expected = 1.0 / 60.0 + 1.0 / 62.0;
        assert!((relevance(&out)[0] - expected).abs() < 1e-6);
        assert!(out.column_by_name("_distance").is_none());
        let names = out
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["text", "_relevance_score", "_rowid"]);
    }

    #[test]
    fn limit_keeps_the_highest_scored_rows() {
        let reranker = RrfReranker::default();
        let out = reranker
            .rerank_hybrid("q", &results(&[0, 1, 2, 3, 4]), &results(&[5, 6, 7, 8, 9]), 3)
            .expect("rerank");
        assert_eq!(out.num_rows(), 3);
        // equal scores per rank keep merge order: vector rank 0, fts rank 0, vector rank 1
        assert_eq!(ids(&out), vec![0, 5, 1]);
    }

    #[test]
    fn reranking_is_deterministic() {
        let reranker = RrfReranker::new(60.0);
        let a = results(&[3, 1, 4, 1, 5]);
        let b = results(&[9, 2, 6, 5, 3]);
        let first = reranker.rerank_hybrid("q", &a, &b, 0).expect("rerank");
        let second = reranker.rerank_hybrid("q", &a, &b, 0).expect("rerank");
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(relevance(&first), relevance(&second));
    }

    #[test]
    fn merging_a_batch_with_itself_collapses_duplicates() {
        let reranker = RrfReranker::default();
        let a = results(&[4, 2, 9]);
        let merged = reranker.merge_results(&a, &a).expect("merge");
        assert_eq!(ids(&merged), vec![4, 2, 9]);
    }

    #[test]
    fn merging_different_schemas_fails() {
        let reranker = RrfReranker::default();
        let other = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("_rowid", DataType::UInt64, false)])),
            vec![Arc::new(UInt64Array::from(vec![1_u64]))],
        )
        .expect("batch");
        let err = reranker.merge_results(&results(&[1]), &other).expect_err("mismatch");
        assert!(matches!(err, VqError::SchemaMismatch(_)));
    }

    #[test]
    fn multivector_requires_row_ids() {
        let reranker = RrfReranker::default();
        let no_ids = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("text", DataType::Utf8, true)])),
            vec![Arc::new(StringArray::from(vec!["a"]))],
        )
        .expect("batch");
        let err = reranker
            .rerank_multivector(&[no_ids], "q", true)
            .expect_err("missing");
        assert!(matches!(err, VqError::MissingColumn(_)));
    }

    #[test]
    fn multivector_fuses_over_concatenated_order() {
        let reranker = RrfReranker::default().with_return_score(ReturnScore::All);
        let out = reranker
            .rerank_multivector(&[results(&[1, 2]), results(&[2, 3])], "q", false)
            .expect("rerank");
        // row 2 appears at ranks 1 and 2 of the concatenation
        assert_eq!(ids(&out), vec![2, 1, 3]);
        assert!(out.column_by_name("_distance").is_some());
    }
}
