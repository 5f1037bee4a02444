//! Flat vector search and BM25 full-text scoring over a table snapshot.

use std::collections::HashMap;

use arrow::array::{Array, AsArray};
use arrow::compute::kernels::cast::cast;
use arrow::datatypes::Float64Type;
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;
use vq_common::{Result, VqError};
use vq_execution::DistanceMetric;

/// BM25 term-frequency saturation.
pub const BM25_K1: f64 = 1.2;
/// BM25 length normalization.
pub const BM25_B: f64 = 0.75;

/// Distance between two equal-length vectors; lower is closer.
pub fn distance(metric: DistanceMetric, a: &[f64], b: &[f64]) -> f64 {
    match metric {
        DistanceMetric::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        DistanceMetric::Cosine => {
            let (mut dot, mut norm_a, mut norm_b) = (0.0, 0.0, 0.0);
            for (x, y) in a.iter().zip(b) {
                dot += x * y;
                norm_a += x * x;
                norm_b += y * y;
            }
            let denom = norm_a.sqrt() * norm_b.sqrt();
            if denom < 1e-12 { 1.0 } else { 1.0 - dot / denom }
        }
        DistanceMetric::Dot => -a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>(),
        DistanceMetric::Hamming => a.iter().zip(b).filter(|(x, y)| x != y).count() as f64,
    }
}

/// Pick the vector column: the named one, or the only fixed-size-list column.
pub fn resolve_vector_column(batch_schema: &arrow_schema::Schema, name: Option<&str>) -> Result<String> {
    let is_vector = |dt: &DataType| {
        matches!(dt, DataType::FixedSizeList(child, _)
            if matches!(child.data_type(), DataType::Float16 | DataType::Float32 | DataType::Float64 | DataType::UInt8 | DataType::Int8))
    };
    if let Some(name) = name {
        let field = batch_schema.field_with_name(name).map_err(|_| {
            VqError::MissingColumn(format!("vector column '{name}' does not exist"))
        })?;
        if !is_vector(field.data_type()) {
            return Err(VqError::InvalidInput(format!(
                "column '{name}' of type {} is not a vector column",
                field.data_type()
            )));
        }
        return Ok(name.to_string());
    }
    let candidates = batch_schema
        .fields()
        .iter()
        .filter(|f| is_vector(f.data_type()))
        .map(|f| f.name().clone())
        .collect::<Vec<_>>();
    match candidates.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(VqError::InvalidInput(
            "table has no vector column to search".to_string(),
        )),
        many => Err(VqError::InvalidInput(format!(
            "table has several vector columns ({}); name one with column()",
            many.join(", ")
        ))),
    }
}

/// Distance of every row of `column` to `query`; rows holding a null vector
/// get `None`.
pub fn vector_distances(
    batch: &RecordBatch,
    column: &str,
    query: &[f64],
    metric: DistanceMetric,
) -> Result<Vec<Option<f64>>> {
    let array = batch
        .column_by_name(column)
        .ok_or_else(|| VqError::MissingColumn(format!("vector column '{column}' does not exist")))?;
    let list = array.as_fixed_size_list_opt().ok_or_else(|| {
        VqError::InvalidInput(format!("column '{column}' is not a fixed-size list"))
    })?;
    let dim = list.value_length() as usize;
    if dim != query.len() {
        return Err(VqError::InvalidInput(format!(
            "query vector has {} elements but column '{column}' holds vectors of {dim}",
            query.len()
        )));
    }
    let values = cast(list.values(), &DataType::Float64)?;
    let values = values.as_primitive::<Float64Type>().values();
    Ok((0..list.len())
        .map(|row| {
            if list.is_null(row) {
                return None;
            }
            let start = list.value_offset(row) as usize;
            Some(distance(metric, &values[start..start + dim], query))
        })
        .collect())
}

/// Lowercase and split on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// BM25 score of every row over the concatenated text of `columns`.
/// Rows that match no query term score `0.0`.
pub fn bm25_scores(batch: &RecordBatch, columns: &[String], query: &str) -> Result<Vec<f64>> {
    let query_terms = tokenize(query);
    let mut docs: Vec<Vec<String>> = vec![Vec::new(); batch.num_rows()];
    for name in columns {
        let array = batch
            .column_by_name(name)
            .ok_or_else(|| VqError::MissingColumn(format!("text column '{name}' does not exist")))?;
        let text = cast(array, &DataType::Utf8)?;
        for (row, value) in text.as_string::<i32>().iter().enumerate() {
            if let Some(value) = value {
                docs[row].extend(tokenize(value));
            }
        }
    }
    if query_terms.is_empty() || docs.is_empty() {
        return Ok(vec![0.0; docs.len()]);
    }

    let n = docs.len() as f64;
    let avgdl = (docs.iter().map(Vec::len).sum::<usize>() as f64 / n).max(1.0);
    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for term in &query_terms {
        if doc_freq.contains_key(term.as_str()) {
            continue;
        }
        let df = docs.iter().filter(|d| d.iter().any(|t| t == term)).count();
        doc_freq.insert(term.as_str(), df);
    }

    Ok(docs
        .iter()
        .map(|doc| {
            let dl = doc.len() as f64;
            query_terms
                .iter()
                .map(|term| {
                    let df = doc_freq.get(term.as_str()).copied().unwrap_or(0) as f64;
                    let tf = doc.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        return 0.0;
                    }
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl))
                })
                .sum()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::{FixedSizeListArray, Float32Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow_schema::{DataType, Field, Schema};
    use vq_execution::DistanceMetric;

    use super::{bm25_scores, distance, resolve_vector_column, tokenize, vector_distances};

    fn vectors() -> RecordBatch {
        let item = Arc::new(Field::new("item", DataType::Float32, true));
        let values = Float32Array::from(vec![0.0, 0.0, 1.0, 0.0, 3.0, 4.0]);
        let list = FixedSizeListArray::try_new(item.clone(), 2, Arc::new(values), None).expect("fsl");
        let schema = Arc::new(Schema::new(vec![
            Field::new("vec", DataType::FixedSizeList(item, 2), true),
            Field::new("text", DataType::Utf8, true),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(list),
                Arc::new(StringArray::from(vec![
                    Some("the quick brown fox"),
                    Some("lazy dog"),
                    Some("Fox, fox and more FOX"),
                ])),
            ],
        )
        .expect("batch")
    }

    #[test]
    fn metrics_follow_lower_is_closer() {
        assert_eq!(distance(DistanceMetric::L2, &[0.0, 0.0], &[3.0, 4.0]), 25.0);
        assert!(distance(DistanceMetric::Cosine, &[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-12);
        assert_eq!(distance(DistanceMetric::Dot, &[1.0, 2.0], &[3.0, 4.0]), -11.0);
        assert_eq!(distance(DistanceMetric::Hamming, &[1.0, 0.0, 1.0], &[1.0, 1.0, 0.0]), 2.0);
    }

    #[test]
    fn flat_search_over_fixed_size_lists() {
        let batch = vectors();
        let column = resolve_vector_column(&batch.schema(), None).expect("column");
        assert_eq!(column, "vec");
        let d = vector_distances(&batch, &column, &[1.0, 0.0], DistanceMetric::L2).expect("distances");
        assert_eq!(d, vec![Some(1.0), Some(0.0), Some(20.0)]);
        assert!(vector_distances(&batch, &column, &[1.0], DistanceMetric::L2).is_err());
    }

    #[test]
    fn bm25_prefers_higher_term_frequency() {
        assert_eq!(tokenize("Fox, fox!"), vec!["fox", "fox"]);
        let scores = bm25_scores(&vectors(), &["text".to_string()], "fox").expect("scores");
        assert_eq!(scores[1], 0.0);
        assert!(scores[2] > scores[0]);
        assert!(scores[0] > 0.0);
    }
}
