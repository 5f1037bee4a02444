//! Output schema of a query, shared by engine and client.

use std::sync::Arc;

use arrow_schema::{DataType, Field, Schema, SchemaRef};
use vq_common::{
    DISTANCE_COLUMN, QUERY_INDEX_COLUMN, RELEVANCE_SCORE_COLUMN, ROW_ID_COLUMN, Result,
    SCORE_COLUMN, VqError,
};

use crate::transport::QueryRequest;

/// Which score column a request attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreColumn {
    /// No score column.
    None,
    /// `_distance`, attached by vector search.
    Distance,
    /// `_score`, attached by full-text search.
    Score,
}

impl ScoreColumn {
    /// Score column implied by a request.
    pub fn for_request(request: &QueryRequest, vector: bool) -> Self {
        if vector {
            ScoreColumn::Distance
        } else if request.full_text.is_some() {
            ScoreColumn::Score
        } else {
            ScoreColumn::None
        }
    }
}

/// `_rowid` field.
pub fn row_id_field() -> Field {
    Field::new(ROW_ID_COLUMN, DataType::UInt64, false)
}

/// `_distance` field.
pub fn distance_field() -> Field {
    Field::new(DISTANCE_COLUMN, DataType::Float32, true)
}

/// `_score` field.
pub fn score_field() -> Field {
    Field::new(SCORE_COLUMN, DataType::Float32, true)
}

/// `_relevance_score` field.
pub fn relevance_score_field() -> Field {
    Field::new(RELEVANCE_SCORE_COLUMN, DataType::Float32, false)
}

/// `query_index` field.
pub fn query_index_field() -> Field {
    Field::new(QUERY_INDEX_COLUMN, DataType::UInt32, false)
}

/// Derive the output schema: projected (or all) columns in projection order,
/// then the score column, then `_rowid` when requested.
pub fn output_schema(
    table_schema: &Schema,
    request: &QueryRequest,
    score: ScoreColumn,
) -> Result<SchemaRef> {
    let mut fields = if request.columns.is_empty() {
        table_schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone())
            .collect::<Vec<_>>()
    } else {
        request
            .columns
            .iter()
            .map(|name| {
                table_schema
                    .field_with_name(name)
                    .map(|f| f.clone())
                    .map_err(|_| {
                        VqError::MissingColumn(format!("projected column '{name}' does not exist"))
                    })
            })
            .collect::<Result<Vec<_>>>()?
    };
    match score {
        ScoreColumn::None => {}
        ScoreColumn::Distance => fields.push(distance_field()),
        ScoreColumn::Score => fields.push(score_field()),
    }
    if request.with_row_id {
        fields.push(row_id_field());
    }
    Ok(Arc::new(Schema::new(fields)))
}
