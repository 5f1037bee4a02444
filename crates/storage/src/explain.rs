//! Human-readable plans for query requests.

use vq_common::Result;
use vq_execution::{
    DistanceMetric, IndexKind, PlanRequest, QueryRequest, ScoreColumn, output_schema,
};

use crate::catalog::StoredTable;
use crate::filter::Predicate;
use crate::search::resolve_vector_column;
use crate::stats::TableStats;

/// Render the plan of `request` against `table` as indented text.
///
/// The request is validated the same way execution would validate it, so an
/// invalid filter or projection fails here too.
pub fn explain_request(
    name: &str,
    table: &StoredTable,
    request: &PlanRequest,
    verbose: bool,
) -> Result<String> {
    let (base, score) = match request {
        PlanRequest::Query(q) => (q, ScoreColumn::for_request(q, false)),
        PlanRequest::Vector(v) => (&v.base, ScoreColumn::Distance),
    };
    let schema = output_schema(&table.schema, base, score)?;
    let filter = base.filter.as_deref().map(Predicate::parse).transpose()?;

    let mut lines = Vec::new();
    let columns = schema
        .fields()
        .iter()
        .map(|f| f.name().as_str())
        .collect::<Vec<_>>();
    lines.push(format!("Projection columns=[{}]", columns.join(", ")));
    if base.limit > 0 {
        lines.push(format!("Limit n={}", base.limit));
    }
    match request {
        PlanRequest::Vector(v) => {
            let column = resolve_vector_column(&table.data.schema(), v.column.as_deref())?;
            let index = match table.index_on(&column) {
                Some(idx) if idx.kind == IndexKind::IvfPq => idx.name.as_str(),
                _ => "flat",
            };
            lines.push(format!(
                "KnnSearch column={column} metric={} k={} nprobes={} refine_factor={} index={index}",
                v.metric.unwrap_or(DistanceMetric::L2).name(),
                v.base.limit,
                v.nprobes,
                v.refine_factor
                    .map_or_else(|| "none".to_string(), |f| f.to_string()),
            ));
        }
        PlanRequest::Query(QueryRequest {
            full_text: Some(text),
            ..
        }) => {
            let columns = fts_columns(table);
            lines.push(format!(
                "FullTextSearch query='{text}' columns=[{}] scorer=bm25",
                columns.join(", ")
            ));
        }
        PlanRequest::Query(_) => {}
    }
    if let Some(filter) = &filter {
        lines.push(format!("Filter {filter}"));
    }
    lines.push(format!("TableScan table={name}"));

    let mut out = String::new();
    for (depth, line) in lines.iter().enumerate() {
        let pad = "  ".repeat(depth);
        out.push_str(&format!("{pad}{line}\n"));
    }
    if verbose {
        let pad = "  ".repeat(lines.len());
        let stats = TableStats::of(table);
        out.push_str(&format!("{pad}rows={} bytes={}\n", stats.rows, stats.bytes));
        out.push_str(&format!("{pad}batch_size={}\n", base.batch_size));
        for idx in &table.indices {
            out.push_str(&format!(
                "{pad}index {} kind={:?} columns=[{}]\n",
                idx.name,
                idx.kind,
                idx.columns.join(", ")
            ));
        }
        for field in schema.fields() {
            out.push_str(&format!(
                "{pad}output {}: {} nullable={}\n",
                field.name(),
                field.data_type(),
                field.is_nullable()
            ));
        }
    }
    Ok(out)
}

/// Columns covered by a full-text index.
pub fn fts_columns(table: &StoredTable) -> Vec<String> {
    table
        .indices
        .iter()
        .filter(|idx| idx.kind == IndexKind::Fts)
        .flat_map(|idx| idx.columns.iter().cloned())
        .collect()
}
