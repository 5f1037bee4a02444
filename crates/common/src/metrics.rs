use std::sync::Arc;

use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Per-connection prometheus registry for query and write activity.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    queries: CounterVec,
    query_rows: CounterVec,
    query_batches: CounterVec,
    query_seconds: HistogramVec,
    writes: CounterVec,
    write_rows: CounterVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    pub fn record_query(&self, table: &str, kind: &str, rows: u64, batches: u64, secs: f64) {
        let labels = [table, kind];
        self.inner.queries.with_label_values(&labels).inc();
        self.inner
            .query_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
        self.inner
            .query_batches
            .with_label_values(&labels)
            .inc_by(batches as f64);
        self.inner
            .query_seconds
            .with_label_values(&labels)
            .observe(secs.max(0.0));
    }

    pub fn record_write(&self, table: &str, op: &str, rows: u64) {
        let labels = [table, op];
        self.inner.writes.with_label_values(&labels).inc();
        self.inner
            .write_rows
            .with_label_values(&labels)
            .inc_by(rows as f64);
    }

    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let query_labels = &["table", "kind"];
        let write_labels = &["table", "op"];

        let queries = counter_vec(
            &registry,
            "vq_queries_total",
            "Queries executed per table and query kind",
            query_labels,
        );
        let query_rows = counter_vec(
            &registry,
            "vq_query_rows_total",
            "Rows returned by queries",
            query_labels,
        );
        let query_batches = counter_vec(
            &registry,
            "vq_query_batches_total",
            "Batches streamed back by queries",
            query_labels,
        );
        let query_seconds = histogram_vec(
            &registry,
            "vq_query_seconds",
            "Wall time from dispatch to last batch",
            query_labels,
        );
        let writes = counter_vec(
            &registry,
            "vq_writes_total",
            "Write operations per table",
            write_labels,
        );
        let write_rows = counter_vec(
            &registry,
            "vq_write_rows_total",
            "Rows affected by write operations",
            write_labels,
        );

        Self {
            registry,
            queries,
            query_rows,
            query_batches,
            query_seconds,
            writes,
            write_rows,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn histogram_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> HistogramVec {
    let h = HistogramVec::new(HistogramOpts::new(name, help), labels).expect("histogram vec");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;

    #[test]
    fn renders_query_and_write_families() {
        let m = MetricsRegistry::new();
        m.record_query("docs", "vector", 10, 2, 0.01);
        m.record_write("docs", "add", 3);
        let text = m.render_prometheus();
        assert!(text.contains("vq_queries_total"));
        assert!(text.contains("vq_query_rows_total"));
        assert!(text.contains("vq_query_batches_total"));
        assert!(text.contains("vq_query_seconds"));
        assert!(text.contains("vq_writes_total"));
        assert!(text.contains("vq_write_rows_total"));
        assert!(text.contains("vector"));
    }
}
