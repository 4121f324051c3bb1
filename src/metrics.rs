use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

pub static METRICS: Lazy<SchemaguardMetrics> = Lazy::new(SchemaguardMetrics::init);

pub struct SchemaguardMetrics {
    registry: Registry,
    pub queries_total: IntCounter,
    pub query_errors_total: IntCounter,
    pub query_duration: Histogram,
    pub migrations_total: IntCounterVec,
    pub rpc_requests_total: IntCounterVec,
    pub rpc_duration: HistogramVec,
}

impl SchemaguardMetrics {
    pub fn init() -> Self {
        let registry = Registry::new_custom(Some("schemaguard".to_string()), None)
            .expect("static registry prefix is valid");

        let queries_total = IntCounter::new("queries_total", "Total queries executed")
            .expect("static metric definition");
        let query_errors_total = IntCounter::new("query_errors_total", "Queries that returned an error")
            .expect("static metric definition");
        let query_duration = Histogram::with_opts(HistogramOpts::new(
            "query_duration_seconds",
            "Duration of queries",
        ))
        .expect("static metric definition");
        let migrations_total = IntCounterVec::new(
            Opts::new("migrations_total", "Migration outcomes by status"),
            &["status"],
        )
        .expect("static metric definition");
        let rpc_requests_total = IntCounterVec::new(
            Opts::new("rpc_requests_total", "Agent calls by action and outcome"),
            &["action", "status"],
        )
        .expect("static metric definition");
        let rpc_duration = HistogramVec::new(
            HistogramOpts::new("rpc_duration_seconds", "Agent call latency"),
            &["action"],
        )
        .expect("static metric definition");

        for collector in [
            Box::new(queries_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(query_errors_total.clone()),
            Box::new(query_duration.clone()),
            Box::new(migrations_total.clone()),
            Box::new(rpc_requests_total.clone()),
            Box::new(rpc_duration.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                log::warn!("Failed to register metric: {}", e);
            }
        }

        Self {
            registry,
            queries_total,
            query_errors_total,
            query_duration,
            migrations_total,
            rpc_requests_total,
            rpc_duration,
        }
    }

    pub fn record_query(&self, elapsed: Duration) {
        self.queries_total.inc();
        self.query_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_query_error(&self) {
        self.query_errors_total.inc();
    }

    pub fn record_migration(&self, status: &str) {
        self.migrations_total.with_label_values(&[status]).inc();
    }

    pub fn record_rpc(&self, action: &str, status: &str, elapsed: Duration) {
        self.rpc_requests_total.with_label_values(&[action, status]).inc();
        self.rpc_duration
            .with_label_values(&[action])
            .observe(elapsed.as_secs_f64());
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            log::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        let metrics = SchemaguardMetrics::init();
        metrics.record_rpc("ping", "success", Duration::from_millis(3));
        metrics.record_migration("applied");

        let text = metrics.render();
        assert!(text.contains("schemaguard_rpc_requests_total"));
        assert!(text.contains("action=\"ping\""));
        assert!(text.contains("schemaguard_migrations_total{status=\"applied\"} 1"));
    }
}
