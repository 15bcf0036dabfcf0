use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("trend_runs_total", "Pipeline runs, labelled by status.");
        describe_counter!("trend_items_total", "Raw items received across all sources.");
        describe_counter!("trend_topics_total", "Topics retained in ranked output.");
        describe_counter!(
            "trend_dedup_merged_total",
            "Items folded into another topic by dedup."
        );
        describe_counter!(
            "trend_source_gaps_total",
            "Expected or configured sources that delivered nothing."
        );
        describe_counter!(
            "trend_persist_failures_total",
            "Per-topic history writes that failed."
        );
        describe_counter!(
            "trend_history_pruned_total",
            "Topics removed from history after falling behind the horizon."
        );
        describe_counter!(
            "trend_rules_skipped_total",
            "Malformed rule entries skipped at load."
        );
        describe_gauge!("trend_last_run_ts", "Unix ts when the pipeline last ran.");
        describe_histogram!("trend_run_ms", "Pipeline run duration in milliseconds.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Call once per process.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Handle backed by a recorder that is not installed globally (tests, embedding).
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
