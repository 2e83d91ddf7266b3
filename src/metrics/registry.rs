use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). Model
/// inference runs far longer than ordinary HTTP, so the tail extends to
/// minutes.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the admin `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Call once at startup, before any macro use. A second
    /// install (tests building several states in one process) keeps the
    /// first recorder and returns a detached handle.
    pub fn install() -> Self {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .build_recorder();
        let handle = recorder.handle();
        if metrics::set_global_recorder(recorder).is_err() {
            tracing::debug!("metrics: global recorder already installed");
        }

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed per surface"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client perspective"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Requests currently being processed per surface"
        );

        // model fleet
        describe_counter!(
            "gateway_model_requests_total",
            Unit::Count,
            "Committed model requests per instance and result"
        );
        describe_counter!(
            "gateway_model_tokens_total",
            Unit::Count,
            "Tokens accounted from model responses"
        );
        describe_histogram!(
            "gateway_model_upstream_duration_seconds",
            Unit::Seconds,
            "Model upstream duration from selection to commit"
        );

        // tool fleet
        describe_counter!(
            "gateway_tool_requests_total",
            Unit::Count,
            "Forwarded tool requests per service and result"
        );
        describe_histogram!(
            "gateway_tool_request_duration_seconds",
            Unit::Seconds,
            "Tool forwarding duration"
        );
        describe_counter!(
            "gateway_health_check_total",
            Unit::Count,
            "Tool health probe attempts"
        );
        describe_gauge!(
            "gateway_tool_health_status",
            Unit::Count,
            "Tool service health: 1=healthy 0=unhealthy"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
