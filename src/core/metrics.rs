use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled {
        return Ok(());
    }

    if PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    describe();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe() {
    metrics::describe_counter!("http_requests_total", "HTTP responses by status code");
    metrics::describe_histogram!("http_request_duration_seconds", "HTTP request latency");
    metrics::describe_counter!("artifacts_registered_total", "Artifacts accepted at upload");
    metrics::describe_counter!(
        "submission_transitions_total",
        "Submission request state transitions by target state"
    );
    metrics::describe_counter!("submission_attempts_total", "Submission attempts started");
    metrics::describe_histogram!("lms_step_duration_seconds", "LMS protocol step latency");
    metrics::describe_counter!("lms_failures_total", "LMS failures by step and kind");
    metrics::describe_gauge!("submission_requests_stuck", "In-flight requests with expired leases");
}
