use std::sync::OnceLock;

use metrics::{describe_counter, describe_histogram, Unit};
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
    describe_grading_metrics();
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

fn describe_grading_metrics() {
    describe_counter!("grading_jobs_total", "Grading attempts by outcome");
    describe_counter!("grading_jobs_enqueued_total", "Grading jobs accepted for processing");
    describe_counter!("grading_jobs_recovered_total", "Stale claims returned to the queue");
    describe_counter!(
        "grading_credential_penalties_total",
        "Rate-limit responses observed per credential"
    );
    describe_counter!("grading_drain_rounds_total", "Dispatch rounds executed");
    describe_histogram!(
        "grading_duration_seconds",
        Unit::Seconds,
        "Scorer call duration, including failed calls"
    );
    describe_histogram!(
        "grading_queue_latency_seconds",
        Unit::Seconds,
        "Time between enqueue and claim"
    );
}
