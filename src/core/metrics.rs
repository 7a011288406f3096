use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled || PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

pub(crate) fn session_started(outcome: &'static str) {
    metrics::counter!("exam_sessions_started_total", "outcome" => outcome).increment(1);
}

pub(crate) fn session_finalized(mode: &'static str) {
    metrics::counter!("exam_sessions_finalized_total", "mode" => mode).increment(1);
}

pub(crate) fn auto_submit_fired(outcome: &'static str) {
    metrics::counter!("exam_auto_submit_total", "outcome" => outcome).increment(1);
}

pub(crate) fn grading_job(outcome: &'static str) {
    metrics::counter!("exam_grading_jobs_total", "outcome" => outcome).increment(1);
}

pub(crate) fn lobby_connections(delta: f64) {
    metrics::gauge!("exam_lobby_connections").increment(delta);
}
