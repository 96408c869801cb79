//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter, registers
//! human-readable descriptions for each metric, and serves the scrape endpoint.

use axum::{Router, extract::State, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works:
/// the `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving `GET /metrics` in the Prometheus text format.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .with_state(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn describe() {
    // -- Request path --
    describe_counter!(
        "wakeup_requests_total",
        "Instance requests by outcome (active, resumed, or an error reason)"
    );
    describe_gauge!(
        "wakeup_active_vms",
        "VMs that answered the readiness probe at the last classification"
    );

    // -- Wake / pre-warm --
    describe_counter!(
        "wakeup_wake_triggers_total",
        "Resume requests sent to the provider, by result"
    );
    describe_histogram!(
        "wakeup_wake_duration_seconds",
        "Time from an accepted resume to the VM answering its probe"
    );
    describe_counter!(
        "wakeup_prewarm_total",
        "Background wakes started to reach the target active count"
    );

    // -- Auto-pause --
    describe_counter!(
        "wakeup_pause_triggers_total",
        "Pause requests sent to the provider, by result"
    );
}
