//! # wakeup
//!
//! On-demand wake/sleep orchestration for a pool of GPU inference VMs.
//!
//! This crate provides:
//! - **Orchestrator**: Hands out a ready VM, waking one when the pool is asleep
//! - **Pre-warming**: Wakes extra VMs in the background up to a target count
//! - **Auto-pause**: Periodically pauses VMs that have been idle too long
//! - **Control API**: Admin endpoints for status, sweeps, and manual actions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          wakeup                             │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ Instance API             GET /request-instance       │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │                          │                                  │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ PoolOrchestrator                                     │   │
//! │  │ - Classifies VMs via the readiness probe             │   │
//! │  │ - Wakes / pre-warms / pauses via the provider API    │   │
//! │  │ - Background sweeper pauses idle VMs                 │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │               │                          │                  │
//! │        TCP connect probe         provider action API        │
//! │               ▼                          ▼                  │
//! │   [vm1:11434] [vm2:11434] ...    POST /{id}/actions/resume/ │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
mod config;
pub mod control;
mod orchestrator;
pub mod probe;
pub mod provider;
mod registry;
pub mod roster;
pub mod telemetry;
mod types;

pub use config::{Config, PoolConfig, ProviderConfig};
pub use orchestrator::{PoolOrchestrator, PoolSettings, PoolStatus, VmStatus};
pub use probe::{ReadinessProbe, TcpProbe};
pub use provider::{HttpActionClient, ProviderError, VmActionClient};
pub use roster::{RosterEntry, RosterError, RosterSource};
pub use types::{InstanceGrant, PoolError, PoolSnapshot, SweepReport, VmAction, VmRecord};

use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the complete wakeup stack
///
/// Returns:
/// - The instance request router
/// - An optional metrics router (when `config.metrics_port > 0`)
/// - The control API router (for the admin port)
/// - The orchestrator, for callers that want to drive it directly
pub async fn build_app(
    config: Config,
    shutdown: CancellationToken,
) -> Result<(Router, Option<Router>, Router, PoolOrchestrator)> {
    let actions = HttpActionClient::from_config(&config.provider)
        .context("Failed to configure provider action client")?;
    let probe = TcpProbe::new(Duration::from_secs(config.pool.probe_timeout_secs));

    build_app_with(config, Arc::new(probe), Arc::new(actions), shutdown).await
}

/// Like [`build_app`], with the probe and provider client supplied by the caller.
pub async fn build_app_with(
    config: Config,
    probe: Arc<dyn ReadinessProbe>,
    actions: Arc<dyn VmActionClient>,
    shutdown: CancellationToken,
) -> Result<(Router, Option<Router>, Router, PoolOrchestrator)> {
    let source = config.roster_source();

    // An unreadable roster leaves the pool empty; a later reload can fix it
    let roster = match source.load().await {
        Ok(roster) => roster,
        Err(e) => {
            error!(source = %source.describe(), error = %e, "Failed to load VM roster");
            Vec::new()
        }
    };

    info!(
        vms = ?roster.iter().map(|vm| vm.name.as_str()).collect::<Vec<_>>(),
        source = %source.describe(),
        "Building wakeup"
    );

    let orchestrator = PoolOrchestrator::with_roster_source(
        roster,
        Some(source),
        probe,
        actions,
        config.pool.settings(),
        shutdown,
    );

    // Sweeper exits on its own once the shutdown token fires
    let _sweeper_handle = orchestrator.spawn_sweeper();

    let app = api::instance_router(orchestrator.clone()).layer(TraceLayer::new_for_http());
    let control = control::control_router(orchestrator.clone());

    let metrics_router = if config.metrics_port > 0 {
        telemetry::install().map(telemetry::metrics_router)
    } else {
        None
    };

    Ok((app, metrics_router, control, orchestrator))
}
