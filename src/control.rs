//! Control API for manual pool management.
//!
//! Provides HTTP endpoints for inspecting and driving the pool outside of the
//! normal request and sweep flow. Intended to run on a separate admin port.
//!
//! ## Endpoints
//!
//! | Method | Path              | Description                                   |
//! |--------|-------------------|-----------------------------------------------|
//! | GET    | `/control/status` | Roster, idle times, wakes in flight           |
//! | POST   | `/control/sweep`  | Run one auto-pause sweep now                  |
//! | POST   | `/control/reload` | Reload the roster from its source             |
//! | POST   | `/control/wake`   | Wake a VM and wait until it answers           |
//! | POST   | `/control/pause`  | Ask the provider to pause a VM                |

use crate::api::status_for;
use crate::orchestrator::{PoolOrchestrator, PoolStatus};
use crate::types::{SweepReport, VmRecord};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

/// Build the control API router.
pub fn control_router(orchestrator: PoolOrchestrator) -> Router {
    Router::new()
        .route("/control/status", get(get_status))
        .route("/control/sweep", post(run_sweep))
        .route("/control/reload", post(reload_roster))
        .route("/control/wake", post(wake_vm))
        .route("/control/pause", post(pause_vm))
        .with_state(orchestrator)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct VmRequest {
    id: String,
}

#[derive(Serialize)]
struct MessageResponse {
    message: String,
}

#[derive(Serialize)]
struct WakeResponse {
    message: String,
    address: String,
}

#[derive(Serialize)]
struct ReloadResponse {
    message: String,
    count: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ControlResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_status(State(orchestrator): State<PoolOrchestrator>) -> Json<PoolStatus> {
    Json(orchestrator.status().await)
}

async fn run_sweep(State(orchestrator): State<PoolOrchestrator>) -> Json<SweepReport> {
    Json(orchestrator.sweep_once().await)
}

async fn reload_roster(
    State(orchestrator): State<PoolOrchestrator>,
) -> ControlResult<ReloadResponse> {
    match orchestrator.reload_roster().await {
        Ok(count) => Ok(Json(ReloadResponse {
            message: format!("Roster reloaded with {} VMs", count),
            count,
        })),
        Err(e) => Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to reload roster: {}", e),
        )),
    }
}

async fn wake_vm(
    State(orchestrator): State<PoolOrchestrator>,
    Json(body): Json<VmRequest>,
) -> ControlResult<WakeResponse> {
    let vm = find(&orchestrator, &body.id).await?;

    match orchestrator.resume_and_await(&vm).await {
        Ok(address) => Ok(Json(WakeResponse {
            message: format!("VM {} woken", vm.name),
            address,
        })),
        Err(e) => Err(error(status_for(&e), format!("Failed to wake VM: {}", e))),
    }
}

async fn pause_vm(
    State(orchestrator): State<PoolOrchestrator>,
    Json(body): Json<VmRequest>,
) -> ControlResult<MessageResponse> {
    let vm = find(&orchestrator, &body.id).await?;

    if !orchestrator.pause_vm(&vm).await {
        return Err(error(
            StatusCode::BAD_GATEWAY,
            format!("Provider rejected pause of VM {}", vm.name),
        ));
    }

    Ok(Json(MessageResponse {
        message: format!("VM {} paused", vm.name),
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn find(
    orchestrator: &PoolOrchestrator,
    id: &str,
) -> Result<VmRecord, (StatusCode, Json<ErrorResponse>)> {
    orchestrator
        .find_vm(id)
        .await
        .ok_or_else(|| error(StatusCode::NOT_FOUND, format!("VM not found: {}", id)))
}

fn error(status: StatusCode, message: String) -> (StatusCode, Json<ErrorResponse>) {
    (status, Json(ErrorResponse { error: message }))
}
