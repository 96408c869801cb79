//! Mock cloud provider for testing wakeup
//!
//! `mock-provider --port 0 --vm vm1=127.0.0.1:15001 --vm vm2=127.0.0.1:15002`
//!
//! Serves the provider's `/{id}/actions/{resume|pause}/` API. Resuming a VM
//! opens a TCP listener on its configured address (so readiness probes
//! succeed); pausing closes it again.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-provider")]
#[command(about = "Mock VM provider API for testing")]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Expected `authorization` header value
    #[arg(long, default_value = "test-token")]
    token: String,

    /// Expected `X-CSRFTOKEN` header value
    #[arg(long, default_value = "test-csrf")]
    csrf_token: String,

    /// Managed VM as ID=HOST:PORT; repeatable
    #[arg(long = "vm", value_name = "ID=HOST:PORT", value_parser = parse_vm)]
    vms: Vec<(String, SocketAddr)>,

    /// Delay between an accepted resume and the VM's port opening (ms)
    #[arg(long, default_value = "0")]
    wake_delay_ms: u64,
}

fn parse_vm(value: &str) -> Result<(String, SocketAddr), String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got {value}"))?;
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address {addr}: {e}"))?;
    Ok((id.to_string(), addr))
}

/// Server state
struct MockState {
    token: String,
    csrf_token: String,
    vms: HashMap<String, SocketAddr>,
    wake_delay: Duration,
    /// VM id -> token that stops its listener
    running: Mutex<HashMap<String, CancellationToken>>,
    resume_count: RwLock<BTreeMap<String, u64>>,
    pause_count: RwLock<BTreeMap<String, u64>>,
    /// When true, every action returns 500
    fail_actions: RwLock<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_provider=debug,tower_http=debug")
        .init();

    let args = Args::parse();

    let state = Arc::new(MockState {
        token: args.token,
        csrf_token: args.csrf_token,
        vms: args.vms.into_iter().collect(),
        wake_delay: Duration::from_millis(args.wake_delay_ms),
        running: Mutex::new(HashMap::new()),
        resume_count: RwLock::new(BTreeMap::new()),
        pause_count: RwLock::new(BTreeMap::new()),
        fail_actions: RwLock::new(false),
    });

    let app = Router::new()
        .route("/{id}/actions/{action}/", post(action))
        .route("/stats", get(stats))
        .route("/control/fail", post(control_fail))
        .with_state(state.clone());

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;

    // Get the actual port (important when port=0 for dynamic allocation)
    let actual_port = listener.local_addr()?.port();

    info!(
        port = actual_port,
        vms = ?state.vms.keys().collect::<Vec<_>>(),
        "Mock provider listening"
    );

    // Signal readiness to stdout for test harness
    // Format: "READY <port>" on its own line
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize)]
struct ActionResponse {
    id: String,
    action: String,
    status: &'static str,
}

/// Resume or pause a VM
async fn action(
    State(state): State<Arc<MockState>>,
    Path((id, action)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        warn!(vm = %id, "Rejecting action with bad credentials");
        return (StatusCode::FORBIDDEN, "invalid credentials").into_response();
    }

    let expected_type = format!("application/json;{}", action);
    if headers.get("content-type").and_then(|v| v.to_str().ok()) != Some(expected_type.as_str())
    {
        return (StatusCode::UNSUPPORTED_MEDIA_TYPE, "unexpected content type").into_response();
    }

    let Some(&addr) = state.vms.get(&id) else {
        return (StatusCode::NOT_FOUND, "unknown vm").into_response();
    };

    if *state.fail_actions.read().await {
        warn!(vm = %id, action = %action, "Action forced to fail via /control/fail");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    match action.as_str() {
        "resume" => {
            *state.resume_count.write().await.entry(id.clone()).or_default() += 1;
            resume(&state, &id, addr).await;
        }
        "pause" => {
            *state.pause_count.write().await.entry(id.clone()).or_default() += 1;
            if let Some(token) = state.running.lock().await.remove(&id) {
                info!(vm = %id, "Pausing VM");
                token.cancel();
            }
        }
        _ => return (StatusCode::NOT_FOUND, "unknown action").into_response(),
    }

    (
        StatusCode::ACCEPTED,
        Json(ActionResponse {
            id,
            action,
            status: "accepted",
        }),
    )
        .into_response()
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    header("authorization") == Some(state.token.as_str())
        && header("x-csrftoken") == Some(state.csrf_token.as_str())
}

/// Open the VM's service port after the configured delay
async fn resume(state: &MockState, id: &str, addr: SocketAddr) {
    let mut running = state.running.lock().await;
    if running.contains_key(id) {
        info!(vm = %id, "VM already running");
        return;
    }

    let token = CancellationToken::new();
    running.insert(id.to_string(), token.clone());

    let delay = state.wake_delay;
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(vm = %id, addr = %addr, error = %e, "Failed to open VM port");
                return;
            }
        };
        info!(vm = %id, addr = %addr, "VM running");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(vm = %id, "VM port closed");
                    return;
                }
                accepted = listener.accept() => {
                    // Probes only need the handshake
                    if let Err(e) = accepted {
                        warn!(vm = %id, error = %e, "Accept failed");
                    }
                }
            }
        }
    });
}

#[derive(Serialize)]
struct StatsResponse {
    resume: BTreeMap<String, u64>,
    pause: BTreeMap<String, u64>,
    running: Vec<String>,
}

/// Stats endpoint for testing inspection
async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let mut running: Vec<String> = state.running.lock().await.keys().cloned().collect();
    running.sort();

    Json(StatsResponse {
        resume: state.resume_count.read().await.clone(),
        pause: state.pause_count.read().await.clone(),
        running,
    })
}

#[derive(Deserialize)]
struct ControlFail {
    enabled: bool,
}

/// Control endpoint: make every action return 500
async fn control_fail(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ControlFail>,
) -> impl IntoResponse {
    info!(enabled = body.enabled, "Setting fail_actions");
    *state.fail_actions.write().await = body.enabled;
    StatusCode::OK
}
