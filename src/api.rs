//! Request-facing API.
//!
//! | Method | Path                | Description                                  |
//! |--------|---------------------|----------------------------------------------|
//! | GET    | `/request-instance` | Address of a ready VM, waking one if needed  |
//! | GET    | `/health`           | Liveness of the wakeup service itself        |
//!
//! A successful instance request carries the address both in the
//! `X-Ready-GPU-Addr` header and in the JSON body.

use crate::orchestrator::PoolOrchestrator;
use crate::types::{InstanceGrant, PoolError};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, extract::State};
use serde::Serialize;

/// Header carrying `host:port` of the VM handed out.
pub const READY_ADDR_HEADER: &str = "X-Ready-GPU-Addr";

/// Seconds a client should wait before retrying after a shutdown.
const SHUTDOWN_RETRY_AFTER_SECS: &str = "5";

/// Build the request-facing router.
pub fn instance_router(orchestrator: PoolOrchestrator) -> Router {
    Router::new()
        .route("/request-instance", get(request_instance))
        .route("/health", get(health))
        .with_state(orchestrator)
}

#[derive(Serialize)]
struct InstanceResponse {
    status: &'static str,
    message: String,
    address: String,
    vm: String,
    resumed: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    reason: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
}

async fn request_instance(State(orchestrator): State<PoolOrchestrator>) -> Response {
    match orchestrator.request_instance().await {
        Ok(grant) => grant_response(grant),
        Err(e) => e.into_response(),
    }
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn grant_response(grant: InstanceGrant) -> Response {
    let message = if grant.resumed {
        format!("VM {} resumed.", grant.vm_name)
    } else {
        format!("Using active VM {}", grant.vm_name)
    };

    let header = HeaderValue::from_str(&grant.address).ok();
    let mut response = Json(InstanceResponse {
        status: "ok",
        message,
        address: grant.address,
        vm: grant.vm_name,
        resumed: grant.resumed,
    })
    .into_response();

    if let Some(value) = header {
        response.headers_mut().insert(READY_ADDR_HEADER, value);
    }
    response
}

/// HTTP status for each request-path failure.
pub fn status_for(error: &PoolError) -> StatusCode {
    match error {
        PoolError::NoVmsConfigured | PoolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PoolError::WakeRejected { .. } | PoolError::ShuttingDown { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        PoolError::WakeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = status_for(&self);

        // Abandoned at shutdown, not a fault of the pool
        if matches!(self, PoolError::ShuttingDown { .. }) {
            return (
                status,
                [(header::RETRY_AFTER, SHUTDOWN_RETRY_AFTER_SECS)],
                Json(serde_json::json!({
                    "status": "unavailable",
                    "message": self.to_string(),
                })),
            )
                .into_response();
        }

        let body = ErrorResponse {
            error: ErrorBody {
                message: self.to_string(),
                reason: self.reason(),
                kind: "wakeup_error",
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::PoolSettings;
    use crate::orchestrator::testing::{RecordingActions, ScriptedProbe};
    use crate::types::VmRecord;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn router(roster: Vec<VmRecord>, probe: Arc<ScriptedProbe>) -> Router {
        let orchestrator = PoolOrchestrator::new(
            roster,
            probe,
            Arc::new(RecordingActions::new()),
            PoolSettings::default(),
            CancellationToken::new(),
        );
        instance_router(orchestrator)
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, Option<String>, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let header = response
            .headers()
            .get(READY_ADDR_HEADER)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, header, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_vm_sets_ready_header() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set("10.0.0.1:11434", true);
        let app = router(vec![VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434)], probe);

        let (status, header, json) = fetch(app, "/request-instance").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header.as_deref(), Some("10.0.0.1:11434"));
        assert_eq!(json["status"], "ok");
        assert_eq!(json["message"], "Using active VM gpu-1");
        assert_eq!(json["resumed"], false);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_vms_is_server_error() {
        let app = router(vec![], Arc::new(ScriptedProbe::new()));

        let (status, header, json) = fetch(app, "/request-instance").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(header.is_none());
        assert_eq!(json["error"]["reason"], "no_vms_configured");
        assert_eq!(json["error"]["type"], "wakeup_error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_request_is_retryable_unavailable() {
        let shutdown = CancellationToken::new();
        let orchestrator = PoolOrchestrator::new(
            vec![VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434)],
            Arc::new(ScriptedProbe::new()),
            Arc::new(RecordingActions::new()),
            PoolSettings::default(),
            shutdown.clone(),
        );
        shutdown.cancel();

        let response = instance_router(orchestrator)
            .oneshot(
                Request::builder()
                    .uri("/request-instance")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unavailable");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(vec![], Arc::new(ScriptedProbe::new()));
        let (status, _, json) = fetch(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[test]
    fn test_error_status_codes() {
        let timeout = PoolError::WakeTimeout {
            vm: "gpu-1".into(),
            waited: Duration::from_secs(150),
        };
        assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&PoolError::WakeRejected { vm: "gpu-1".into() }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&PoolError::ShuttingDown { vm: "gpu-1".into() }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&PoolError::NoVmsConfigured),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
