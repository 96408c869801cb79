//! Readiness probing for hosted inference services.
//!
//! A VM counts as active when a TCP connection to its service port succeeds
//! within a short timeout. Unreachability is an expected outcome, so the probe
//! reports `false` rather than an error.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Reports whether the service at `address` (`host:port`) is reachable.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn is_ready(&self, address: &str) -> bool;
}

/// Bounded-duration TCP connect check.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn is_ready(&self, address: &str) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {
                debug!(address = %address, "TCP check: service is reachable");
                true
            }
            Ok(Err(e)) => {
                debug!(address = %address, error = %e, "TCP check: service not ready");
                false
            }
            Err(_) => {
                debug!(address = %address, timeout = ?self.timeout, "TCP check: connect timed out");
                false
            }
        }
    }
}
