//! Shared domain types used across the codebase.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A managed VM: provider identity plus where its inference service listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRecord {
    /// Provider-assigned identifier, stable and unique
    pub id: String,
    /// Human-readable label, only used in logs and status output
    pub name: String,
    /// Host (IP or DNS name) of the hosted service
    pub host: String,
    /// Port of the hosted service
    pub port: u16,
}

impl VmRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port` of the hosted service. IPv6 literals are bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Lifecycle action requested from the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmAction {
    Wake,
    Sleep,
}

impl VmAction {
    /// Verb used by the provider's action endpoint.
    pub fn provider_verb(self) -> &'static str {
        match self {
            VmAction::Wake => "resume",
            VmAction::Sleep => "pause",
        }
    }
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.provider_verb())
    }
}

/// Classification of every known VM at one instant. Never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// VMs whose readiness probe just succeeded, in roster order
    pub active: Vec<VmRecord>,
    /// VMs whose readiness probe failed, in roster order
    pub inactive: Vec<VmRecord>,
}

impl PoolSnapshot {
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.inactive.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.inactive.len()
    }
}

/// A VM handed out to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceGrant {
    pub vm_id: String,
    pub vm_name: String,
    /// `host:port` the caller should use
    pub address: String,
    /// True when the VM had to be woken for this request
    pub resumed: bool,
}

impl InstanceGrant {
    pub(crate) fn active(vm: &VmRecord) -> Self {
        Self {
            vm_id: vm.id.clone(),
            vm_name: vm.name.clone(),
            address: vm.address(),
            resumed: false,
        }
    }

    pub(crate) fn resumed(vm: &VmRecord, address: String) -> Self {
        Self {
            vm_id: vm.id.clone(),
            vm_name: vm.name.clone(),
            address,
            resumed: true,
        }
    }
}

/// Outcome counters of one auto-pause sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// VMs probed this cycle
    pub probed: usize,
    /// VMs that answered the probe
    pub active: usize,
    /// Active VMs that had no activity timestamp and got one
    pub newly_tracked: usize,
    /// Previously active VMs that stopped answering; timestamp cleared
    pub cleared: usize,
    /// Idle VMs whose pause the provider accepted
    pub paused: usize,
    /// Idle VMs whose pause was rejected; retried next cycle
    pub pause_failures: usize,
}

/// Errors from the instance request path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no VMs configured")]
    NoVmsConfigured,

    #[error("provider rejected wake request for VM {vm}")]
    WakeRejected { vm: String },

    #[error("VM {vm} did not become responsive within {waited:?}")]
    WakeTimeout { vm: String, waited: Duration },

    #[error("wake of VM {vm} abandoned: shutting down")]
    ShuttingDown { vm: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            PoolError::NoVmsConfigured => "no_vms_configured",
            PoolError::WakeRejected { .. } => "wake_rejected",
            PoolError::WakeTimeout { .. } => "wake_timeout",
            PoolError::ShuttingDown { .. } => "shutting_down",
            PoolError::Internal(_) => "internal",
        }
    }

    /// Whether the same request may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PoolError::NoVmsConfigured)
    }
}
