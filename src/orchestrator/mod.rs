//! Pool orchestrator - decides which VM serves a request
//!
//! The orchestrator is responsible for:
//! - Classifying every known VM as active or inactive on each call
//! - Handing out an active VM, or waking one synchronously when none is
//! - Pre-warming extra capacity up to a target count, spaced by a cooldown
//! - Pausing VMs that stay idle past a threshold (see [`sweep`])
//!
//! All bookkeeping lives behind one mutex. The lock is only held for
//! in-memory updates; probes and provider calls run with it released.

mod sweep;
mod wake;

use crate::probe::ReadinessProbe;
use crate::provider::VmActionClient;
use crate::registry::VmRegistry;
use crate::roster::{RosterError, RosterSource};
use crate::types::{InstanceGrant, PoolError, PoolSnapshot, VmRecord};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wake::InFlightWake;

/// Timing and sizing policy for the pool
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Pre-warm while fewer than this many VMs are active
    pub target_active_count: usize,
    /// Minimum spacing between pre-warm wake triggers
    pub scale_up_cooldown: Duration,
    /// Delay between readiness probes while waking
    pub wake_poll_interval: Duration,
    /// Maximum wait for a woken VM to answer
    pub wake_timeout: Duration,
    /// Interval between auto-pause sweeps
    pub sweep_interval: Duration,
    /// Idle time after which an active VM is paused
    pub inactivity_threshold: Duration,
    /// Reload the roster at the start of each sweep
    pub reload_roster_on_sweep: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            target_active_count: 1,
            scale_up_cooldown: Duration::from_secs(60),
            wake_poll_interval: Duration::from_secs(10),
            wake_timeout: Duration::from_secs(150),
            sweep_interval: Duration::from_secs(60),
            inactivity_threshold: Duration::from_secs(600),
            reload_roster_on_sweep: false,
        }
    }
}

/// Everything guarded by the orchestrator's lock
struct PoolState {
    registry: VmRegistry,
    /// VM id -> wake currently being driven for it
    wakes: HashMap<String, InFlightWake>,
    next_wake_id: u64,
}

struct OrchestratorInner {
    state: Mutex<PoolState>,
    probe: Arc<dyn ReadinessProbe>,
    actions: Arc<dyn VmActionClient>,
    roster_source: Option<Arc<dyn RosterSource>>,
    settings: PoolSettings,
    shutdown: CancellationToken,
}

/// Per-VM view for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct VmStatus {
    pub id: String,
    pub name: String,
    pub address: String,
    /// Seconds since the VM was last confirmed reachable
    pub idle_secs: Option<f64>,
    pub waking: bool,
}

/// Bookkeeping snapshot for the status endpoint. Does not probe.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub vms: Vec<VmStatus>,
    pub target_active_count: usize,
    pub last_prewarm_secs_ago: Option<f64>,
}

/// Owns the pool's shared state. Cheap to clone.
#[derive(Clone)]
pub struct PoolOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl PoolOrchestrator {
    pub fn new(
        roster: Vec<VmRecord>,
        probe: Arc<dyn ReadinessProbe>,
        actions: Arc<dyn VmActionClient>,
        settings: PoolSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self::with_roster_source(roster, None, probe, actions, settings, shutdown)
    }

    /// Create an orchestrator that can reload its roster from `roster_source`
    pub fn with_roster_source(
        roster: Vec<VmRecord>,
        roster_source: Option<Arc<dyn RosterSource>>,
        probe: Arc<dyn ReadinessProbe>,
        actions: Arc<dyn VmActionClient>,
        settings: PoolSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                state: Mutex::new(PoolState {
                    registry: VmRegistry::new(roster),
                    wakes: HashMap::new(),
                    next_wake_id: 0,
                }),
                probe,
                actions,
                roster_source,
                settings,
                shutdown,
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub async fn roster(&self) -> Vec<VmRecord> {
        self.inner.state.lock().await.registry.roster().to_vec()
    }

    pub async fn find_vm(&self, id: &str) -> Option<VmRecord> {
        self.inner.state.lock().await.registry.find(id).cloned()
    }

    pub async fn last_active(&self, id: &str) -> Option<Instant> {
        self.inner.state.lock().await.registry.last_active(id)
    }

    /// Probe every known VM and split the roster into active and inactive.
    ///
    /// Every VM found active gets its activity timestamp refreshed.
    pub async fn classify(&self) -> PoolSnapshot {
        let roster = self.roster().await;
        let readiness = self.probe_all(&roster).await;

        let mut snapshot = PoolSnapshot::default();
        for (vm, ready) in roster.into_iter().zip(readiness) {
            if ready {
                snapshot.active.push(vm);
            } else {
                snapshot.inactive.push(vm);
            }
        }

        if !snapshot.active.is_empty() {
            let now = Instant::now();
            let mut state = self.inner.state.lock().await;
            for vm in &snapshot.active {
                state.registry.mark_active(&vm.id, now);
            }
        }

        metrics::gauge!("wakeup_active_vms").set(snapshot.active.len() as f64);
        snapshot
    }

    /// Return the address of an active VM, waking one if none is active.
    ///
    /// Blocks for up to the wake timeout when every VM is asleep. May start a
    /// background wake of another VM to move towards the target active count.
    pub async fn request_instance(&self) -> Result<InstanceGrant, PoolError> {
        let result = self.request_instance_inner().await;
        let outcome = match &result {
            Ok(grant) if grant.resumed => "resumed",
            Ok(_) => "active",
            Err(e) => e.reason(),
        };
        metrics::counter!("wakeup_requests_total", "outcome" => outcome).increment(1);
        result
    }

    async fn request_instance_inner(&self) -> Result<InstanceGrant, PoolError> {
        let snapshot = self.classify().await;
        info!(
            active = snapshot.active.len(),
            inactive = snapshot.inactive.len(),
            "Classified VM pool"
        );

        // Some VM is already up: hand out the first one in roster order
        if let Some(chosen) = snapshot.active.first() {
            info!(vm = %chosen.name, address = %chosen.address(), "Providing already active VM");
            if let Some(vm) = self
                .claim_prewarm(snapshot.active.len(), &snapshot.inactive)
                .await
            {
                self.spawn_background_wake(vm);
            }
            return Ok(InstanceGrant::active(chosen));
        }

        let Some(primary) = snapshot.inactive.first() else {
            error!("No VMs configured. Cannot provide an instance.");
            return Err(PoolError::NoVmsConfigured);
        };

        info!(vm = %primary.name, id = %primary.id, "No active VMs, waking primary candidate");
        let address = match self.resume_and_await(primary).await {
            Ok(address) => address,
            Err(e @ PoolError::ShuttingDown { .. }) => {
                info!(vm = %primary.name, "Wake abandoned due to shutdown");
                return Err(e);
            }
            Err(e) => {
                error!(vm = %primary.name, error = %e, "Failed to wake primary candidate");
                return Err(e);
            }
        };

        // The remaining candidates come from the pre-wake probe and are not
        // re-probed; the cooldown is still re-checked.
        let remaining: Vec<VmRecord> = snapshot
            .inactive
            .iter()
            .filter(|vm| vm.id != primary.id)
            .cloned()
            .collect();
        if let Some(vm) = self.claim_prewarm(1, &remaining).await {
            self.spawn_background_wake(vm);
        }

        Ok(InstanceGrant::resumed(primary, address))
    }

    /// Decide whether to pre-warm, claiming the cooldown if so.
    ///
    /// Returns the VM to wake. The cooldown check and the timestamp update
    /// happen under one lock acquisition.
    async fn claim_prewarm(
        &self,
        active_count: usize,
        candidates: &[VmRecord],
    ) -> Option<VmRecord> {
        let target = self.inner.settings.target_active_count;
        if active_count >= target {
            return None;
        }
        let candidate = candidates.first()?;

        let claimed = self
            .inner
            .state
            .lock()
            .await
            .registry
            .try_begin_scale_up(Instant::now(), self.inner.settings.scale_up_cooldown);

        if !claimed {
            debug!(vm = %candidate.name, "Scale-up cooldown active, not pre-warming");
            return None;
        }

        info!(
            active = active_count,
            target,
            vm = %candidate.name,
            "Scaling up: waking additional VM in background"
        );
        metrics::counter!("wakeup_prewarm_total").increment(1);
        Some(candidate.clone())
    }

    /// Reload the roster from its source, replacing the known VM set.
    pub async fn reload_roster(&self) -> Result<usize, RosterError> {
        let source = self
            .inner
            .roster_source
            .as_ref()
            .ok_or(RosterError::NotConfigured)?;
        let roster = source.load().await?;
        let count = roster.len();

        self.inner
            .state
            .lock()
            .await
            .registry
            .replace_roster(roster);

        if count == 0 {
            warn!(source = %source.describe(), "Reloaded roster is empty");
        } else {
            info!(count, source = %source.describe(), "Roster reloaded");
        }
        Ok(count)
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock().await;
        let now = Instant::now();

        let vms = state
            .registry
            .activity_snapshot()
            .into_iter()
            .map(|(vm, last_active)| VmStatus {
                address: vm.address(),
                idle_secs: last_active.map(|t| now.saturating_duration_since(t).as_secs_f64()),
                waking: state.wakes.contains_key(&vm.id),
                id: vm.id,
                name: vm.name,
            })
            .collect();

        PoolStatus {
            vms,
            target_active_count: self.inner.settings.target_active_count,
            last_prewarm_secs_ago: state
                .registry
                .last_scale_up()
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
        }
    }

    /// Probe all `vms` concurrently; results are in the same order.
    async fn probe_all(&self, vms: &[VmRecord]) -> Vec<bool> {
        let addresses: Vec<String> = vms.iter().map(VmRecord::address).collect();
        join_all(
            addresses
                .iter()
                .map(|address| self.inner.probe.is_ready(address)),
        )
        .await
    }

    async fn record_active(&self, id: &str) {
        self.inner
            .state
            .lock()
            .await
            .registry
            .mark_active(id, Instant::now());
        debug!(id = %id, "Updated last active time");
    }
}
