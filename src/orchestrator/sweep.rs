//! Auto-pause sweep.
//!
//! Every `sweep_interval` the sweeper probes the whole roster and reconciles
//! activity timestamps with what it sees. VMs that stayed reachable but
//! unused for longer than `inactivity_threshold` are paused. A rejected pause
//! leaves the timestamp in place, so the next cycle tries again.

use super::PoolOrchestrator;
use crate::types::{SweepReport, VmAction, VmRecord};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Bounds applied to the configured sweep interval
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

impl PoolOrchestrator {
    /// Run [`sweep_once`](Self::sweep_once) every `sweep_interval` until the
    /// shutdown token fires.
    ///
    /// The interval is clamped to between one second and one week.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let this = self.clone();
        let configured = self.inner.settings.sweep_interval;
        let interval = configured.clamp(MIN_SWEEP_INTERVAL, MAX_SWEEP_INTERVAL);
        if interval != configured {
            warn!(
                configured = ?configured,
                interval = ?interval,
                "Sweep interval out of range, clamping"
            );
        }

        info!(interval = ?interval, "Spawning auto-pause sweeper");

        tokio::spawn(async move {
            let shutdown = this.inner.shutdown.clone();
            let mut tick = tokio::time::interval_at(Instant::now() + interval, interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Auto-pause sweeper stopping");
                        return;
                    }
                    _ = tick.tick() => {}
                }
                this.sweep_once().await;
            }
        })
    }

    /// One reconciliation cycle over the whole roster.
    pub async fn sweep_once(&self) -> SweepReport {
        if self.inner.settings.reload_roster_on_sweep
            && let Err(e) = self.reload_roster().await
        {
            error!(error = %e, "Roster reload failed, sweeping the previous roster");
        }

        let snapshot = self.inner.state.lock().await.registry.activity_snapshot();
        let vms: Vec<VmRecord> = snapshot.iter().map(|(vm, _)| vm.clone()).collect();
        let readiness = self.probe_all(&vms).await;

        let threshold = self.inner.settings.inactivity_threshold;
        let mut report = SweepReport {
            probed: vms.len(),
            ..Default::default()
        };
        let mut idle = Vec::new();

        {
            let now = Instant::now();
            let mut state = self.inner.state.lock().await;
            for ((vm, seen_at), ready) in snapshot.into_iter().zip(readiness) {
                if ready {
                    report.active += 1;
                }
                match (seen_at, ready) {
                    (None, true) => {
                        info!(vm = %vm.name, "VM found active, starting inactivity tracking");
                        state.registry.mark_active(&vm.id, now);
                        report.newly_tracked += 1;
                    }
                    (Some(at), false) => {
                        // A wake may have refreshed the timestamp after the probe
                        if state.registry.last_active(&vm.id) != Some(at) {
                            debug!(vm = %vm.name, "VM activity changed since snapshot, keeping it");
                            continue;
                        }
                        info!(vm = %vm.name, "VM no longer responsive, clearing activity");
                        state.registry.clear_active(&vm.id);
                        report.cleared += 1;
                    }
                    (Some(at), true) => {
                        let idle_for = now.saturating_duration_since(at);
                        if idle_for > threshold {
                            idle.push((vm, at, idle_for));
                        } else {
                            debug!(vm = %vm.name, idle = ?idle_for, "VM active and recently used");
                        }
                    }
                    (None, false) => {}
                }
            }
        }

        for (vm, seen_at, idle_for) in idle {
            // A request may have used the VM since the snapshot
            if self.last_active(&vm.id).await != Some(seen_at) {
                debug!(vm = %vm.name, "VM activity changed since snapshot, not pausing");
                continue;
            }

            info!(vm = %vm.name, idle = ?idle_for, "VM idle past threshold, pausing");
            if self.pause_vm(&vm).await {
                report.paused += 1;
            } else {
                report.pause_failures += 1;
            }
        }

        if report.paused > 0 || report.pause_failures > 0 || report.cleared > 0 {
            info!(?report, "Auto-pause sweep finished");
        } else {
            debug!(?report, "Auto-pause sweep finished");
        }
        report
    }

    /// Ask the provider to pause `vm`. Clears its activity on success.
    pub async fn pause_vm(&self, vm: &VmRecord) -> bool {
        if self.inner.actions.trigger(&vm.id, VmAction::Sleep).await {
            self.inner.state.lock().await.registry.clear_active(&vm.id);
            metrics::counter!("wakeup_pause_triggers_total", "result" => "accepted").increment(1);
            info!(vm = %vm.name, "VM paused");
            true
        } else {
            metrics::counter!("wakeup_pause_triggers_total", "result" => "rejected").increment(1);
            warn!(vm = %vm.name, "Pause rejected, will retry next sweep");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{RecordingActions, ScriptedProbe};
    use super::super::{PoolOrchestrator, PoolSettings};
    use crate::probe::ReadinessProbe;
    use crate::types::{SweepReport, VmAction, VmRecord};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio_util::sync::CancellationToken;

    const VM1: &str = "10.0.0.1:11434";
    const VM2: &str = "10.0.0.2:11434";

    fn setup() -> (PoolOrchestrator, Arc<ScriptedProbe>, Arc<RecordingActions>) {
        let probe = Arc::new(ScriptedProbe::new());
        let actions = Arc::new(RecordingActions::new());
        let orch = PoolOrchestrator::new(
            vec![
                VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434),
                VmRecord::new("vm2", "gpu-2", "10.0.0.2", 11434),
            ],
            probe.clone(),
            actions.clone(),
            PoolSettings::default(),
            CancellationToken::new(),
        );
        (orch, probe, actions)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_tracks_newly_active_vm() {
        let (orch, probe, actions) = setup();
        probe.set(VM1, true);

        let report = orch.sweep_once().await;

        assert_eq!(
            report,
            SweepReport {
                probed: 2,
                active: 1,
                newly_tracked: 1,
                ..Default::default()
            }
        );
        assert!(orch.last_active("vm1").await.is_some());
        assert!(orch.last_active("vm2").await.is_none());
        assert!(actions.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_vm_paused_once() {
        let (orch, probe, actions) = setup();
        probe.set(VM1, true);
        orch.sweep_once().await;

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = orch.sweep_once().await;
        assert_eq!(report.paused, 1);
        assert_eq!(actions.count("vm1", VmAction::Sleep), 1);
        assert!(orch.last_active("vm1").await.is_none());

        // Still answering (pause takes a while): tracking restarts, no second pause
        let report = orch.sweep_once().await;
        assert_eq!(report.paused, 0);
        assert_eq!(report.newly_tracked, 1);
        assert_eq!(actions.count("vm1", VmAction::Sleep), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_used_vm_not_paused() {
        let (orch, probe, actions) = setup();
        probe.set(VM1, true);
        orch.sweep_once().await;

        tokio::time::advance(Duration::from_secs(599)).await;
        let report = orch.sweep_once().await;

        assert_eq!(report.paused, 0);
        assert!(actions.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_vm_cleared_not_paused() {
        let (orch, probe, actions) = setup();
        probe.set(VM2, true);
        orch.sweep_once().await;

        tokio::time::advance(Duration::from_secs(700)).await;
        probe.set(VM2, false);
        let report = orch.sweep_once().await;

        assert_eq!(report.cleared, 1);
        assert_eq!(report.paused, 0);
        assert!(orch.last_active("vm2").await.is_none());
        assert!(actions.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_pause_retried_next_cycle() {
        let (orch, probe, actions) = setup();
        probe.set(VM1, true);
        probe.set(VM2, true);
        actions.reject("vm1", VmAction::Sleep, true);
        orch.sweep_once().await;

        tokio::time::advance(Duration::from_secs(601)).await;
        let report = orch.sweep_once().await;

        // vm1 failing does not stop vm2 from being paused
        assert_eq!(report.pause_failures, 1);
        assert_eq!(report.paused, 1);
        assert!(orch.last_active("vm1").await.is_some());
        assert!(orch.last_active("vm2").await.is_none());

        actions.reject("vm1", VmAction::Sleep, false);
        tokio::time::advance(Duration::from_secs(60)).await;
        let report = orch.sweep_once().await;

        assert_eq!(report.paused, 1);
        assert_eq!(actions.count("vm1", VmAction::Sleep), 2);
        assert!(orch.last_active("vm1").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_activity_prevents_pause() {
        let (orch, probe, actions) = setup();
        probe.set(VM1, true);
        orch.sweep_once().await;

        tokio::time::advance(Duration::from_secs(601)).await;
        // A request hands out vm1, refreshing its timestamp
        orch.request_instance().await.unwrap();
        let report = orch.sweep_once().await;

        assert_eq!(report.paused, 0);
        assert_eq!(actions.count("vm1", VmAction::Sleep), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval_and_stops() {
        let (orch, probe, _actions) = setup();
        probe.set(VM1, true);

        let handle = orch.spawn_sweeper();
        tokio::time::sleep(Duration::from_secs(1)).await;
        // First cycle runs one interval after start
        assert_eq!(probe.calls_for(VM1), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls_for(VM1), 1);
        assert!(orch.last_active("vm1").await.is_some());

        orch.shutdown_token().cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_is_clamped() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.set(VM1, true);
        let orch = PoolOrchestrator::new(
            vec![VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434)],
            probe.clone(),
            Arc::new(RecordingActions::new()),
            PoolSettings {
                sweep_interval: Duration::ZERO,
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let handle = orch.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!handle.is_finished());
        assert_eq!(probe.calls_for(VM1), 3);

        orch.shutdown_token().cancel();
        handle.await.unwrap();
    }

    /// Answers `ready` everywhere, but the first probe of `gated` blocks
    /// until released.
    struct GatedProbe {
        gated: &'static str,
        ready: AtomicBool,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ReadinessProbe for GatedProbe {
        async fn is_ready(&self, address: &str) -> bool {
            if address == self.gated && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.ready.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_vm_refreshed_during_probe_is_kept() {
        let probe = Arc::new(GatedProbe {
            gated: VM1,
            ready: AtomicBool::new(true),
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let orch = PoolOrchestrator::new(
            vec![VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434)],
            probe.clone(),
            Arc::new(RecordingActions::new()),
            PoolSettings::default(),
            CancellationToken::new(),
        );
        orch.sweep_once().await;
        let tracked_at = orch.last_active("vm1").await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        probe.ready.store(false, Ordering::SeqCst);
        probe.armed.store(true, Ordering::SeqCst);

        let sweeper = orch.clone();
        let sweep = tokio::spawn(async move { sweeper.sweep_once().await });
        probe.entered.notified().await;

        // A wake lands while the sweep is still probing
        orch.record_active("vm1").await;
        probe.release.notify_one();
        let report = sweep.await.unwrap();

        assert_eq!(report.cleared, 0);
        let now = orch.last_active("vm1").await.unwrap();
        assert!(now > tracked_at);

        // The next sweep still clears it if it stays down
        let report = orch.sweep_once().await;
        assert_eq!(report.cleared, 1);
        assert!(orch.last_active("vm1").await.is_none());
    }
}
