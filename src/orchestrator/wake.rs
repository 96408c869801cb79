//! Wake-and-poll: trigger a resume and wait for the service to answer.
//!
//! Each wake runs on its own task so it keeps going if the caller that
//! started it goes away. Callers asking for a VM that is already being woken
//! join the running wake instead of issuing another provider request.

use super::PoolOrchestrator;
use crate::types::{PoolError, VmAction, VmRecord};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub(super) type WakeOutcome = Result<String, PoolError>;

/// A wake in progress, shared by everyone waiting on the same VM
pub(super) struct InFlightWake {
    id: u64,
    outcome: Shared<BoxFuture<'static, WakeOutcome>>,
}

impl PoolOrchestrator {
    /// Resume `vm` and wait until its service is reachable.
    ///
    /// Returns the VM's address on success. Fails with `WakeRejected` when the
    /// provider refuses the trigger (no polling happens), `WakeTimeout` when
    /// the VM never answers, or `ShuttingDown` when the shutdown token fires.
    pub async fn resume_and_await(&self, vm: &VmRecord) -> Result<String, PoolError> {
        let outcome = {
            let mut state = self.inner.state.lock().await;
            if let Some(existing) = state.wakes.get(&vm.id) {
                debug!(vm = %vm.name, "Joining wake already in progress");
                existing.outcome.clone()
            } else {
                let id = state.next_wake_id;
                state.next_wake_id += 1;

                // The task can only unregister itself once we release the lock,
                // so the entry is always inserted first.
                let this = self.clone();
                let target = vm.clone();
                let handle = tokio::spawn(async move {
                    let outcome = this.drive_wake(&target).await;
                    this.finish_wake(&target.id, id).await;
                    outcome
                });

                let vm_name = vm.name.clone();
                let outcome = async move {
                    handle.await.unwrap_or_else(|e| {
                        error!(vm = %vm_name, error = %e, "Wake task failed");
                        Err(PoolError::Internal(format!("wake task failed: {e}")))
                    })
                }
                .boxed()
                .shared();

                state.wakes.insert(
                    vm.id.clone(),
                    InFlightWake {
                        id,
                        outcome: outcome.clone(),
                    },
                );
                outcome
            }
        };

        outcome.await
    }

    /// Wake `vm` on a detached task; the outcome is only logged.
    pub(crate) fn spawn_background_wake(&self, vm: VmRecord) {
        let this = self.clone();
        tokio::spawn(async move {
            info!(vm = %vm.name, "Background task: waking VM");
            match this.resume_and_await(&vm).await {
                Ok(address) => {
                    info!(vm = %vm.name, address = %address, "Background wake completed")
                }
                Err(PoolError::ShuttingDown { .. }) => {
                    debug!(vm = %vm.name, "Background wake abandoned due to shutdown")
                }
                Err(e) => warn!(vm = %vm.name, error = %e, "Background wake failed"),
            }
        });
    }

    async fn drive_wake(&self, vm: &VmRecord) -> WakeOutcome {
        let settings = &self.inner.settings;
        let shutdown = &self.inner.shutdown;
        let address = vm.address();

        if shutdown.is_cancelled() {
            return Err(PoolError::ShuttingDown { vm: vm.name.clone() });
        }

        info!(vm = %vm.name, id = %vm.id, "Attempting to resume VM");
        if !self.inner.actions.trigger(&vm.id, VmAction::Wake).await {
            error!(vm = %vm.name, id = %vm.id, "Failed to trigger resume via provider API");
            metrics::counter!("wakeup_wake_triggers_total", "result" => "rejected").increment(1);
            return Err(PoolError::WakeRejected { vm: vm.name.clone() });
        }
        metrics::counter!("wakeup_wake_triggers_total", "result" => "accepted").increment(1);

        let started = Instant::now();
        while started.elapsed() < settings.wake_timeout {
            if self.inner.probe.is_ready(&address).await {
                self.record_active(&vm.id).await;
                let elapsed = started.elapsed();
                metrics::histogram!("wakeup_wake_duration_seconds").record(elapsed.as_secs_f64());
                info!(
                    vm = %vm.name,
                    address = %address,
                    elapsed = ?elapsed,
                    "VM resumed and service is responsive"
                );
                return Ok(address);
            }

            debug!(
                vm = %vm.name,
                waited = ?started.elapsed(),
                timeout = ?settings.wake_timeout,
                "Waiting for VM to become responsive"
            );

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(vm = %vm.name, "Shutdown received during wake poll, aborting");
                    return Err(PoolError::ShuttingDown { vm: vm.name.clone() });
                }
                _ = tokio::time::sleep(settings.wake_poll_interval) => {}
            }
        }

        error!(
            vm = %vm.name,
            address = %address,
            timeout = ?settings.wake_timeout,
            "Timeout: VM did not become responsive"
        );
        Err(PoolError::WakeTimeout {
            vm: vm.name.clone(),
            waited: settings.wake_timeout,
        })
    }

    /// Drop the in-flight entry for `vm_id` if it still belongs to wake `id`.
    async fn finish_wake(&self, vm_id: &str, id: u64) {
        let mut state = self.inner.state.lock().await;
        if state.wakes.get(vm_id).is_some_and(|wake| wake.id == id) {
            state.wakes.remove(vm_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{RecordingActions, ScriptedProbe};
    use super::super::{PoolOrchestrator, PoolSettings};
    use crate::types::{PoolError, VmAction, VmRecord};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn vm() -> VmRecord {
        VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434)
    }

    fn setup() -> (PoolOrchestrator, Arc<ScriptedProbe>, Arc<RecordingActions>) {
        let probe = Arc::new(ScriptedProbe::new());
        let actions = Arc::new(RecordingActions::new());
        let orch = PoolOrchestrator::new(
            vec![vm()],
            probe.clone(),
            actions.clone(),
            PoolSettings::default(),
            CancellationToken::new(),
        );
        (orch, probe, actions)
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_entry_removed_after_completion() {
        let (orch, probe, actions) = setup();
        probe.script("10.0.0.1:11434", &[false, true]);

        assert_eq!(orch.resume_and_await(&vm()).await.unwrap(), "10.0.0.1:11434");
        assert!(orch.inner.state.lock().await.wakes.is_empty());

        // A later wake issues a fresh trigger
        orch.resume_and_await(&vm()).await.unwrap();
        assert_eq!(actions.count("vm1", VmAction::Wake), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_continues_after_caller_is_dropped() {
        let (orch, probe, _actions) = setup();
        probe.script("10.0.0.1:11434", &[false, false, true]);

        // Caller gives up before the VM answers
        let result =
            tokio::time::timeout(Duration::from_secs(5), orch.resume_and_await(&vm())).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(orch.last_active("vm1").await.is_some());
        assert!(!orch.status().await.vms[0].waking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_cancelled_skips_trigger() {
        let (orch, _probe, actions) = setup();
        orch.shutdown_token().cancel();

        let err = orch.resume_and_await(&vm()).await.unwrap_err();
        assert!(matches!(err, PoolError::ShuttingDown { .. }));
        assert!(actions.calls().is_empty());
    }
}
