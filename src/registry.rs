//! In-memory bookkeeping for the VM pool.
//!
//! Holds the roster, the last time each VM was confirmed reachable, and the
//! time of the most recent pre-warm wake. The registry does no locking of its
//! own: the orchestrator keeps it behind its single mutex, and every method
//! here is cheap enough to call while holding that lock.

use crate::types::VmRecord;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
pub struct VmRegistry {
    roster: Vec<VmRecord>,
    /// VM id -> last confirmed-reachable observation
    last_active: HashMap<String, Instant>,
    /// When the last pre-warm wake was triggered
    last_scale_up: Option<Instant>,
}

impl VmRegistry {
    pub fn new(roster: Vec<VmRecord>) -> Self {
        Self {
            roster,
            ..Default::default()
        }
    }

    pub fn roster(&self) -> &[VmRecord] {
        &self.roster
    }

    pub fn find(&self, id: &str) -> Option<&VmRecord> {
        self.roster.iter().find(|vm| vm.id == id)
    }

    /// Replace the known VM set wholesale. Timestamps of VMs that disappear
    /// are left behind and ignored, since only roster members are consulted.
    pub fn replace_roster(&mut self, roster: Vec<VmRecord>) {
        self.roster = roster;
    }

    /// Each roster member paired with its activity timestamp.
    pub fn activity_snapshot(&self) -> Vec<(VmRecord, Option<Instant>)> {
        self.roster
            .iter()
            .map(|vm| (vm.clone(), self.last_active.get(&vm.id).copied()))
            .collect()
    }

    pub fn last_active(&self, id: &str) -> Option<Instant> {
        self.last_active.get(id).copied()
    }

    pub fn mark_active(&mut self, id: &str, at: Instant) {
        self.last_active.insert(id.to_string(), at);
    }

    pub fn clear_active(&mut self, id: &str) -> Option<Instant> {
        self.last_active.remove(id)
    }

    pub fn last_scale_up(&self) -> Option<Instant> {
        self.last_scale_up
    }

    /// Check the pre-warm cooldown and, if it has elapsed, claim it.
    ///
    /// Check and claim happen in one call so that two requests holding the
    /// lock one after the other cannot both pass.
    pub fn try_begin_scale_up(&mut self, now: Instant, cooldown: Duration) -> bool {
        if let Some(last) = self.last_scale_up
            && now.saturating_duration_since(last) < cooldown
        {
            return false;
        }
        self.last_scale_up = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Vec<VmRecord> {
        vec![
            VmRecord::new("vm1", "gpu-1", "10.0.0.1", 11434),
            VmRecord::new("vm2", "gpu-2", "10.0.0.2", 11434),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_cooldown() {
        let mut registry = VmRegistry::new(roster());
        let cooldown = Duration::from_secs(60);
        let t0 = Instant::now();

        assert!(registry.try_begin_scale_up(t0, cooldown));
        assert_eq!(registry.last_scale_up(), Some(t0));

        // Inside the window: refused, timestamp untouched
        assert!(!registry.try_begin_scale_up(t0 + Duration::from_secs(59), cooldown));
        assert_eq!(registry.last_scale_up(), Some(t0));

        // Exactly at the boundary the cooldown has elapsed
        let t1 = t0 + Duration::from_secs(60);
        assert!(registry.try_begin_scale_up(t1, cooldown));
        assert_eq!(registry.last_scale_up(), Some(t1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_tracking() {
        let mut registry = VmRegistry::new(roster());
        let now = Instant::now();

        registry.mark_active("vm2", now);
        let snapshot = registry.activity_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].1, None);
        assert_eq!(snapshot[1].1, Some(now));

        assert_eq!(registry.clear_active("vm2"), Some(now));
        assert_eq!(registry.last_active("vm2"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_roster_orphans_timestamps() {
        let mut registry = VmRegistry::new(roster());
        registry.mark_active("vm1", Instant::now());

        registry.replace_roster(vec![VmRecord::new("vm3", "gpu-3", "10.0.0.3", 11434)]);

        assert!(registry.find("vm1").is_none());
        let snapshot = registry.activity_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0.id, "vm3");
        assert_eq!(snapshot[0].1, None);
    }
}
