//! Configuration for wakeup

use crate::orchestrator::PoolSettings;
use crate::roster::{CsvRoster, RosterEntry, RosterSource, StaticRoster, records_from_entries};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Inline roster, used when `roster_path` is not set
    #[serde(default)]
    pub vms: Vec<RosterEntry>,

    /// CSV roster file (`id,name,ip,ollama_port`)
    #[serde(default)]
    pub roster_path: Option<PathBuf>,

    /// Service port for roster rows that don't specify one
    #[serde(default = "default_service_port")]
    pub default_service_port: u16,

    /// Pool orchestration settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Cloud provider action API
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Port for the instance request API
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Admin/control API port (None to disable)
    #[serde(default)]
    pub admin_port: Option<u16>,
}

fn default_service_port() -> u16 {
    11434
}

fn default_port() -> u16 {
    8000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vms: Vec::new(),
            roster_path: None,
            default_service_port: default_service_port(),
            pool: PoolConfig::default(),
            provider: ProviderConfig::default(),
            port: default_port(),
            metrics_port: default_metrics_port(),
            admin_port: None,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Validate configuration, warning about common misconfigurations.
    pub fn validate(&self) {
        let pool = &self.pool;

        if pool.target_active_count == 0 {
            warn!("pool.target_active_count is 0; background pre-warming is disabled");
        }

        if pool.wake_poll_interval_secs == 0 {
            warn!("pool.wake_poll_interval_secs is 0; wake polling will hammer the VM");
        }

        if pool.wake_poll_interval_secs > pool.wake_timeout_secs {
            warn!(
                poll = pool.wake_poll_interval_secs,
                timeout = pool.wake_timeout_secs,
                "Wake poll interval exceeds wake timeout; only one readiness check will run"
            );
        }

        if pool.auto_pause_check_interval_secs == 0 {
            warn!("pool.auto_pause_check_interval_secs is 0; sweeping once per second instead");
        }

        if pool.auto_pause_inactivity_secs < pool.auto_pause_check_interval_secs {
            warn!(
                threshold = pool.auto_pause_inactivity_secs,
                interval = pool.auto_pause_check_interval_secs,
                "Inactivity threshold is shorter than the sweep interval; \
                 VMs may be paused between two requests"
            );
        }

        if self.roster_path.is_none() && self.vms.is_empty() {
            warn!("No roster_path and no inline vms configured; every request will fail");
        }

        if self.roster_path.is_some() && !self.vms.is_empty() {
            warn!("Both roster_path and inline vms are set; inline vms are ignored");
        }
    }

    /// The roster source described by this config.
    pub fn roster_source(&self) -> Arc<dyn RosterSource> {
        match &self.roster_path {
            Some(path) => Arc::new(CsvRoster::new(path.clone(), self.default_service_port)),
            None => Arc::new(StaticRoster::new(records_from_entries(
                &self.vms,
                self.default_service_port,
            ))),
        }
    }
}

/// Pool orchestration settings, all in whole seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of VMs to keep active; more are pre-warmed while below it
    #[serde(default = "default_target_active_count")]
    pub target_active_count: usize,

    /// Minimum spacing between pre-warm wake triggers
    #[serde(default = "default_scale_up_cooldown")]
    pub scale_up_cooldown_secs: u64,

    /// How often to probe a waking VM
    #[serde(default = "default_wake_poll_interval")]
    pub wake_poll_interval_secs: u64,

    /// Maximum wait for a woken VM to become reachable
    #[serde(default = "default_wake_timeout")]
    pub wake_timeout_secs: u64,

    /// Interval between auto-pause sweeps
    #[serde(default = "default_auto_pause_check_interval")]
    pub auto_pause_check_interval_secs: u64,

    /// Idle time after which an active VM is paused
    #[serde(default = "default_auto_pause_inactivity")]
    pub auto_pause_inactivity_secs: u64,

    /// TCP readiness probe timeout
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Reload the roster from its source at the start of every sweep
    #[serde(default)]
    pub reload_roster_on_sweep: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            target_active_count: default_target_active_count(),
            scale_up_cooldown_secs: default_scale_up_cooldown(),
            wake_poll_interval_secs: default_wake_poll_interval(),
            wake_timeout_secs: default_wake_timeout(),
            auto_pause_check_interval_secs: default_auto_pause_check_interval(),
            auto_pause_inactivity_secs: default_auto_pause_inactivity(),
            probe_timeout_secs: default_probe_timeout(),
            reload_roster_on_sweep: false,
        }
    }
}

fn default_target_active_count() -> usize {
    1
}

fn default_scale_up_cooldown() -> u64 {
    60
}

fn default_wake_poll_interval() -> u64 {
    10
}

fn default_wake_timeout() -> u64 {
    150
}

fn default_auto_pause_check_interval() -> u64 {
    60
}

fn default_auto_pause_inactivity() -> u64 {
    600
}

fn default_probe_timeout() -> u64 {
    3
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            target_active_count: self.target_active_count,
            scale_up_cooldown: Duration::from_secs(self.scale_up_cooldown_secs),
            wake_poll_interval: Duration::from_secs(self.wake_poll_interval_secs),
            wake_timeout: Duration::from_secs(self.wake_timeout_secs),
            sweep_interval: Duration::from_secs(self.auto_pause_check_interval_secs),
            inactivity_threshold: Duration::from_secs(self.auto_pause_inactivity_secs),
            reload_roster_on_sweep: self.reload_roster_on_sweep,
        }
    }
}

/// Provider action API settings.
///
/// Credentials left unset here are read from `SURF_API_URL`,
/// `SURF_API_TOKEN` and `SURF_CSRF_TOKEN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the VM action endpoint
    #[serde(default)]
    pub api_url: Option<String>,

    /// Value of the `authorization` header
    #[serde(default)]
    pub api_token: Option<String>,

    /// Value of the `X-CSRFTOKEN` header
    #[serde(default)]
    pub csrf_token: Option<String>,

    /// Timeout for a single action request
    #[serde(default = "default_provider_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider_timeout() -> u64 {
    30
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            csrf_token: None,
            request_timeout_secs: default_provider_timeout(),
        }
    }
}

impl ProviderConfig {
    /// Fill unset credentials from the process environment.
    pub fn resolved(&self) -> Self {
        self.resolved_with(|key| std::env::var(key).ok())
    }

    /// Fill unset credentials using `lookup`.
    pub fn resolved_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            api_url: self.api_url.clone().or_else(|| lookup("SURF_API_URL")),
            api_token: self.api_token.clone().or_else(|| lookup("SURF_API_TOKEN")),
            csrf_token: self.csrf_token.clone().or_else(|| lookup("SURF_CSRF_TOKEN")),
            request_timeout_secs: self.request_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "vms": [
                { "id": "vm1", "name": "gpu-1", "ip": "10.0.0.1", "ollama_port": 11434 },
                { "id": "vm2", "host": "10.0.0.2" }
            ],
            "default_service_port": 8080,
            "pool": {
                "target_active_count": 2,
                "wake_timeout_secs": 90
            },
            "provider": {
                "api_url": "https://provider.example/v1/vms"
            },
            "admin_port": 8001
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.vms.len(), 2);
        assert_eq!(config.pool.target_active_count, 2);
        assert_eq!(config.pool.wake_timeout_secs, 90);
        assert_eq!(config.pool.wake_poll_interval_secs, 10);
        assert_eq!(config.port, 8000);
        assert_eq!(config.admin_port, Some(8001));
        assert_eq!(config.provider.request_timeout_secs, 30);
    }

    #[test]
    fn test_pool_defaults() {
        let settings = PoolConfig::default().settings();
        assert_eq!(settings.target_active_count, 1);
        assert_eq!(settings.scale_up_cooldown, Duration::from_secs(60));
        assert_eq!(settings.wake_poll_interval, Duration::from_secs(10));
        assert_eq!(settings.wake_timeout, Duration::from_secs(150));
        assert_eq!(settings.sweep_interval, Duration::from_secs(60));
        assert_eq!(settings.inactivity_threshold, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_inline_roster_uses_default_port() {
        let json = r#"{
            "vms": [
                { "id": "vm1", "ip": "10.0.0.1" },
                { "name": "missing-id", "ip": "10.0.0.2" }
            ],
            "default_service_port": 8080
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();

        let records = config.roster_source().load().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address(), "10.0.0.1:8080");
    }

    #[test]
    fn test_provider_credentials_fall_back_to_env() {
        let config = ProviderConfig {
            api_url: Some("https://from-config".to_string()),
            ..Default::default()
        };
        let resolved = config.resolved_with(|key| Some(format!("env:{key}")));

        assert_eq!(resolved.api_url.as_deref(), Some("https://from-config"));
        assert_eq!(resolved.api_token.as_deref(), Some("env:SURF_API_TOKEN"));
        assert_eq!(resolved.csrf_token.as_deref(), Some("env:SURF_CSRF_TOKEN"));
    }
}
