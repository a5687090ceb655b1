//! Configuration management for vpn-core

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{VpnError, VpnResult};

/// Main core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Reconnect/backoff policy
    #[serde(default)]
    pub retry: RetrySettings,
    /// Tunnel health probing
    #[serde(default)]
    pub health: HealthSettings,
    /// Timeouts imposed on adapter operations
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    /// Runtime state paths
    #[serde(default)]
    pub paths: ConfigPaths,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum reconnect attempts before giving up
    #[serde(default = "default_retry_ceiling")]
    pub ceiling: u32,
    /// First backoff delay (seconds)
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Multiplicative backoff factor
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Backoff delay cap (seconds)
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Seconds between health probes while connected
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Consecutive probe failures that trigger a reconnect
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Per-probe timeout (seconds)
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Upper bound on an adapter connect/handshake (seconds)
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_secs: u64,
    /// Upper bound on an adapter disconnect (seconds)
    #[serde(default = "default_disconnect_timeout_secs")]
    pub disconnect_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Directory for runtime state (persisted guard rules, auth files)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_retry_ceiling() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_cap_secs() -> u64 {
    30
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_probe_timeout_secs() -> u64 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    60
}

fn default_disconnect_timeout_secs() -> u64 {
    10
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/run/vpn-core")
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            ceiling: default_retry_ceiling(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_factor: default_backoff_factor(),
            backoff_cap_secs: default_backoff_cap_secs(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            failure_threshold: default_failure_threshold(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_timeout_secs(),
            disconnect_secs: default_disconnect_timeout_secs(),
        }
    }
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self { state_dir: default_state_dir() }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            health: HealthSettings::default(),
            timeouts: TimeoutSettings::default(),
            paths: ConfigPaths::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnError::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.connect_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.disconnect_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.health.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.health.probe_timeout_secs)
    }
}
