use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::time_limits::Region;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Period of the application blocking and activity loops, in seconds
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Maximum age of resolved addresses before blocked domains are re-resolved
    #[serde(default = "default_dns_refresh_secs")]
    pub dns_refresh_secs: u64,

    /// Upper bound on a single packet receive, which bounds stop latency
    #[serde(default = "default_filter_recv_timeout_ms")]
    pub filter_recv_timeout_ms: u64,

    /// Packet interception filter expression
    #[serde(default = "default_filter")]
    pub filter: String,

    #[serde(default)]
    pub lock: LockConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    /// Overrides the platform state file location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_path: Option<PathBuf>,

    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Lock screen configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LockConfig {
    /// Rectangle the cursor is confined to while locked
    #[serde(default)]
    pub region: Region,

    #[serde(default = "default_lock_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long unlocking waits for the confinement thread
    #[serde(default = "default_lock_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

/// Activity log configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActivityConfig {
    /// Operating system processes that are never logged (case-insensitive)
    #[serde(default = "default_core_processes")]
    pub core_processes: Vec<String>,

    /// Entries kept per log; oldest are dropped first
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

/// Notification configuration
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Show desktop notifications (otherwise events are only logged)
    #[serde(default)]
    pub enabled: bool,
}

fn default_check_interval_secs() -> u64 {
    1
}

fn default_dns_refresh_secs() -> u64 {
    60
}

fn default_filter_recv_timeout_ms() -> u64 {
    250
}

fn default_filter() -> String {
    "outbound".to_string()
}

fn default_lock_poll_interval_ms() -> u64 {
    20
}

fn default_lock_join_timeout_ms() -> u64 {
    500
}

fn default_max_log_entries() -> usize {
    5000
}

fn default_core_processes() -> Vec<String> {
    [
        // Windows
        "System",
        "System Idle Process",
        "Registry",
        "smss.exe",
        "csrss.exe",
        "wininit.exe",
        "winlogon.exe",
        "services.exe",
        "lsass.exe",
        "svchost.exe",
        "dwm.exe",
        "explorer.exe",
        "conhost.exe",
        "RuntimeBroker.exe",
        "SearchIndexer.exe",
        "taskhostw.exe",
        "dllhost.exe",
        // Linux
        "systemd",
        "kthreadd",
        "dbus-daemon",
        "NetworkManager",
        "Xorg",
        // macOS
        "launchd",
        "kernel_task",
        "WindowServer",
        "mds",
        "mdworker",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            region: Region::default(),
            poll_interval_ms: default_lock_poll_interval_ms(),
            join_timeout_ms: default_lock_join_timeout_ms(),
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            core_processes: default_core_processes(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            dns_refresh_secs: default_dns_refresh_secs(),
            filter_recv_timeout_ms: default_filter_recv_timeout_ms(),
            filter: default_filter(),
            lock: LockConfig::default(),
            activity: ActivityConfig::default(),
            state_path: None,
            notifications: NotificationConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn dns_refresh(&self) -> Duration {
        Duration::from_secs(self.dns_refresh_secs)
    }

    pub fn filter_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.filter_recv_timeout_ms)
    }

    /// State file location: the configured override or the platform default
    pub fn resolve_state_path(&self) -> Result<PathBuf> {
        match &self.state_path {
            Some(path) => Ok(path.clone()),
            None => crate::state::get_state_path(),
        }
    }
}

/// Get the platform-specific configuration file path
pub fn get_config_path() -> Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/family-guard/config.yaml"))
    }

    #[cfg(target_os = "macos")]
    {
        Ok(PathBuf::from(
            "/Library/Application Support/family-guard/config.yaml",
        ))
    }

    #[cfg(target_os = "windows")]
    {
        let mut path = PathBuf::from(
            std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string()),
        );
        path.push("family-guard");
        path.push("config.yaml");
        Ok(path)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        anyhow::bail!("Unsupported operating system");
    }
}

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: EngineConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse YAML config file: {}", path.display()))?;

    validate_config(&config)?;

    Ok(config)
}

/// Load configuration, falling back to defaults when the file does not exist
pub fn load_config_or_default(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        info!("No config file at {}, using defaults", path.display());
        return Ok(EngineConfig::default());
    }
    load_config(path)
}


/// Validate configuration
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.check_interval_secs == 0 {
        anyhow::bail!("check_interval_secs must be greater than zero");
    }

    if config.dns_refresh_secs == 0 {
        anyhow::bail!("dns_refresh_secs must be greater than zero");
    }

    if config.filter_recv_timeout_ms == 0 {
        anyhow::bail!("filter_recv_timeout_ms must be greater than zero");
    }

    if config.filter.trim().is_empty() {
        anyhow::bail!("filter must not be empty");
    }

    if config.lock.region.is_empty() {
        anyhow::bail!(
            "lock.region must have a non-zero size, got {}x{}",
            config.lock.region.width,
            config.lock.region.height
        );
    }

    if config.lock.poll_interval_ms == 0 || config.lock.join_timeout_ms == 0 {
        anyhow::bail!("lock.poll_interval_ms and lock.join_timeout_ms must be greater than zero");
    }

    if config.activity.max_log_entries == 0 {
        anyhow::bail!("activity.max_log_entries must be greater than zero");
    }

    Ok(())
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = include_str!("../example-config.yaml");
