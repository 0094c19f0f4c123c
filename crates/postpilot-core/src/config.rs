//! PostPilot configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SchedulerError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Base directory for all durable state (snapshot, per-task data).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub license: LicenseFileConfig,
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".postpilot")
}

/// Dispatcher loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on one idle wait, in seconds. The loop re-evaluates the
    /// due set at least this often even without a wakeup signal.
    #[serde(default = "default_idle_poll_secs")]
    pub idle_poll_secs: u64,
    /// How long shutdown waits for an in-flight run before giving up.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// How long execute-now waits for the global lock before reporting Busy.
    #[serde(default = "default_execute_now_wait_secs")]
    pub execute_now_wait_secs: u64,
}

fn default_idle_poll_secs() -> u64 {
    60
}
fn default_shutdown_grace_secs() -> u64 {
    300
}
fn default_execute_now_wait_secs() -> u64 {
    5
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_poll_secs: default_idle_poll_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            execute_now_wait_secs: default_execute_now_wait_secs(),
        }
    }
}

/// Browser-automation service the agents talk to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Base URL of the local MCP automation service.
    #[serde(default = "default_service_url")]
    pub service_url: String,
    /// Per-request timeout for login probes, in seconds.
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_service_url() -> String {
    "http://localhost:18060".into()
}
fn default_probe_timeout_secs() -> u64 {
    30
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

/// Where the license state file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseFileConfig {
    /// Path to the license state file; relative paths resolve under data_dir.
    #[serde(default = "default_license_file")]
    pub file: PathBuf,
}

fn default_license_file() -> PathBuf {
    PathBuf::from("license.json")
}

impl Default for LicenseFileConfig {
    fn default() -> Self {
        Self {
            file: default_license_file(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dispatcher: DispatcherConfig::default(),
            automation: AutomationConfig::default(),
            license: LicenseFileConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load config from the default path (~/.postpilot/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedulerError::Config(format!("failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SchedulerError::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Default config path (~/.postpilot/config.toml).
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.toml")
    }

    /// Registry snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("dispatcher").join("snapshot.json")
    }

    /// Root of the per-task workspaces.
    pub fn tasks_dir(&self) -> PathBuf {
        self.data_dir.join("tasks")
    }

    /// The process-wide shared cookie file consumed by the automation
    /// backend. Single-writer: guarded by the global execution lock.
    pub fn shared_cookie_path(&self) -> PathBuf {
        self.data_dir.join("automation").join("cookies.json")
    }

    /// Resolved license file path.
    pub fn license_path(&self) -> PathBuf {
        if self.license.file.is_absolute() {
            self.license.file.clone()
        } else {
            self.data_dir.join(&self.license.file)
        }
    }
}
