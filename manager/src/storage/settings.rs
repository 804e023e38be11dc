//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub json_logs: bool,

    /// HTTP API server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// On-disk state configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Host platform configuration
    #[serde(default)]
    pub platform: PlatformSettings,

    /// Subprocess timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Status reconciliation interval in seconds
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
}

fn default_reconcile_interval() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_dir: None,
            json_logs: false,
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            platform: PlatformSettings::default(),
            timeouts: TimeoutSettings::default(),
            reconcile_interval_secs: default_reconcile_interval(),
        }
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8470
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root of the registry file and per-bot working directories
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("/var/lib/botyard")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

/// Which platform style compose documents are adapted for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentTargetSetting {
    /// Probe the metadata root once at start-up
    #[default]
    Auto,
    Standalone,
    Casaos,
}

/// Host platform settings fed into variable substitution and compose transforms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformSettings {
    #[serde(default = "default_id")]
    pub puid: u32,

    #[serde(default = "default_id")]
    pub pgid: u32,

    #[serde(default = "default_tz")]
    pub tz: String,

    #[serde(default = "default_domain")]
    pub domain: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    #[serde(default = "default_platform_port")]
    pub port: u16,

    /// Host directory that replaces the app-data sentinel prefix
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// External network the main service of every bot joins
    #[serde(default = "default_network_name")]
    pub network_name: String,

    /// Directory where the platform looks for app compose documents
    #[serde(default = "default_metadata_root")]
    pub metadata_root: PathBuf,

    #[serde(default)]
    pub deployment_target: DeploymentTargetSetting,
}

fn default_id() -> u32 {
    1000
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_platform_port() -> u16 {
    80
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/DATA/AppData")
}

fn default_network_name() -> String {
    "botyard".to_string()
}

fn default_metadata_root() -> PathBuf {
    PathBuf::from("/var/lib/casaos/apps")
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            puid: default_id(),
            pgid: default_id(),
            tz: default_tz(),
            domain: default_domain(),
            scheme: default_scheme(),
            port: default_platform_port(),
            data_root: default_data_root(),
            network_name: default_network_name(),
            metadata_root: default_metadata_root(),
            deployment_target: DeploymentTargetSetting::Auto,
        }
    }
}

/// Subprocess timeout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    /// Quick queries (ps, inspect, stop, git metadata)
    #[serde(default = "default_quick_secs")]
    pub quick_secs: u64,

    /// Image builds and pulls, git clones
    #[serde(default = "default_build_secs")]
    pub build_secs: u64,

    /// Compose up/down and container start
    #[serde(default = "default_deploy_secs")]
    pub deploy_secs: u64,

    /// Wait between SIGTERM and SIGKILL
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

fn default_quick_secs() -> u64 {
    30
}

fn default_build_secs() -> u64 {
    1800
}

fn default_deploy_secs() -> u64 {
    600
}

fn default_kill_grace_secs() -> u64 {
    10
}

impl TimeoutSettings {
    pub fn quick(&self) -> Duration {
        Duration::from_secs(self.quick_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn deploy(&self) -> Duration {
        Duration::from_secs(self.deploy_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            quick_secs: default_quick_secs(),
            build_secs: default_build_secs(),
            deploy_secs: default_deploy_secs(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: Settings = serde_json::from_str(
            r#"{"log_level": "debug", "platform": {"puid": 0, "deployment_target": "casaos"}}"#,
        )
        .unwrap();

        assert_eq!(settings.log_level, LogLevel::Debug);
        assert_eq!(settings.platform.puid, 0);
        assert_eq!(settings.platform.pgid, 1000);
        assert_eq!(settings.platform.deployment_target, DeploymentTargetSetting::Casaos);
        assert_eq!(settings.server.port, 8470);
        assert_eq!(settings.timeouts.kill_grace(), Duration::from_secs(10));
    }
}
