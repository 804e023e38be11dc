//! Application configuration options

use std::time::Duration;

use crate::buildlog::DEFAULT_CAPACITY;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{PlatformSettings, Settings, TimeoutSettings};
use crate::workers::reconciler;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable the HTTP API
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Enable the periodic reconciler
    pub enable_reconciler: bool,

    /// Reconciler worker options
    pub reconciler: reconciler::Options,

    /// Host platform configuration
    pub platform: PlatformSettings,

    /// Subprocess timeouts
    pub timeouts: TimeoutSettings,

    /// Queued operations accepted before submitters wait
    pub job_queue_capacity: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            enable_reconciler: true,
            reconciler: reconciler::Options::default(),
            platform: PlatformSettings::default(),
            timeouts: TimeoutSettings::default(),
            job_queue_capacity: 64,
        }
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            storage: StorageOptions {
                layout: StorageLayout::new(&settings.storage.base_dir),
                ..Default::default()
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            enable_reconciler: settings.reconcile_interval_secs > 0,
            reconciler: reconciler::Options {
                interval: Duration::from_secs(settings.reconcile_interval_secs.max(1)),
                ..Default::default()
            },
            platform: settings.platform.clone(),
            timeouts: settings.timeouts.clone(),
            ..Default::default()
        }
    }
}

/// Lifecycle options for the manager
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(60),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Entries retained per build log
    pub build_log_capacity: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            build_log_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.storage.base_dir = "/tmp/botyard".into();
        settings.reconcile_interval_secs = 0;

        let options = AppOptions::from_settings(&settings);
        assert_eq!(options.storage.layout.base_dir, std::path::PathBuf::from("/tmp/botyard"));
        assert_eq!(options.server.port, 8470);
        assert!(!options.enable_reconciler);
        assert!(options.enable_server);
    }
}
