//! Application configuration options

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::executor::ExecutorOptions;
use crate::deploy::pipeline::Toolchain;
use crate::jobs::queue::QueueOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::deployer;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub storage: StorageLayout,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployer worker pool
    pub deployer: deployer::Options,

    /// Admission settings
    pub queue: QueueOptions,

    /// Per-job execution settings
    pub executor: ExecutorOptions,

    /// Ports handed out to deployed applications
    pub ports: RangeInclusive<u16>,

    /// External programs
    pub toolchain: Toolchain,

    /// nginx site directories
    pub proxy: ProxyOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl AppOptions {
    /// Map the settings file onto runtime options
    pub fn from_settings(settings: &Settings) -> Self {
        let default_timeout = match settings.job_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageLayout::new(&settings.storage_dir),
            enable_server: true,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            deployer: deployer::Options {
                workers: settings.workers.max(1),
            },
            queue: QueueOptions {
                stale_after: Duration::from_secs(settings.stale_after_secs),
            },
            executor: ExecutorOptions { default_timeout },
            ports: settings.ports.start..=settings.ports.end,
            toolchain: settings.toolchain.clone(),
            proxy: ProxyOptions {
                sites_available: settings.proxy.sites_available.clone(),
                sites_enabled: settings.proxy.sites_enabled.clone(),
            },
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown, running deployments included
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(600),
        }
    }
}

/// Local HTTP server options
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
            port: 8080,
        }
    }
}

/// Reverse proxy directories
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
}
