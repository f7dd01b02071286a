//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::deploy::pipeline::Toolchain;
use crate::logs::LogLevel;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines instead of plain text
    #[serde(default)]
    pub log_json: bool,

    /// Also write logs to a daily rolling file under `<storage_dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,

    /// Root of the status records and working directories
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Number of deployments that may run at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default per-job timeout in seconds, 0 disables it
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Age after which an `in_progress` record no longer short-circuits a
    /// submission
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Local ports handed out to deployed applications
    #[serde(default)]
    pub ports: PortSettings,

    /// External programs
    #[serde(default)]
    pub toolchain: Toolchain,

    /// Reverse proxy configuration
    #[serde(default)]
    pub proxy: ProxySettings,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/tenant-deployer")
}

fn default_workers() -> usize {
    2
}

fn default_job_timeout_secs() -> u64 {
    1800
}

fn default_stale_after_secs() -> u64 {
    3600
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            storage_dir: default_storage_dir(),
            server: ServerSettings::default(),
            workers: default_workers(),
            job_timeout_secs: default_job_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            ports: PortSettings::default(),
            toolchain: Toolchain::default(),
            proxy: ProxySettings::default(),
        }
    }
}

/// HTTP server settings
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
    8080
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Port range settings (inclusive)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    #[serde(default = "default_port_start")]
    pub start: u16,

    #[serde(default = "default_port_end")]
    pub end: u16,
}

fn default_port_start() -> u16 {
    4000
}

fn default_port_end() -> u16 {
    4999
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

/// nginx site directories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_sites_available")]
    pub sites_available: PathBuf,

    #[serde(default = "default_sites_enabled")]
    pub sites_enabled: PathBuf,
}

fn default_sites_available() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-available")
}

fn default_sites_enabled() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            sites_available: default_sites_available(),
            sites_enabled: default_sites_enabled(),
        }
    }
}
