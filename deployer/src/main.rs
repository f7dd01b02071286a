//! Tenant Deployer - Entry Point
//!
//! Daemon that deploys per-tenant web application instances and reports
//! their progress over a local HTTP API.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use tenant_deployer::app::options::AppOptions;
use tenant_deployer::app::run::run;
use tenant_deployer::filesys::file::File;
use tenant_deployer::logs::{init_logging, LogOptions};
use tenant_deployer::storage::settings::Settings;
use tenant_deployer::utils::{run_check, version_info};

use tracing::{error, info};

const DEFAULT_SETTINGS_PATH: &str = "/etc/tenant-deployer/settings.json";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failed to serialize version info: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    // Retrieve the settings file
    let settings = match load_settings(cli_args.get("config")).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Check the toolchain and exit
    if cli_args.contains_key("check") {
        return if run_check(&settings.toolchain).await {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    // Initialize logging
    let options = AppOptions::from_settings(&settings);
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| options.storage.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the daemon
    info!("Running tenant deployer {} with options: {:?}", version.version, options);
    match run(options, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run the deployer: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Settings from `--config=<path>`, or the default path when it exists,
/// or built-in defaults
async fn load_settings(path: Option<&String>) -> Result<Settings, String> {
    let (file, explicit) = match path {
        Some(path) => (File::new(PathBuf::from(path)), true),
        None => (File::new(DEFAULT_SETTINGS_PATH), false),
    };

    if !explicit && !file.exists().await {
        return Ok(Settings::default());
    }
    file.read_json::<Settings>()
        .await
        .map_err(|e| format!("{}: {}", file.path().display(), e))
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Failed to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
