//! Utility functions

use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::deploy::command::{CommandRunner, ProcessRunner};
use crate::deploy::pipeline::Toolchain;
use crate::stream::sink::MemorySink;

/// Version information for the deployer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Get version information
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        git_hash: option_env!("GIT_HASH").unwrap_or("unknown").to_string(),
        build_time: option_env!("BUILD_TIME").unwrap_or("unknown").to_string(),
    }
}

/// Probe every tool of the toolchain and print a report. Returns whether
/// all of them are usable.
pub async fn run_check(toolchain: &Toolchain) -> bool {
    check_with(&ProcessRunner::new(), toolchain).await
}

async fn check_with(runner: &dyn CommandRunner, toolchain: &Toolchain) -> bool {
    println!("{}", "Toolchain".bold());

    let mut all_ok = true;
    for probe in toolchain.probes() {
        let sink = MemorySink::new();
        match runner.run(&probe, &sink).await {
            Ok(_) => {
                let version = sink.lines().into_iter().next().unwrap_or_default();
                println!("  {} {:<8} {}", "✓".green(), probe.program, version.dimmed());
            }
            Err(e) => {
                all_ok = false;
                println!("  {} {:<8} {}", "✗".red(), probe.program, e.to_string().red());
            }
        }
    }

    if all_ok {
        println!("{}", "All required tools are available".green());
    } else {
        println!("{}", "Some required tools are missing".red().bold());
    }
    all_ok
}
