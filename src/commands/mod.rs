//! # CLI Command Implementations
//!
//! Each subcommand of the `modsync` tool lives in its own file with:
//! - An `Args` struct that defines the command-specific arguments and options,
//!   derived using `clap`.
//! - An `execute` function that takes the parsed `Args` plus the global flags
//!   and returns the process exit code.
//!
//! The helpers below are shared by the commands that deploy.

pub mod install;
pub mod sync;
pub mod validate;

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};

use modsync::config::{self, Config};
use modsync::output::{marker, OutputConfig, Status};
use modsync::phases::orchestrator::SyncReport;
use modsync::suggestions;

/// Load and validate the configuration at `path`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Err(suggestions::config_not_found(path));
    }
    config::from_file(path).with_context(|| format!("Invalid configuration {}", path.display()))
}

/// Fail early with a hint when `git` cannot be executed.
pub fn ensure_git() -> Result<()> {
    Command::new("git")
        .arg("--version")
        .output()
        .map_err(|e| suggestions::git_not_available(&e))?;
    Ok(())
}

/// Print the end-of-run summary to stdout.
pub fn print_report(out: &OutputConfig, report: &SyncReport, elapsed: Duration) {
    let stats = &report.stats;
    for url in &stats.unreachable {
        println!("{} {} was unreachable", marker(out, Status::Warning), url);
    }
    println!(
        "{} {} environments, {} modules updated, {} unchanged, {} paths purged ({:.1}s)",
        marker(out, Status::Ok),
        stats.environments_synced,
        stats.modules_updated,
        stats.modules_unchanged,
        stats.paths_purged,
        elapsed.as_secs_f64()
    );
    println!(
        "  {} mirrors synced, {} Forge queries, {} cache hits, {} downloads",
        stats.mirrors_synced, stats.forge_queries, stats.forge_cache_hits, stats.forge_downloads
    );
}
