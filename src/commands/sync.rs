//! Sync command implementation
//!
//! Deploys every branch of every configured control repository:
//! 1. Discovery of environments and their manifests
//! 2. Aggregation into a deduplicated work set
//! 3. Resolution of Git mirrors and Forge releases
//! 4. Materialization into the environment directories
//! 5. Purging of stale content
//!
//! With `--dry-run` nothing is written to the environments and the exit code
//! is 1 when a real run would change something.

use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::Args;

use modsync::output::{marker, OutputConfig, Status};
use modsync::phases::orchestrator::{self, Engine};
use modsync::phases::RunOptions;

use super::{ensure_git, load_config, print_report};
use crate::cli::GlobalArgs;

/// Arguments for the sync command
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Only deploy environments named like this branch
    #[arg(short, long, value_name = "BRANCH")]
    pub branch: Option<String>,

    /// Only update the module with this name; skips purging
    #[arg(short, long, value_name = "NAME")]
    pub module: Option<String>,

    /// Compare against the environments without changing them
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Re-export Git trees even when their commit marker matches
    #[arg(short, long)]
    pub force: bool,
}

/// Execute the sync command
pub fn execute(args: SyncArgs, global: &GlobalArgs) -> Result<ExitCode> {
    let start_time = Instant::now();
    let out = OutputConfig::from_env_and_flag(&global.color);

    let config = load_config(&global.config)?;
    config.require_sources()?;
    ensure_git()?;

    let options = RunOptions {
        branch: args.branch,
        module: args.module,
        dry_run: args.dry_run,
        force: args.force,
        quiet: global.quiet,
        verbose: global.verbose,
    };

    let engine = Engine::new(&config);
    let report = orchestrator::run(&config, &options, &engine)?;

    if !global.quiet {
        print_report(&out, &report, start_time.elapsed());
    }

    if options.dry_run && report.needs_sync {
        if !global.quiet {
            println!(
                "{} environments are out of date",
                marker(&out, Status::Changed)
            );
        }
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
