//! Install command implementation
//!
//! Deploys the modules of a single Puppetfile into a module directory next
//! to it. There is no control repository, so no environments are discovered
//! and only content under the module directories is purged.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::Result;
use clap::Args;

use modsync::config::Config;
use modsync::output::OutputConfig;
use modsync::phases::orchestrator::{self, Engine, InstallTarget};
use modsync::phases::RunOptions;
use modsync::suggestions;

use super::{load_config, print_report};
use crate::cli::GlobalArgs;

/// Arguments for the install command
#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Puppetfile to deploy
    #[arg(long, value_name = "FILE", default_value = "Puppetfile")]
    pub puppetfile: PathBuf,

    /// Module directory relative to the Puppetfile; overrides `moduledir`
    #[arg(long, value_name = "DIR")]
    pub moduledir: Option<PathBuf>,

    /// Cache directory
    #[arg(long, value_name = "DIR", env = "MODSYNC_CACHE")]
    pub cache_dir: Option<PathBuf>,

    /// Branch that `:control_branch` references resolve to
    #[arg(long, value_name = "BRANCH", default_value = "main")]
    pub control_branch: String,

    /// Compare against the module directory without changing it
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Re-export Git trees even when their commit marker matches
    #[arg(short, long)]
    pub force: bool,
}

/// Execute the install command
pub fn execute(args: InstallArgs, global: &GlobalArgs) -> Result<ExitCode> {
    let start_time = Instant::now();
    let out = OutputConfig::from_env_and_flag(&global.color);

    if !args.puppetfile.exists() {
        return Err(suggestions::manifest_not_found(&args.puppetfile));
    }

    // The configuration is optional here
    let mut config = if global.config.exists() {
        load_config(&global.config)?
    } else {
        Config::default()
    };
    if let Some(cache_dir) = args.cache_dir {
        config.cachedir = cache_dir;
    }

    let options = RunOptions {
        dry_run: args.dry_run,
        force: args.force,
        quiet: global.quiet,
        verbose: global.verbose,
        ..Default::default()
    };
    let target = InstallTarget {
        puppetfile: args.puppetfile,
        module_dir: args.moduledir,
        control_branch: args.control_branch,
    };

    let engine = Engine::new(&config);
    let report = orchestrator::install(&target, &config, &options, &engine)?;

    if !global.quiet {
        print_report(&out, &report, start_time.elapsed());
    }
    if options.dry_run && report.needs_sync {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
