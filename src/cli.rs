//! CLI argument parsing and command dispatch

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::LevelFilter;

use crate::commands;

/// modsync - Deploy Puppetfile module trees into environments
#[derive(Parser, Debug)]
#[command(name = "modsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Colorize output (always, never, auto)
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    pub color: String,

    /// Set log level (off, error, warn, info, debug, trace)
    #[arg(
        long,
        global = true,
        value_name = "LEVEL",
        default_value = "info",
        value_parser = parse_level
    )]
    log_level: LevelFilter,

    /// Log every step and report deprecations as they are found
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only report errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to the YAML configuration
    #[arg(
        short,
        long,
        global = true,
        value_name = "FILE",
        env = "MODSYNC_CONFIG",
        default_value = "modsync.yaml"
    )]
    config: PathBuf,
}

fn parse_level(value: &str) -> std::result::Result<LevelFilter, String> {
    value.parse().map_err(|_| {
        format!(
            "'{}' is not a log level (off, error, warn, info, debug, trace)",
            value
        )
    })
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy every environment of the configured sources
    Sync(commands::sync::SyncArgs),

    /// Deploy the modules of a single Puppetfile
    Install(commands::install::InstallArgs),

    /// Check a Puppetfile without deploying anything
    Validate(commands::validate::ValidateArgs),
}

/// Flags every command sees.
#[derive(Debug, Clone)]
pub struct GlobalArgs {
    pub config: PathBuf,
    pub color: String,
    pub verbose: bool,
    pub quiet: bool,
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<ExitCode> {
        self.init_logging();
        let global = GlobalArgs {
            config: self.config,
            color: self.color,
            verbose: self.verbose,
            quiet: self.quiet,
        };

        match self.command {
            Commands::Sync(args) => commands::sync::execute(args, &global),
            Commands::Install(args) => commands::install::execute(args, &global),
            Commands::Validate(args) => commands::validate::execute(args, &global),
        }
    }

    fn init_logging(&self) {
        let level = if self.quiet {
            LevelFilter::Error
        } else if self.verbose {
            LevelFilter::Debug
        } else {
            self.log_level
        };

        // RUST_LOG refines the level from the flags
        let _ = env_logger::Builder::new()
            .filter_level(level)
            .parse_default_env()
            .format_target(false)
            .try_init();
    }
}
