//! # Validate Command Implementation
//!
//! Parses a Puppetfile in validation mode, where any line that is not a
//! recognised directive or module declaration is an error. Nothing is
//! fetched or written.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use modsync::manifest::{parse_file, ParseOptions};
use modsync::output::{marker, OutputConfig, Status};
use modsync::suggestions;

use crate::cli::GlobalArgs;

/// Validate a Puppetfile
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Puppetfile to validate
    #[arg(value_name = "FILE", default_value = "Puppetfile")]
    pub puppetfile: PathBuf,

    /// Reject `:latest` and `:present` Forge versions
    #[arg(long)]
    pub force_forge_versions: bool,
}

/// Execute the `validate` command.
pub fn execute(args: ValidateArgs, global: &GlobalArgs) -> Result<ExitCode> {
    let out = OutputConfig::from_env_and_flag(&global.color);

    if !args.puppetfile.exists() {
        return Err(suggestions::manifest_not_found(&args.puppetfile));
    }

    let options = ParseOptions {
        source: "validate".to_string(),
        branch: "validate".to_string(),
        force_forge_versions: args.force_forge_versions,
        strict: true,
        ..Default::default()
    };
    let manifest = parse_file(&args.puppetfile, &options)?;

    if !global.quiet {
        println!(
            "{} {}: {} Forge modules, {} Git modules",
            marker(&out, Status::Ok),
            args.puppetfile.display(),
            manifest.forge_modules.len(),
            manifest.git_modules.len()
        );
        for dir in &manifest.module_dirs {
            println!("  moduledir {}", dir);
        }
    }
    Ok(ExitCode::SUCCESS)
}
