//! # modsync CLI
//!
//! This is the binary entry point for the `modsync` command-line tool.
//!
//! It parses the command line with `clap`, dispatches to the subcommand and
//! turns a fatal error into a coloured diagnostic and a non-zero exit code.
//! The deployment logic lives in the `modsync` library crate.

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use modsync::output::{marker, OutputConfig, Status};

fn main() -> ExitCode {
    let cli = cli::Cli::parse();
    let out = OutputConfig::from_env_and_flag(&cli.color);
    out.apply();

    match cli.execute() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", marker(&out, Status::Error), e);
            for cause in e.chain().skip(1) {
                eprintln!("  caused by: {}", cause);
            }
            ExitCode::from(2)
        }
    }
}
