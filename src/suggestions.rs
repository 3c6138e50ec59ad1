//! # Error Suggestions
//!
//! Helper functions for error messages that say what went wrong AND how to
//! fix it. Used by the binary's commands, which report `anyhow` errors.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use crate::suggestions;
//!
//! // Instead of:
//! anyhow::bail!("Configuration file not found: {}", path.display());
//!
//! // Use:
//! return Err(suggestions::config_not_found(path));
//! ```

use std::path::Path;

/// Generate an error for when the configuration file is not found.
pub fn config_not_found(path: &Path) -> anyhow::Error {
    anyhow::anyhow!(
        "Configuration file not found: {path}\n\n\
         hint: Use -c/--config to specify a different path\n\
         hint: Set the MODSYNC_CONFIG environment variable\n\
         hint: Use 'modsync install' to deploy a single Puppetfile without a configuration",
        path = path.display()
    )
}

/// Generate an error for when a manifest is not found.
pub fn manifest_not_found(path: &Path) -> anyhow::Error {
    anyhow::anyhow!(
        "Puppetfile not found: {path}\n\n\
         hint: Use --puppetfile to point at the manifest",
        path = path.display()
    )
}

/// Generate an error for when the `git` binary cannot be executed.
pub fn git_not_available(error: &std::io::Error) -> anyhow::Error {
    anyhow::anyhow!(
        "Could not run git: {error}\n\n\
         hint: modsync shells out to git; install it and make sure it is on PATH"
    )
}
