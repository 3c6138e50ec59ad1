//! # Error Handling
//!
//! This module defines the centralized error type for the `modsync` library.
//! It uses the `thiserror` library to create a single `Error` enum that covers
//! every anticipated failure mode, with enough context in each variant to
//! produce a useful diagnostic.
//!
//! ## Error kinds
//!
//! - **Declaration errors** (`ManifestParse`, `Config`): malformed manifests or
//!   configuration. Always fatal, reported with file and line context.
//! - **Transient network errors** (`GitUnreachable`, `Network`): recoverable
//!   through cache fallback or fallback branches when the configuration allows
//!   it, fatal otherwise.
//! - **Registry errors** (`ForgeNotFound`): the requested module or release
//!   does not exist.
//! - **Integrity errors** (`Integrity`): checksum or size mismatch after a
//!   download. The registry cache retries once before surfacing this.
//! - **Filesystem errors** (`DeviceMismatch`, `Filesystem`, `Io`): fatal, since
//!   partial materialization would corrupt an environment.
//!
//! The `Result` type alias is used throughout the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for modsync operations
#[derive(Error, Debug)]
pub enum Error {
    /// A manifest (Puppetfile) could not be parsed.
    #[error("{path}:{line}: {message}")]
    ManifestParse {
        path: String,
        line: usize,
        message: String,
    },

    /// The YAML configuration is invalid.
    #[error("Configuration error: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    Config {
        message: String,
        /// Optional hint for how to fix the configuration issue
        hint: Option<String>,
    },

    /// A Git command exited unsuccessfully.
    #[error("Git command failed for {url}: {command} - {stderr}")]
    GitCommand {
        command: String,
        url: String,
        stderr: String,
    },

    /// A Git remote could not be reached, or a tree does not exist in it.
    #[error("Could not reach {url} ({tree}): {message}")]
    GitUnreachable {
        url: String,
        tree: String,
        message: String,
    },

    /// The registry answered 404 for a module or release.
    #[error("Forge module not found: {slug} ({url})")]
    ForgeNotFound { slug: String, url: String },

    /// A registry request failed at the transport level or returned an
    /// unexpected status.
    #[error("Network operation error: {url} - {message}")]
    Network { url: String, message: String },

    /// A downloaded archive did not match its expected checksum or size.
    #[error("Integrity check failed for {artifact}: {check} expected {expected}, got {actual}")]
    Integrity {
        artifact: String,
        check: String,
        expected: String,
        actual: String,
    },

    /// Hardlink materialization was requested across filesystems.
    #[error("Cannot hardlink from {} to {}: they are on different devices\n  hint: set `materialize: copy` or move the cache onto the same filesystem", cache.display(), target.display())]
    DeviceMismatch { cache: PathBuf, target: PathBuf },

    /// A registry cache operation failed.
    #[error("Cache operation error: {message}")]
    Cache { message: String },

    /// An on-disk filesystem operation failed.
    #[error("Filesystem operation error: {path}: {message}")]
    Filesystem { path: String, message: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON parsing error, wrapped from `serde_json::Error`.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// A regular expression error, wrapped from `regex::Error`.
    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    /// A glob pattern error, wrapped from `glob::PatternError`.
    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),

    /// A directory walk error, wrapped from `walkdir::Error`.
    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },
}

impl Error {
    /// Build a `ManifestParse` error for `path` at 1-based `line`.
    pub fn manifest(path: &str, line: usize, message: impl Into<String>) -> Self {
        Error::ManifestParse {
            path: path.to_string(),
            line,
            message: message.into(),
        }
    }

    /// Build a `Filesystem` error for `path`.
    pub fn filesystem(path: &std::path::Path, message: impl std::fmt::Display) -> Self {
        Error::Filesystem {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Whether this error came from the network and may be recovered by a
    /// fallback policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network { .. } | Error::GitUnreachable { .. })
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
