//! # modsync
//!
//! This library deploys Puppet module trees described by `Puppetfile`
//! manifests. Modules come from Git remotes and from a Forge module
//! registry; every branch of a configured control repository becomes an
//! environment directory holding the control tree plus its modules. The
//! `modsync` command-line tool is a thin wrapper around it.
//!
//! ## Quick Example
//!
//! ```
//! use std::path::Path;
//! use modsync::manifest::{parse_str, ParseOptions};
//!
//! let manifest = parse_str(
//!     "mod 'puppetlabs/apt', '2.3.0'\nmod 'site', :git => 'https://git.example.com/site.git'\n",
//!     Path::new("Puppetfile"),
//!     &ParseOptions::default(),
//! )
//! .unwrap();
//! assert_eq!(manifest.module_count(), 2);
//! ```
//!
//! ## Core Concepts
//!
//! - **Manifest (`manifest`)**: The `Puppetfile` parser: directives, module
//!   declarations and their attributes.
//! - **Configuration (`config`)**: The YAML run configuration: sources, cache
//!   location, worker counts and purge policy.
//! - **Git (`git`, `repository`, `archive`)**: Bare mirrors per remote and
//!   tree export through `git archive`.
//! - **Forge (`forge`, `cache`)**: The registry client and the on-disk
//!   release cache with its `-latest` symlinks.
//! - **Filesystem (`filesystem`)**: Hardlink or copy materialization of
//!   cached trees into environments.
//!
//! ## Execution Flow
//!
//! The entry points live in `phases::orchestrator`:
//!
//! 1.  **Discovery**: Mirror each control repository and parse the manifest
//!     of every branch.
//! 2.  **Aggregation**: Merge the declarations of all environments into one
//!     deduplicated work set.
//! 3.  **Resolution**: Mirror Git remotes and fill the Forge cache on two
//!     bounded worker pools.
//! 4.  **Materialization**: Populate each environment from the caches.
//! 5.  **Purging**: Remove content no current declaration accounts for.

pub mod archive;
pub mod cache;
pub mod config;
pub mod context;
pub mod defaults;
pub mod deploy;
pub mod duration;
pub mod error;
pub mod filesystem;
pub mod forge;
pub mod git;
pub mod manifest;
pub mod output;
pub mod path;
pub mod phases;
pub mod repository;
pub mod suggestions;

#[cfg(test)]
mod manifest_proptest;
