//! The phases of a sync run.
//!
//! ## Overview
//!
//! 1. Discovery - mirror every control repository and parse the manifest of
//!    each environment branch ([`discovery`])
//! 2. Aggregation - merge all declarations into two deduplicated work sets
//!    ([`aggregate`])
//! 3. Resolution - sync Git mirrors and resolve Forge releases on two bounded
//!    pools running side by side ([`resolve`])
//! 4. Materialization - populate each environment from the mirrors and the
//!    registry cache ([`materialize`])
//! 5. Purging - remove whatever the run did not produce ([`purge`])
//!
//! [`orchestrator`] strings them together. Each phase depends only on the
//! outputs of the phases before it plus the shared [`crate::context::SyncContext`].

use std::path::PathBuf;

use crate::manifest::ModuleManifest;

pub mod aggregate;
pub mod discovery;
pub mod materialize;
pub mod orchestrator;
pub mod purge;
pub mod resolve;

/// Options of one run, set from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Only sync the environment built from this branch.
    pub branch: Option<String>,
    /// Only sync modules with this name.
    pub module: Option<String>,
    /// Compare without touching any environment.
    pub dry_run: bool,
    /// Re-export trees even when their commit marker matches.
    pub force: bool,
    /// Hide progress bars.
    pub quiet: bool,
    /// Log deprecations as they are seen.
    pub verbose: bool,
}

impl RunOptions {
    /// Whether module `name` takes part in this run.
    pub fn includes_module(&self, name: &str) -> bool {
        self.module.as_deref().is_none_or(|m| m == name)
    }
}

/// The control branch an environment is deployed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTree {
    pub mirror: PathBuf,
    pub commit: String,
}

/// One environment of the run.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Owning source name.
    pub source: String,
    /// Branch of the control repository (what `:control_branch` refers to).
    pub branch: String,
    /// Directory name: the branch name, corrected and prefixed.
    pub name: String,
    /// `{basedir}/{name}`
    pub dir: PathBuf,
    /// `None` when only a manifest is installed, with no control repository.
    pub control: Option<ControlTree>,
    pub manifest: ModuleManifest,
    pub warn_if_branch_is_missing: bool,
}

impl Environment {
    /// Module directories of the manifest, or the default one.
    pub fn module_dirs(&self) -> Vec<String> {
        if self.manifest.module_dirs.is_empty() {
            vec![crate::manifest::DEFAULT_MODULE_DIR.to_string()]
        } else {
            self.manifest.module_dirs.clone()
        }
    }
}
