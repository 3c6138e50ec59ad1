//! Phase 1: Discovery
//!
//! Turns the configured sources into the list of environments of this run.
//!
//! ## Process
//!
//! 1.  **Mirroring**: the control repository of every source is mirrored in
//!     parallel. An unreachable control repository skips its source with a
//!     warning, unless the source sets `exit_if_unreachable`.
//!
//! 2.  **Branch selection**: every branch of the mirror becomes an
//!     environment, minus those rejected by `filter_regex` or by `--branch`.
//!     Branch names that are not valid directory names are corrected or
//!     rejected per `invalid_branches`, then prefixed per `prefix`.
//!
//! 3.  **Manifest parsing**: the `Puppetfile` at the tip of each branch is
//!     read straight from the mirror and parsed. A branch without one still
//!     deploys its control tree.
//!
//! Environments come back sorted by directory, so later phases see them in a
//! deterministic order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use log::{debug, error, info, warn};
use rayon::prelude::*;
use regex::Regex;

use super::{ControlTree, Environment, RunOptions};
use crate::config::{Config, InvalidBranches, SourceConfig};
use crate::context::SyncContext;
use crate::defaults::MANIFEST_FILE_NAME;
use crate::error::{Error, Result};
use crate::git::GitAuth;
use crate::manifest::{parse_str, ModuleManifest, ParseOptions};
use crate::path::{is_valid_environment_name, normalize_environment_name};
use crate::repository::RepositoryManager;

/// Result of Phase 1.
#[derive(Debug, Default)]
pub struct Discovery {
    pub environments: Vec<Environment>,
    /// Sources whose control repository was reachable. Only their basedirs
    /// are purged.
    pub synced_sources: Vec<String>,
}

/// Executes Phase 1 of the pipeline.
pub fn execute(
    config: &Config,
    repos: &RepositoryManager,
    options: &RunOptions,
    context: &SyncContext,
) -> Result<Discovery> {
    config.require_sources()?;

    let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());
    let found: Mutex<BTreeMap<String, Vec<Environment>>> = Mutex::new(BTreeMap::new());

    config.sources.par_iter().for_each(|(name, source)| {
        let outcome = discover_source(name, source, repos, options, context).and_then(|envs| {
            if let Some(envs) = envs {
                found
                    .lock()
                    .map_err(|_| Error::LockPoisoned {
                        context: "discovered environments".to_string(),
                    })?
                    .insert(name.clone(), envs);
            }
            Ok(())
        });
        if let Err(e) = outcome {
            if let Ok(mut errors) = errors.lock() {
                errors.push(e);
            }
        }
    });

    let collected_errors = errors.into_inner().map_err(|_| Error::LockPoisoned {
        context: "discovery errors".to_string(),
    })?;
    if let Some(first_error) = collected_errors.into_iter().next() {
        return Err(first_error);
    }

    let found = found.into_inner().map_err(|_| Error::LockPoisoned {
        context: "discovered environments".to_string(),
    })?;
    let synced_sources = found.keys().cloned().collect();
    let mut environments: Vec<Environment> = found.into_values().flatten().collect();
    environments.sort_by(|a, b| a.dir.cmp(&b.dir));

    if let Some(pair) = environments.windows(2).find(|w| w[0].dir == w[1].dir) {
        return Err(Error::Config {
            message: format!(
                "branches '{}' ({}) and '{}' ({}) both deploy to {}",
                pair[0].branch,
                pair[0].source,
                pair[1].branch,
                pair[1].source,
                pair[0].dir.display()
            ),
            hint: Some("Rename one of the branches or set a source prefix".to_string()),
        });
    }

    if let Some(branch) = &options.branch {
        if environments.is_empty() {
            warn!("No source has a branch named '{}'", branch);
        }
    }

    Ok(Discovery {
        environments,
        synced_sources,
    })
}

/// Environments of one source, `None` when its control repository is
/// unreachable and the source tolerates that.
fn discover_source(
    name: &str,
    source: &SourceConfig,
    repos: &RepositoryManager,
    options: &RunOptions,
    context: &SyncContext,
) -> Result<Option<Vec<Environment>>> {
    let mirror = repos.environment_mirror(&source.remote);
    let auth = GitAuth::with_key(source.private_key.clone());

    if let Err(e) = repos.sync_mirror(&source.remote, &mirror, &auth) {
        if source.exit_if_unreachable {
            return Err(e);
        }
        warn!("Skipping source '{}': {}", name, e);
        context.record(|s| s.unreachable.push(source.remote.clone()))?;
        return Ok(None);
    }
    context.record(|s| s.mirrors_synced += 1)?;

    let filter = source.filter_regex.as_deref().map(Regex::new).transpose()?;
    let prefix = source.prefix.resolve(name);
    let mut environments = Vec::new();

    for branch in repos.list_branches(&mirror)? {
        if let Some(filter) = &filter {
            if !filter.is_match(&branch) {
                debug!("Branch '{}' of '{}' does not match filter_regex", branch, name);
                continue;
            }
        }

        let Some(env_name) = environment_name(name, &branch, source.invalid_branches) else {
            continue;
        };
        let env_name = match &prefix {
            Some(prefix) => format!("{}_{}", prefix, env_name),
            None => env_name,
        };

        if let Some(wanted) = &options.branch {
            if wanted != &branch && wanted != &env_name {
                continue;
            }
        }

        let Some(resolved) = repos.resolve_tree(&mirror, &branch, &[])? else {
            warn!("Branch '{}' of '{}' vanished during discovery", branch, name);
            continue;
        };

        let manifest_path = PathBuf::from(format!("{}/{}/{}", name, branch, MANIFEST_FILE_NAME));
        let parse_options = ParseOptions {
            source: name.to_string(),
            branch: branch.clone(),
            force_forge_versions: source.force_forge_versions,
            private_key: source.private_key.clone(),
            ..Default::default()
        };
        let manifest =
            match repos.read_file(&mirror, &resolved.commit, MANIFEST_FILE_NAME)? {
                Some(content) => parse_str(&content, &manifest_path, &parse_options)?,
                None => {
                    debug!("{} has no {}", branch, MANIFEST_FILE_NAME);
                    ModuleManifest {
                        path: manifest_path,
                        source: name.to_string(),
                        branch: branch.clone(),
                        private_key: source.private_key.clone(),
                        ..Default::default()
                    }
                }
            };

        info!(
            "Environment {} from {}@{} ({} modules)",
            env_name,
            name,
            branch,
            manifest.module_count()
        );
        environments.push(Environment {
            source: name.to_string(),
            dir: source.basedir.join(&env_name),
            name: env_name,
            branch,
            control: Some(ControlTree {
                mirror: mirror.clone(),
                commit: resolved.commit,
            }),
            manifest,
            warn_if_branch_is_missing: source.warn_if_branch_is_missing,
        });
    }

    Ok(Some(environments))
}

/// Directory name for `branch`, `None` if the branch is rejected.
fn environment_name(source: &str, branch: &str, policy: InvalidBranches) -> Option<String> {
    if is_valid_environment_name(branch) {
        return Some(branch.to_string());
    }
    match policy {
        InvalidBranches::Error => {
            error!(
                "Skipping branch '{}' of '{}': not a valid environment name",
                branch, source
            );
            None
        }
        InvalidBranches::Correct => Some(normalize_environment_name(branch)),
        InvalidBranches::CorrectAndWarn => {
            let corrected = normalize_environment_name(branch);
            warn!(
                "Branch '{}' of '{}' deploys as '{}'",
                branch, source, corrected
            );
            Some(corrected)
        }
    }
}
