//! Phase 2: Aggregation
//!
//! Merges the declarations of every environment into two work sets, so each
//! Git remote is mirrored once and each Forge `author-name-version` is
//! resolved once per run, however many environments declare it.
//!
//! Environments are visited in the order discovery returns them (sorted by
//! directory); when two environments declare the same key, the first one
//! wins. Before insertion each spec receives the manifest-level defaults it
//! lacks: the private key for Git modules, the registry base URL and cache
//! TTL for Forge modules. The propagation is written back into the
//! environment's manifest so materialization sees the same specs.

use std::collections::{BTreeMap, HashSet};

use log::debug;

use super::{Environment, RunOptions};
use crate::config::Config;
use crate::context::SyncContext;
use crate::error::Result;
use crate::git::GitAuth;
use crate::manifest::ForgeModuleSpec;

/// One remote to mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitWorkItem {
    pub url: String,
    pub auth: GitAuth,
    /// A failure to mirror is tolerated because some declaration ignores
    /// unreachable remotes. Each environment still decides for itself
    /// during materialization.
    pub allow_fail: bool,
    /// `source/branch` of the first declaration.
    pub origin: String,
}

/// The deduplicated work of a run.
#[derive(Debug, Clone, Default)]
pub struct WorkSet {
    /// Keyed by remote URL.
    pub git: BTreeMap<String, GitWorkItem>,
    /// Keyed by `author-name-version`.
    pub forge: BTreeMap<String, ForgeModuleSpec>,
}

impl WorkSet {
    pub fn forge_keys(&self) -> HashSet<String> {
        self.forge.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.git.is_empty() && self.forge.is_empty()
    }
}

/// Executes Phase 2 of the pipeline.
///
/// Resets the latest-version table of `context`; the resolution phase fills
/// it again.
pub fn execute(
    environments: &mut [Environment],
    config: &Config,
    options: &RunOptions,
    context: &SyncContext,
) -> Result<WorkSet> {
    context.reset_latest()?;
    let mut work = WorkSet::default();

    for env in environments.iter_mut() {
        let manifest = &mut env.manifest;
        let origin = format!("{}/{}", env.source, env.branch);

        for (name, spec) in manifest.git_modules.iter_mut() {
            if spec.private_key.is_none() {
                spec.private_key = manifest.private_key.clone();
            }
            if !options.includes_module(name) {
                continue;
            }
            let Some(url) = &spec.git else {
                continue;
            };
            let tolerant = spec.ignore_unreachable || config.ignore_unreachable_modules;

            match work.git.get_mut(url) {
                Some(existing) => existing.allow_fail |= tolerant,
                None => {
                    work.git.insert(
                        url.clone(),
                        GitWorkItem {
                            url: url.clone(),
                            auth: GitAuth {
                                private_key: spec.private_key.clone(),
                                use_ssh_agent: spec.use_ssh_agent,
                            },
                            allow_fail: tolerant,
                            origin: origin.clone(),
                        },
                    );
                }
            }
        }

        for (name, spec) in manifest.forge_modules.iter_mut() {
            if spec.base_url.is_none() {
                spec.base_url = manifest.forge_base_url.clone();
            }
            if spec.cache_ttl.is_none() {
                spec.cache_ttl = manifest.forge_cache_ttl;
            }
            if !options.includes_module(name) {
                continue;
            }
            work.forge
                .entry(spec.work_key())
                .or_insert_with(|| spec.clone());
        }
    }

    debug!(
        "Work set: {} remotes, {} Forge releases",
        work.git.len(),
        work.forge.len()
    );
    Ok(work)
}
