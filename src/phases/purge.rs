//! Phase 5: Purging
//!
//! Removes what the run did not produce, per configured purge level:
//!
//! - `deployment`: environment directories under the basedir of a synced
//!   source, except names matching `deployment_purge_allowlist`
//! - `puppetfile`: entries of a module directory not declared by the
//!   environment's manifest
//! - `environment`: entries of an environment outside its module directories
//!   and Git module install paths that the control tree does not contain,
//!   except paths matching `purge_allowlist`
//!
//! What counts as produced is the managed set the materialization phase
//! built. `--branch` disables deployment purging; `--module` disables it
//! together with Puppetfile purging. In dry-run mode nothing is removed and
//! anything stale marks the run as needing a sync.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

use super::{Environment, RunOptions};
use crate::config::{Config, PurgeLevel};
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::filesystem::remove_path;
use crate::path::glob_match;

pub struct Purger<'a> {
    pub config: &'a Config,
    pub options: &'a RunOptions,
    pub context: &'a SyncContext,
}

impl Purger<'_> {
    /// Executes Phase 5 of the pipeline; returns the number of paths
    /// removed (or, in dry-run mode, found stale).
    pub fn execute(&self, environments: &[Environment], synced_sources: &[String]) -> Result<usize> {
        let mut purged = 0;

        if self.config.purges(PurgeLevel::Deployment)
            && self.options.branch.is_none()
            && self.options.module.is_none()
        {
            for source in synced_sources {
                purged += self.purge_deployment(source)?;
            }
        }

        for env in environments {
            if self.config.purges(PurgeLevel::Puppetfile) && self.options.module.is_none() {
                purged += self.purge_module_dirs(env)?;
            }
            if self.config.purges(PurgeLevel::Environment) && env.control.is_some() {
                purged += self.purge_environment(env)?;
            }
        }

        self.context.record(|s| s.paths_purged += purged)?;
        Ok(purged)
    }

    fn purge_deployment(&self, source_name: &str) -> Result<usize> {
        let Some(source) = self.config.sources.get(source_name) else {
            return Ok(0);
        };
        let prefix = source
            .prefix
            .resolve(source_name)
            .map(|p| format!("{}_", p));

        let mut stale = Vec::new();
        for path in list_dir(&source.basedir)? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            // Shared basedirs: only look at this source's environments
            if prefix.as_deref().is_some_and(|p| !name.starts_with(p)) {
                continue;
            }
            if self.context.is_managed(&path)?
                || matches_any(&self.config.deployment_purge_allowlist, name)?
            {
                continue;
            }
            stale.push(path);
        }
        self.sweep(stale)
    }

    fn purge_module_dirs(&self, env: &Environment) -> Result<usize> {
        let mut stale = Vec::new();
        for module_dir in env.module_dirs() {
            for path in list_dir(&env.dir.join(module_dir))? {
                if !self.context.is_managed(&path)? {
                    stale.push(path);
                }
            }
        }
        self.sweep(stale)
    }

    fn purge_environment(&self, env: &Environment) -> Result<usize> {
        if !env.dir.is_dir() {
            return Ok(0);
        }
        // Module directories and Git modules installed outside them
        let mut roots: Vec<PathBuf> = env
            .module_dirs()
            .iter()
            .map(|dir| env.dir.join(dir))
            .collect();
        roots.extend(
            env.manifest
                .git_modules
                .iter()
                .map(|(name, spec)| env.dir.join(spec.target_dir(name))),
        );

        let mut stale = Vec::new();
        let mut walker = WalkDir::new(&env.dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry?;
            let path = entry.path();
            let is_dir = entry.file_type().is_dir();

            if roots.iter().any(|root| path.starts_with(root)) {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
            // Parents of a module root
            if roots.iter().any(|root| root.starts_with(path)) {
                continue;
            }
            if self.context.is_managed(path)? {
                continue;
            }

            let relative = path
                .strip_prefix(&env.dir)
                .map_err(|e| Error::filesystem(path, e))?
                .to_string_lossy()
                .into_owned();
            if matches_any(&self.config.purge_allowlist, &relative)? {
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }
            // A directory holding allowlisted paths is swept entry by entry
            if is_dir && allows_below(&self.config.purge_allowlist, &relative) {
                continue;
            }
            stale.push(path.to_path_buf());
            if is_dir {
                walker.skip_current_dir();
            }
        }
        self.sweep(stale)
    }

    fn sweep(&self, stale: Vec<PathBuf>) -> Result<usize> {
        let count = stale.len();
        for path in stale {
            if self.options.dry_run {
                info!("Would remove {}", path.display());
                self.context.mark_needs_sync()?;
            } else {
                info!("Removing {}", path.display());
                remove_path(&path)?;
            }
        }
        Ok(count)
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} does not exist, nothing to purge", dir.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(Error::filesystem(dir, e)),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    paths.sort();
    Ok(paths)
}

fn allows_below(patterns: &[String], dir: &str) -> bool {
    let prefix = format!("{}/", dir);
    patterns.iter().any(|p| p.starts_with(&prefix))
}

fn matches_any(patterns: &[String], candidate: &str) -> Result<bool> {
    for pattern in patterns {
        if glob_match(pattern, candidate)? {
            return Ok(true);
        }
    }
    Ok(false)
}
