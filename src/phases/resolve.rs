//! Phase 3: Resolution
//!
//! Processes both work sets at once: Git mirrors on one rayon pool, Forge
//! releases on another, each capped at `maxworker` threads. The Forge pool
//! runs on the calling thread while a scoped thread drives the Git pool; the
//! phase returns only after both have finished, so materialization never
//! starts against a half-resolved cache.
//!
//! Errors are collected rather than short-circuiting: every item already
//! picked up runs to completion and the first error is returned afterwards.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::thread;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, warn};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::aggregate::WorkSet;
use super::RunOptions;
use crate::cache::{CachedRelease, ForgeCache};
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::repository::RepositoryManager;

/// Result of Phase 3.
#[derive(Debug, Default)]
pub struct Resolution {
    /// Cached release per Forge work key.
    pub forge: HashMap<String, CachedRelease>,
}

/// Executes Phase 3 of the pipeline.
pub fn execute(
    work: &WorkSet,
    repos: &RepositoryManager,
    forge: &ForgeCache,
    maxworker: usize,
    options: &RunOptions,
    context: &SyncContext,
) -> Result<Resolution> {
    let git_pool = build_pool(maxworker, "git")?;
    let forge_pool = build_pool(maxworker, "forge")?;

    let progress = if options.quiet {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };
    let git_bar = progress.add(progress_bar(work.git.len(), "git"));
    let forge_bar = progress.add(progress_bar(work.forge.len(), "forge"));

    let (git_result, forge_result) = thread::scope(|scope| {
        let git = scope.spawn(|| git_pool.install(|| sync_mirrors(work, repos, context, &git_bar)));
        let forge_result =
            forge_pool.install(|| resolve_releases(work, forge, context, &forge_bar));
        let git_result = git.join().unwrap_or_else(|_| {
            Err(Error::Io(io::Error::other("git resolution thread panicked")))
        });
        (git_result, forge_result)
    });

    git_result?;
    let releases = forge_result?;
    debug!("Resolved {} Forge releases", releases.len());
    Ok(Resolution { forge: releases })
}

pub(crate) fn build_pool(threads: usize, name: &'static str) -> Result<ThreadPool> {
    ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(move |i| format!("{}-{}", name, i))
        .build()
        .map_err(|e| Error::Io(io::Error::other(e)))
}

fn progress_bar(len: usize, prefix: &'static str) -> ProgressBar {
    let style = ProgressStyle::with_template("{prefix:>6} [{bar:30}] {pos}/{len} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let bar = ProgressBar::new(len as u64).with_style(style);
    bar.set_prefix(prefix);
    bar
}

fn first_error(errors: Mutex<Vec<Error>>, what: &str) -> Result<()> {
    let collected_errors = errors.into_inner().map_err(|_| Error::LockPoisoned {
        context: what.to_string(),
    })?;
    match collected_errors.into_iter().next() {
        Some(first_error) => Err(first_error),
        None => Ok(()),
    }
}

fn push_error(errors: &Mutex<Vec<Error>>, error: Error) {
    if let Ok(mut errors) = errors.lock() {
        errors.push(error);
    }
}

fn sync_mirrors(
    work: &WorkSet,
    repos: &RepositoryManager,
    context: &SyncContext,
    bar: &ProgressBar,
) -> Result<()> {
    let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());

    work.git.par_iter().for_each(|(url, item)| {
        bar.set_message(url.clone());
        let mirror = repos.module_mirror(url);
        let outcome = match repos.sync_mirror(url, &mirror, &item.auth) {
            Ok(()) => context.record(|s| s.mirrors_synced += 1),
            Err(e) if item.allow_fail && e.is_transient() => {
                warn!("{} (declared by {}), continuing: {}", url, item.origin, e);
                context.record(|s| s.unreachable.push(url.clone()))
            }
            Err(e) => Err(e),
        };
        bar.inc(1);
        if let Err(e) = outcome {
            push_error(&errors, e);
        }
    });

    bar.finish_and_clear();
    first_error(errors, "git resolution errors")
}

fn resolve_releases(
    work: &WorkSet,
    forge: &ForgeCache,
    context: &SyncContext,
    bar: &ProgressBar,
) -> Result<HashMap<String, CachedRelease>> {
    let keys = work.forge_keys();
    let errors: Mutex<Vec<Error>> = Mutex::new(Vec::new());
    let releases: Mutex<HashMap<String, CachedRelease>> = Mutex::new(HashMap::new());

    work.forge.par_iter().for_each(|(key, spec)| {
        bar.set_message(key.clone());
        let outcome = forge.resolve(spec, &keys, context).and_then(|release| {
            releases
                .lock()
                .map_err(|_| Error::LockPoisoned {
                    context: "resolved releases".to_string(),
                })?
                .insert(key.clone(), release);
            Ok(())
        });
        bar.inc(1);
        if let Err(e) = outcome {
            push_error(&errors, e);
        }
    });

    bar.finish_and_clear();
    first_error(errors, "forge resolution errors")?;
    releases.into_inner().map_err(|_| Error::LockPoisoned {
        context: "resolved releases".to_string(),
    })
}
