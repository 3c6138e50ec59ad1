//! # Git Mirror Management
//!
//! This module provides the `RepositoryManager`, the high-level interface the
//! sync phases use for everything Git: keeping one bare mirror per remote in
//! the cache and exporting resolved trees into target directories.
//!
//! ## Design
//!
//! The manager is built around the **`GitOperations`** trait, which defines
//! the primitive Git actions (mirror, resolve, archive, list). The main
//! application uses `DefaultGitOperations`, which shells out to `git` through
//! [`crate::git`]; tests inject mock implementations to simulate remotes
//! without running Git.
//!
//! ## Cache layout
//!
//! - `{cache}/modules/{sanitized-remote}`: mirror of a module remote
//! - `{cache}/environments/{sanitized-remote}`: mirror of a control repository
//!
//! A directory a tree was exported into carries a `.latest_commit` marker
//! with the commit hash it was exported from; an export whose commit matches
//! the marker is skipped.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::archive;
use crate::error::{Error, Result};
use crate::filesystem::remove_path;
use crate::git::GitAuth;
use crate::path::encode_url_path;

/// Name of the commit marker inside an exported tree.
pub const COMMIT_MARKER: &str = ".latest_commit";

/// Trait for git operations - allows mocking in tests
pub trait GitOperations: Send + Sync {
    /// Clone or update the bare mirror of `url` at `mirror`.
    fn sync_mirror(&self, url: &str, mirror: &Path, auth: &GitAuth, retry: bool) -> Result<()>;

    /// Resolve a tree-ish to a commit, `None` when it does not exist.
    fn resolve_commit(&self, mirror: &Path, tree: &str) -> Result<Option<String>>;

    /// Stream the tar export of `commit` into `consume`.
    fn archive(
        &self,
        mirror: &Path,
        commit: &str,
        consume: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()>;

    /// Branch names of the mirror.
    fn list_branches(&self, mirror: &Path) -> Result<Vec<String>>;

    /// All paths in the tree of `commit`.
    fn list_tree(&self, mirror: &Path, commit: &str) -> Result<Vec<String>>;

    /// Contents of one file at `commit`.
    fn read_file(&self, mirror: &Path, commit: &str, path: &str) -> Result<Option<String>>;
}

/// The default implementation of `GitOperations`, which uses the system's
/// `git` command.
pub struct DefaultGitOperations;

impl GitOperations for DefaultGitOperations {
    fn sync_mirror(&self, url: &str, mirror: &Path, auth: &GitAuth, retry: bool) -> Result<()> {
        crate::git::sync_mirror(url, mirror, auth, retry)
    }

    fn resolve_commit(&self, mirror: &Path, tree: &str) -> Result<Option<String>> {
        crate::git::resolve_commit(mirror, tree)
    }

    fn archive(
        &self,
        mirror: &Path,
        commit: &str,
        consume: &mut dyn FnMut(&mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        crate::git::archive(mirror, commit, consume)
    }

    fn list_branches(&self, mirror: &Path) -> Result<Vec<String>> {
        crate::git::list_branches(mirror)
    }

    fn list_tree(&self, mirror: &Path, commit: &str) -> Result<Vec<String>> {
        crate::git::list_tree(mirror, commit)
    }

    fn read_file(&self, mirror: &Path, commit: &str, path: &str) -> Result<Option<String>> {
        crate::git::read_file(mirror, commit, path)
    }
}

/// A tree-ish that exists in a mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTree {
    /// The tree-ish that matched (the primary or one of the fallbacks).
    pub tree: String,
    pub commit: String,
}

/// What exporting a tree did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOutcome {
    /// The marker already named the commit.
    Unchanged,
    /// The directory was (re)populated.
    Updated,
}

/// The main entry point for managing Git mirrors.
pub struct RepositoryManager {
    git_ops: Box<dyn GitOperations>,
    cache_root: PathBuf,
    retry: bool,
}

impl RepositoryManager {
    /// Creates a manager using the system `git`; `retry` re-clones a mirror
    /// once when updating it fails.
    pub fn new(cache_root: PathBuf, retry: bool) -> Self {
        Self::with_operations(Box::new(DefaultGitOperations), cache_root, retry)
    }

    /// Creates a manager with a custom `GitOperations` implementation.
    pub fn with_operations(
        git_ops: Box<dyn GitOperations>,
        cache_root: PathBuf,
        retry: bool,
    ) -> Self {
        Self {
            git_ops,
            cache_root,
            retry,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Mirror directory of a module remote.
    pub fn module_mirror(&self, url: &str) -> PathBuf {
        self.cache_root.join("modules").join(encode_url_path(url))
    }

    /// Mirror directory of a control repository.
    pub fn environment_mirror(&self, url: &str) -> PathBuf {
        self.cache_root
            .join("environments")
            .join(encode_url_path(url))
    }

    /// Clone or update the mirror of `url`.
    pub fn sync_mirror(&self, url: &str, mirror: &Path, auth: &GitAuth) -> Result<()> {
        debug!("Syncing mirror of {} at {}", url, mirror.display());
        self.git_ops.sync_mirror(url, mirror, auth, self.retry)
    }

    pub fn list_branches(&self, mirror: &Path) -> Result<Vec<String>> {
        self.git_ops.list_branches(mirror)
    }

    pub fn list_tree(&self, mirror: &Path, commit: &str) -> Result<Vec<String>> {
        self.git_ops.list_tree(mirror, commit)
    }

    pub fn read_file(&self, mirror: &Path, commit: &str, path: &str) -> Result<Option<String>> {
        self.git_ops.read_file(mirror, commit, path)
    }

    /// Resolve `primary`, then each of `fallback` in order, returning the
    /// first tree that exists.
    pub fn resolve_tree(
        &self,
        mirror: &Path,
        primary: &str,
        fallback: &[String],
    ) -> Result<Option<ResolvedTree>> {
        for tree in std::iter::once(primary).chain(fallback.iter().map(String::as_str)) {
            if let Some(commit) = self.git_ops.resolve_commit(mirror, tree)? {
                if tree != primary {
                    info!(
                        "{} not found in {}, using fallback {}",
                        primary,
                        mirror.display(),
                        tree
                    );
                }
                return Ok(Some(ResolvedTree {
                    tree: tree.to_string(),
                    commit,
                }));
            }
        }
        Ok(None)
    }

    /// Whether `target` needs a new export of `commit`.
    pub fn needs_export(&self, target: &Path, commit: &str) -> bool {
        read_commit_marker(target).as_deref() != Some(commit)
    }

    /// Export `commit` into `target` unless its marker already names it.
    ///
    /// A changed or missing marker purges `target`, streams `git archive`
    /// through the tar extractor (skipping `blacklist` entries) and writes
    /// the marker. `force` ignores the marker.
    pub fn export_tree(
        &self,
        mirror: &Path,
        commit: &str,
        target: &Path,
        blacklist: &[String],
        force: bool,
    ) -> Result<TreeOutcome> {
        if !force && !self.needs_export(target, commit) {
            debug!("{} already at {}", target.display(), commit);
            return Ok(TreeOutcome::Unchanged);
        }

        if target.symlink_metadata().is_ok() {
            remove_path(target)?;
        }
        self.extract_tree(mirror, commit, target, blacklist)?;
        Ok(TreeOutcome::Updated)
    }

    /// Extract `commit` over the existing contents of `target` and write the
    /// marker. Entries not in the tree are left alone.
    pub fn extract_tree(
        &self,
        mirror: &Path,
        commit: &str,
        target: &Path,
        blacklist: &[String],
    ) -> Result<()> {
        fs::create_dir_all(target).map_err(|e| Error::filesystem(target, e))?;
        self.git_ops.archive(mirror, commit, &mut |reader| {
            archive::extract_tar(reader, target, blacklist, 0).map(|_| ())
        })?;

        let marker = target.join(COMMIT_MARKER);
        fs::write(&marker, format!("{}\n", commit)).map_err(|e| Error::filesystem(&marker, e))
    }
}

/// Commit recorded in `{dir}/.latest_commit`.
pub fn read_commit_marker(dir: &Path) -> Option<String> {
    fs::read_to_string(dir.join(COMMIT_MARKER))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
